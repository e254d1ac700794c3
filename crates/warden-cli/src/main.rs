//! Warden CLI - Command-line shell over the custody core
//!
//! Each invocation is a fresh process, so every session starts `Locked`
//! (or `NoWallet`). Commands that need the secret take the PIN with `--pin`
//! or prompt for it on stdin.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use warden_core::{
    AuthState, FileStore, LockoutPolicy, Session, SessionState, UnlockCredential, WardenConfig,
};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "PIN-gated self-custodial wallet", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON-RPC endpoint for deployment checks
    #[arg(long)]
    rpc_url: Option<String>,

    /// Active chain id
    #[arg(long)]
    chain_id: Option<u64>,

    /// PIN (prompted on stdin when omitted)
    #[arg(long)]
    pin: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the session state
    Status,

    /// Create a wallet with a fresh 12-word mnemonic
    Create,

    /// Import a mnemonic or a hex private key
    Import {
        /// Secret material (read from stdin when omitted)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Check the PIN and show the unlocked address
    Unlock,

    /// Show the owner and smart account addresses
    Address,

    /// Query the chain for the smart account deployment
    Refresh,

    /// Print the smart account initCode
    InitCode,

    /// Re-seal the wallet under a new PIN
    ChangePin {
        /// New PIN
        #[arg(long)]
        new_pin: Option<String>,
    },

    /// Set the auto-lock duration
    SetAutoLock {
        /// Duration in milliseconds
        duration_ms: u64,
    },

    /// Erase the wallet from this device
    Delete {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Write the effective configuration to the config path
    WriteConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,warden_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(WardenConfig::default_config_path);
    let mut config = WardenConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(data_dir) = cli.data_dir.clone() {
        config.data_dir = data_dir;
    }
    if let Some(rpc_url) = cli.rpc_url.clone() {
        config.rpc_url = Some(rpc_url);
    }
    if let Some(chain_id) = cli.chain_id {
        config.chain_id = chain_id;
    }

    let store = Arc::new(FileStore::new(config.data_dir.clone())?);
    let session = Session::new(config, store, None, None)?;
    let state = session.initialize().await?;
    info!("Session {}", state.state);

    match cli.command {
        Commands::Status => print_state(&state, &session.config().lockout),

        Commands::Create => {
            let pin = read_pin(cli.pin, "PIN")?;
            let created = session.create_wallet(&pin, None).await?;

            println!("\n=== Wallet Created ===\n");
            println!("Address: {}", created.address);
            if let Some(mnemonic) = created.mnemonic {
                println!("\n⚠️  Write down the recovery phrase, then clear your terminal.\n");
                println!("{}", mnemonic.as_str());
            }
        }

        Commands::Import { secret } => {
            let secret = match secret {
                Some(secret) => Zeroizing::new(secret),
                None => prompt("Mnemonic or private key")?,
            };
            let pin = read_pin(cli.pin, "PIN")?;
            let address = session.import_wallet(&pin, &secret).await?;
            println!("Imported wallet {}", address);
        }

        Commands::Unlock => {
            let pin = read_pin(cli.pin, "PIN")?;
            let result = session.unlock(UnlockCredential::Pin(&pin)).await?;
            let address = session.with_decrypted_key(|key| key.address()).await?;
            if address != result.address {
                bail!("Decrypted key does not match the stored address");
            }
            println!("Unlocked {}", result.address);
            session.lock().await;
        }

        Commands::Address => {
            let state = session.get_auth_state().await;
            match state.address {
                Some(address) => println!("Owner:         {}", address),
                None => bail!("No wallet on this device"),
            }
            if let Some(account) = state.smart_account_address {
                let deployed = if session.is_smart_account_deployed().await {
                    "deployed"
                } else {
                    "not deployed"
                };
                println!("Smart account: {} ({})", account, deployed);
            }
        }

        Commands::Refresh => {
            let deployed = session.refresh_smart_account().await?;
            let account = session.get_smart_account_address().await;
            match (account, deployed) {
                (Some(account), true) => println!("{} is deployed", account),
                (Some(account), false) => println!("{} is not deployed yet", account),
                (None, _) => println!("No smart account"),
            }
        }

        Commands::InitCode => {
            let code = session.smart_account_init_code().await?;
            println!("0x{}", hex::encode(code));
        }

        Commands::ChangePin { new_pin } => {
            let current = read_pin(cli.pin, "Current PIN")?;
            session.unlock(UnlockCredential::Pin(&current)).await?;
            let new_pin = read_pin(new_pin, "New PIN")?;
            session.change_pin(&current, &new_pin).await?;
            session.lock().await;
            println!("PIN changed");
        }

        Commands::SetAutoLock { duration_ms } => {
            session.set_auto_lock_duration(duration_ms).await?;
            println!("Auto-lock set to {}ms", duration_ms);
        }

        Commands::Delete { yes } => {
            if state.state == SessionState::NoWallet {
                println!("No wallet on this device");
                return Ok(());
            }
            if !yes {
                let answer = prompt("Type 'delete' to erase the wallet")?;
                if answer.trim() != "delete" {
                    println!("Aborted");
                    return Ok(());
                }
            }

            let outcome = session.delete_wallet().await;
            if let Some(warning) = outcome.warning {
                warn!("Some records could not be erased: {}", warning);
                println!("Wallet deleted with warnings: {}", warning);
            } else {
                println!("Wallet deleted");
            }
        }

        Commands::WriteConfig => {
            session.config().save(&config_path)?;
            println!("Configuration written to {:?}", config_path);
        }
    }

    Ok(())
}

fn print_state(state: &AuthState, lockout: &LockoutPolicy) {
    println!("State:           {}", state.state);
    if let Some(address) = state.address {
        println!("Address:         {}", address);
    }
    if let Some(account) = state.smart_account_address {
        println!("Smart account:   {}", account);
    }
    println!("Chain:           {}", state.active_chain_id);
    println!("Auto-lock:       {}ms", state.auto_lock_duration_ms);
    println!("Biometric:       {}", state.biometric_enabled);
    if state.failed_attempt_count > 0 {
        println!(
            "Failed attempts: {} ({})",
            state.failed_attempt_count,
            lockout.describe(state.failed_attempt_count)
        );
    }
    if let Some(until) = state.lockout_until {
        println!("Locked out until {}", until.to_rfc3339());
    }
}

fn read_pin(pin: Option<String>, label: &str) -> Result<Zeroizing<String>> {
    match pin {
        Some(pin) => Ok(Zeroizing::new(pin)),
        None => prompt(label),
    }
}

fn prompt(label: &str) -> Result<Zeroizing<String>> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line)?;
    Ok(Zeroizing::new(line.trim().to_owned()))
}
