//! Custody configuration
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::KdfParams;
use crate::error::{AuthError, Result, WardenError};
use crate::lockout::LockoutPolicy;
use crate::types::Address;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "warden.toml";

/// Data directory name under the platform data dir
const DATA_DIR_NAME: &str = "warden";

/// Default auto-lock duration (5 minutes)
pub const DEFAULT_AUTO_LOCK_MS: u64 = 300_000;

/// Lisk Sepolia
pub const DEFAULT_CHAIN_ID: u64 = 4202;

/// Accepted PIN shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinPolicy {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            min_length: 6,
            max_length: 6,
        }
    }
}

impl PinPolicy {
    /// Validate PIN format
    pub fn validate(&self, pin: &str) -> std::result::Result<(), AuthError> {
        if pin.len() < self.min_length || pin.len() > self.max_length {
            return Err(AuthError::InvalidPinLength(self.min_length, self.max_length));
        }

        if !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(AuthError::InvalidPinFormat);
        }

        Ok(())
    }
}

/// Top-level configuration for a custody session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Auto-lock duration applied to newly created wallets
    pub auto_lock_ms: u64,

    /// How long the app may sit in the background before locking.
    /// Zero locks the moment the app is backgrounded.
    pub background_grace_ms: u64,

    /// Activity pings closer together than this are coalesced
    pub activity_debounce_ms: u64,

    /// Deadline for a single KDF-bound vault operation
    pub kdf_timeout_ms: u64,

    /// Active network
    pub chain_id: u64,

    /// Smart account factory override (otherwise taken from the chain table)
    pub factory: Option<Address>,

    /// CREATE2 salt used for the smart account
    pub account_salt: u64,

    /// JSON-RPC endpoint for deployment checks
    pub rpc_url: Option<String>,

    /// Root directory of the file-backed secure store
    pub data_dir: PathBuf,

    /// KDF parameters for newly written vaults
    pub kdf: KdfParams,

    /// Failed-attempt lockout
    pub lockout: LockoutPolicy,

    /// Accepted PIN shape
    pub pin: PinPolicy,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            auto_lock_ms: DEFAULT_AUTO_LOCK_MS,
            background_grace_ms: 0,
            activity_debounce_ms: 250,
            kdf_timeout_ms: 30_000,
            chain_id: DEFAULT_CHAIN_ID,
            factory: None,
            account_salt: 0,
            rpc_url: None,
            data_dir: Self::default_data_dir(),
            kdf: KdfParams::default(),
            lockout: LockoutPolicy::default(),
            pin: PinPolicy::default(),
        }
    }
}

impl WardenConfig {
    /// Cheap KDF and no debounce, for test suites
    pub fn testing() -> Self {
        Self {
            kdf: KdfParams::testing(),
            activity_debounce_ms: 0,
            ..Default::default()
        }
    }

    /// Get the default data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DATA_DIR_NAME)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WardenError::Config(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| WardenError::Config(format!("Failed to write {:?}: {}", path, e)))?;
        Ok(())
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.auto_lock_ms == 0 {
            return Err(WardenError::Config("auto_lock_ms must be positive".into()));
        }
        if self.kdf_timeout_ms == 0 {
            return Err(WardenError::Config("kdf_timeout_ms must be positive".into()));
        }
        if self.lockout.threshold == 0 {
            return Err(WardenError::Config("lockout.threshold must be positive".into()));
        }
        if self.pin.min_length == 0 || self.pin.min_length > self.pin.max_length {
            return Err(WardenError::Config("pin length bounds are inconsistent".into()));
        }
        Ok(())
    }

    pub fn auto_lock(&self) -> Duration {
        Duration::from_millis(self.auto_lock_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }

    pub fn activity_debounce(&self) -> Duration {
        Duration::from_millis(self.activity_debounce_ms)
    }

    pub fn kdf_timeout(&self) -> Duration {
        Duration::from_millis(self.kdf_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.auto_lock_ms, 300_000);
        assert_eq!(config.background_grace_ms, 0);
        assert_eq!(config.lockout.threshold, 5);
        assert_eq!(config.chain_id, 4202);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pin_policy() {
        let policy = PinPolicy::default();
        assert!(policy.validate("123456").is_ok());
        assert_eq!(policy.validate("12345"), Err(AuthError::InvalidPinLength(6, 6)));
        assert_eq!(policy.validate("1234567"), Err(AuthError::InvalidPinLength(6, 6)));
        assert_eq!(policy.validate("12345a"), Err(AuthError::InvalidPinFormat));
    }

    #[test]
    fn test_partial_toml() {
        let config: WardenConfig = toml::from_str(
            r#"
            auto_lock_ms = 60000
            background_grace_ms = 1500

            [lockout]
            threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.auto_lock_ms, 60_000);
        assert_eq!(config.background_grace(), Duration::from_millis(1500));
        assert_eq!(config.lockout.threshold, 3);
        assert_eq!(config.lockout.base_backoff_secs, 30);
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.toml");

        let mut config = WardenConfig::testing();
        config.rpc_url = Some("http://localhost:8545".into());
        config.save(&path).unwrap();

        let loaded = WardenConfig::load(&path).unwrap();
        assert_eq!(loaded.rpc_url.as_deref(), Some("http://localhost:8545"));
        assert_eq!(loaded.kdf, KdfParams::testing());
    }

    #[test]
    fn test_invalid_rejected() {
        let config = WardenConfig {
            auto_lock_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
