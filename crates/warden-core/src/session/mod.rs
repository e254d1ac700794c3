//! Custody session state machine
//!
//! ```text
//! Uninitialized -> NoWallet | Locked
//! NoWallet -> Authenticated                (create / import)
//! Locked -> Unlocking -> Authenticated | Locked
//! Authenticated -> Locked                  (lock, auto-lock)
//! any -> Deleting -> NoWallet
//! ```
//!
//! The session is an explicit object owned by the application root; there is
//! no global instance. All mutable state sits behind one async mutex that is
//! never held across a KDF run or a network call. `Unlocking` doubles as the
//! unlock mutex: a second concurrent unlock fails with `Busy`.
//!
//! Every transition into `Authenticated` and every lock bumps a generation
//! counter. Results that come back from the KDF after the generation moved
//! on (the session was locked or deleted meanwhile) are discarded. Store
//! writes that depend on a KDF result happen under the session lock after
//! that check, never from the blocking task.

mod attempts;
mod state;

pub use state::{
    AuthResult, AuthState, CreatedWallet, DeleteOutcome, SessionEvent, SessionState,
    UnlockCredential, UnlockMethod,
};

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use self::attempts::FailedAttempts;
use crate::autolock::{AppLifecycle, AutoLockMonitor, AutoLockPolicy, LockReason, LockTarget};
use crate::biometric::BiometricProvider;
use crate::cipher::DerivedKey;
use crate::config::WardenConfig;
use crate::error::{AuthError, Result, StorageError, WardenError};
use crate::metadata::WalletMetadata;
use crate::secret::{OwnerKey, SecretMaterial};
use crate::smart_account::{ChainClient, FactoryConfig, JsonRpcClient, SmartAccountResolver};
use crate::store::SecureStore;
use crate::types::Address;
use crate::vault::CredentialVault;

/// Event channel capacity
const EVENT_CAPACITY: usize = 32;

struct Inner {
    state: SessionState,
    /// Public wallet fields, mirrored to the metadata record
    metadata: WalletMetadata,
    attempts: FailedAttempts,
    last_unlock_time: Option<DateTime<Utc>>,
    /// Encryption key, held only while `Authenticated`
    key: Option<DerivedKey>,
    generation: u64,
}

struct Shared {
    config: WardenConfig,
    vault: Arc<CredentialVault>,
    biometric: Option<Arc<dyn BiometricProvider>>,
    resolver: Option<SmartAccountResolver>,
    inner: Mutex<Inner>,
    /// Serializes create/import/change-PIN
    provisioning: Mutex<()>,
    monitor: AutoLockMonitor,
    events: broadcast::Sender<SessionEvent>,
}

/// The custody session
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Build a session over `store`.
    ///
    /// Spawns the auto-lock task, so this must be called from within a Tokio
    /// runtime. When no chain client is given but `config.rpc_url` is set, a
    /// JSON-RPC client is created for deployment probes.
    pub fn new(
        config: WardenConfig,
        store: Arc<dyn SecureStore>,
        biometric: Option<Arc<dyn BiometricProvider>>,
        chain_client: Option<Arc<dyn ChainClient>>,
    ) -> Result<Self> {
        config.validate()?;

        let chain_client = chain_client.or_else(|| {
            config
                .rpc_url
                .as_ref()
                .map(|url| Arc::new(JsonRpcClient::new(url.clone())) as Arc<dyn ChainClient>)
        });

        let resolver = match FactoryConfig::from_config(&config) {
            Ok(factory) => Some(SmartAccountResolver::new(factory, chain_client)),
            Err(e) => {
                warn!("Smart accounts disabled: {}", e);
                None
            }
        };

        let vault = Arc::new(CredentialVault::new(store, config.kdf));
        let policy = AutoLockPolicy {
            background_grace: config.background_grace(),
            activity_debounce: config.activity_debounce(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut metadata = WalletMetadata::empty(config.chain_id);
        metadata.auto_lock_duration_ms = config.auto_lock_ms;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let target: Weak<dyn LockTarget> = weak.clone();
            Shared {
                vault,
                biometric,
                resolver,
                inner: Mutex::new(Inner {
                    state: SessionState::Uninitialized,
                    metadata,
                    attempts: FailedAttempts::default(),
                    last_unlock_time: None,
                    key: None,
                    generation: 0,
                }),
                provisioning: Mutex::new(()),
                monitor: AutoLockMonitor::spawn(target, policy),
                events,
                config,
            }
        });

        Ok(Self { shared })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.shared.config
    }

    /// Subscribe to state changes and auto-lock notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Inspect storage: `Locked` if a sealed secret exists, `NoWallet`
    /// otherwise. A persisted lockout is restored. Never decrypts.
    pub async fn initialize(&self) -> Result<AuthState> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if inner.state != SessionState::Uninitialized {
            return Ok(shared.snapshot(&inner));
        }

        let exists = shared.vault.exists()?;
        let metadata = match shared.vault.metadata() {
            Ok(metadata) => metadata,
            Err(WardenError::Storage(StorageError::Corrupt(reason))) => {
                warn!("Ignoring unreadable wallet metadata: {}", reason);
                None
            }
            Err(e) => return Err(e),
        };

        if exists {
            let mut metadata = metadata.unwrap_or_else(|| shared.empty_metadata());
            metadata.has_wallet = true;
            inner.attempts = FailedAttempts::restore(
                metadata.failed_attempts,
                metadata.last_failed_at,
                &shared.config.lockout,
            );
            inner.metadata = metadata;
            shared.transition(&mut inner, SessionState::Locked);
        } else {
            if metadata.is_some_and(|m| m.has_wallet) {
                warn!("Wallet metadata present without a sealed secret, treating device as empty");
            }
            inner.metadata = shared.empty_metadata();
            shared.transition(&mut inner, SessionState::NoWallet);
        }

        Ok(shared.snapshot(&inner))
    }

    /// Create a wallet from `secret`, or from a freshly generated mnemonic.
    ///
    /// On success the session is `Authenticated` and the generated mnemonic
    /// (if any) is handed back once for backup.
    pub async fn create_wallet(
        &self,
        pin: &str,
        secret: Option<SecretMaterial>,
    ) -> Result<CreatedWallet> {
        self.ensure_initialized().await?;
        let shared = &self.shared;
        shared.config.pin.validate(pin)?;

        let _provisioning = shared
            .provisioning
            .try_lock()
            .map_err(|_| AuthError::Busy)?;

        let generation = {
            let inner = shared.inner.lock().await;
            match inner.state {
                SessionState::NoWallet => {}
                SessionState::Locked | SessionState::Authenticated => {
                    return Err(AuthError::WalletExists.into())
                }
                SessionState::Uninitialized | SessionState::Unlocking | SessionState::Deleting => {
                    return Err(AuthError::Busy.into())
                }
            }
            inner.generation
        };

        let generated = secret.is_none();
        let secret = match secret {
            Some(secret) => secret,
            None => SecretMaterial::generate()?,
        };

        let pin = Zeroizing::new(pin.to_owned());
        let (secret, record, key, address) = shared
            .run_vault(move |vault| {
                let address = secret.owner_key()?.address();
                let (record, key) = vault.encrypt(secret.as_bytes(), &pin)?;
                Ok((secret, record, key, address))
            })
            .await?;

        // Records are only written under the session lock, so a delete that
        // ran during the KDF cannot be undone by this call
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::NoWallet {
            warn!("Wallet creation overtaken by delete, discarding");
            return Err(AuthError::Cancelled.into());
        }

        shared.vault.store_record(&record)?;

        let mut metadata =
            WalletMetadata::new(address, shared.config.chain_id, shared.config.auto_lock_ms);
        metadata.smart_account_address = shared.resolver.as_ref().map(|r| r.resolve(&address));

        if let Err(e) = shared.vault.save_metadata(&metadata) {
            error!("Failed to write wallet metadata, rolling back: {}", e);
            if let Err(erase) = shared.vault.erase() {
                warn!("Rollback erase failed: {}", erase);
            }
            return Err(e);
        }

        inner.metadata = metadata;
        shared.authenticate(&mut inner, key, address);
        info!("Created wallet {}", address);

        Ok(CreatedWallet {
            address,
            mnemonic: generated.then(|| Zeroizing::new(secret.expose().to_owned())),
        })
    }

    /// Import an existing mnemonic or private key
    pub async fn import_wallet(&self, pin: &str, material: &str) -> Result<Address> {
        let secret = SecretMaterial::parse(material)?;
        self.create_wallet(pin, Some(secret))
            .await
            .map(|created| created.address)
    }

    /// Authenticate with a PIN or the biometric prompt.
    ///
    /// While already `Authenticated` the credential is checked again and the
    /// session stays unlocked: a wrong PIN fails and counts towards lockout,
    /// a correct one leaves `last_unlock_time` alone.
    pub async fn unlock(&self, credential: UnlockCredential<'_>) -> Result<AuthResult> {
        self.ensure_initialized().await?;
        let shared = &self.shared;

        let method = match credential {
            UnlockCredential::Pin(pin) => {
                shared.config.pin.validate(pin)?;
                UnlockMethod::Pin
            }
            UnlockCredential::Biometric => UnlockMethod::Biometric,
        };

        let (generation, confirming) = {
            let mut inner = shared.inner.lock().await;
            let confirming = match inner.state {
                SessionState::Locked => false,
                // Credential is checked again; the session stays unlocked
                SessionState::Authenticated => true,
                SessionState::Unlocking | SessionState::Deleting => {
                    return Err(AuthError::Busy.into())
                }
                SessionState::NoWallet | SessionState::Uninitialized => {
                    return Err(AuthError::NotFound.into())
                }
            };

            if let Err(e) = inner.attempts.check() {
                debug!("Unlock refused: {}", e);
                return Err(e.into());
            }
            if method == UnlockMethod::Biometric && !inner.metadata.biometric_enabled {
                return Err(AuthError::BiometricNotEnrolled.into());
            }

            if !confirming {
                shared.transition(&mut inner, SessionState::Unlocking);
            }
            (inner.generation, confirming)
        };

        let outcome = match credential {
            UnlockCredential::Pin(pin) => {
                let pin = Zeroizing::new(pin.to_owned());
                shared
                    .run_vault(move |vault| {
                        let (plaintext, key) = vault.get_with_key(&pin)?;
                        let address = SecretMaterial::from_plaintext(&plaintext)?
                            .owner_key()?
                            .address();
                        Ok((key, address))
                    })
                    .await
            }
            UnlockCredential::Biometric => shared.biometric_key().await,
        };

        if confirming {
            shared.finish_confirm(generation, outcome, method).await
        } else {
            shared.finish_unlock(generation, outcome, method).await
        }
    }

    /// Shorthand for `unlock(UnlockCredential::Pin(pin))`
    pub async fn unlock_with_pin(&self, pin: &str) -> Result<AuthResult> {
        self.unlock(UnlockCredential::Pin(pin)).await
    }

    /// Lock immediately. A no-op unless `Authenticated` or `Unlocking`; an
    /// in-flight unlock is discarded.
    pub async fn lock(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.lock_inner(&mut inner);
    }

    /// Erase the wallet. Always ends in `NoWallet`; storage failures come
    /// back as a warning.
    pub async fn delete_wallet(&self) -> DeleteOutcome {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        inner.key = None;
        inner.generation += 1;
        shared.monitor.stop();
        shared.transition(&mut inner, SessionState::Deleting);

        let warning = match shared.vault.erase() {
            Ok(()) => None,
            Err(e) => {
                warn!("Wallet erase incomplete: {}", e);
                Some(e)
            }
        };

        inner.metadata = shared.empty_metadata();
        inner.attempts.reset();
        inner.last_unlock_time = None;
        shared.transition(&mut inner, SessionState::NoWallet);
        info!("Wallet deleted");

        DeleteOutcome { warning }
    }

    /// Read-only snapshot
    pub async fn get_auth_state(&self) -> AuthState {
        let inner = self.shared.inner.lock().await;
        self.shared.snapshot(&inner)
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn get_smart_account_address(&self) -> Option<Address> {
        self.shared.inner.lock().await.metadata.smart_account_address
    }

    /// Last known deployment flag (best effort)
    pub async fn is_smart_account_deployed(&self) -> bool {
        self.shared
            .inner
            .lock()
            .await
            .metadata
            .is_smart_account_deployed
    }

    /// Probe the chain for the smart account. Session state is untouched
    /// whatever the outcome; the flag is persisted best-effort.
    pub async fn refresh_smart_account(&self) -> Result<bool> {
        let shared = &self.shared;
        let resolver = shared.resolver.as_ref().ok_or_else(|| {
            WardenError::Config(format!(
                "No smart account factory for chain {}",
                shared.config.chain_id
            ))
        })?;

        let account = {
            let inner = shared.inner.lock().await;
            inner
                .metadata
                .smart_account_address
                .ok_or(AuthError::NotFound)?
        };

        let deployed = resolver.refresh(&account).await?;

        let mut inner = shared.inner.lock().await;
        if inner.metadata.smart_account_address == Some(account)
            && inner.metadata.is_smart_account_deployed != deployed
        {
            inner.metadata.is_smart_account_deployed = deployed;
            if deployed {
                let _ = shared.events.send(SessionEvent::SmartAccountDeployed(account));
            }
            shared.persist(&mut inner);
        }

        Ok(deployed)
    }

    /// ERC-4337 `initCode` for deploying the smart account
    pub async fn smart_account_init_code(&self) -> Result<Vec<u8>> {
        let resolver = self.shared.resolver.as_ref().ok_or_else(|| {
            WardenError::Config("Smart accounts are not configured".into())
        })?;
        let owner = self
            .shared
            .inner
            .lock()
            .await
            .metadata
            .address
            .ok_or(AuthError::NotFound)?;
        Ok(resolver.init_code(&owner))
    }

    /// Run `f` with the owner key for one signing operation.
    ///
    /// Only available while `Authenticated`. The key is decrypted for the
    /// call and dropped (zeroized) before this returns; the session holds its
    /// lock meanwhile, so a concurrent `lock()` waits for the callback.
    pub async fn with_decrypted_key<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&OwnerKey) -> R,
    {
        let shared = &self.shared;
        let inner = shared.inner.lock().await;
        if inner.state != SessionState::Authenticated {
            return Err(AuthError::NotAuthenticated.into());
        }
        let key = inner.key.as_ref().ok_or(AuthError::NotAuthenticated)?;

        let owner = {
            let plaintext = shared.vault.open(key)?;
            SecretMaterial::from_plaintext(&plaintext)?.owner_key()?
        };

        shared.monitor.activity();
        Ok(f(&owner))
    }

    /// Re-seal the secret under `new_pin` with a fresh salt
    pub async fn change_pin(&self, current_pin: &str, new_pin: &str) -> Result<()> {
        let shared = &self.shared;
        shared.config.pin.validate(current_pin)?;
        shared.config.pin.validate(new_pin)?;

        let _provisioning = shared
            .provisioning
            .try_lock()
            .map_err(|_| AuthError::Busy)?;

        let generation = {
            let inner = shared.inner.lock().await;
            if inner.state != SessionState::Authenticated {
                return Err(AuthError::NotAuthenticated.into());
            }
            inner.attempts.check()?;
            inner.generation
        };

        let current = Zeroizing::new(current_pin.to_owned());
        let new = Zeroizing::new(new_pin.to_owned());
        let outcome = shared
            .run_vault(move |vault| {
                let plaintext = vault.get(&current)?;
                vault.encrypt(&plaintext, &new)
            })
            .await;

        let mut inner = shared.inner.lock().await;
        let (record, key) = match outcome {
            Ok(sealed) => sealed,
            Err(WardenError::Auth(AuthError::WrongPin { .. })) if inner.state.has_wallet() => {
                return Err(shared.wrong_pin(&mut inner).into())
            }
            Err(e) => return Err(e),
        };

        if inner.generation != generation || inner.state != SessionState::Authenticated {
            debug!("PIN change overtaken by lock or delete, keeping the old record");
            return Err(AuthError::Cancelled.into());
        }

        shared.vault.store_record(&record)?;
        if inner.metadata.biometric_enabled {
            if let Err(e) = shared.vault.put_biometric_key(&key) {
                warn!("Could not re-wrap biometric key, disabling biometric unlock: {}", e);
                let _ = shared.vault.erase_biometric_key();
                inner.metadata.biometric_enabled = false;
                shared.persist(&mut inner);
            }
        }

        inner.key = Some(key);
        info!("PIN changed");
        Ok(())
    }

    /// Enroll biometric unlock. Requires `Authenticated` and the PIN.
    pub async fn enable_biometric(&self, pin: &str) -> Result<()> {
        let shared = &self.shared;
        shared.config.pin.validate(pin)?;

        let provider = shared
            .biometric
            .as_ref()
            .filter(|provider| provider.is_available())
            .ok_or(AuthError::BiometricUnavailable)?;

        let generation = {
            let inner = shared.inner.lock().await;
            if inner.state != SessionState::Authenticated {
                return Err(AuthError::NotAuthenticated.into());
            }
            inner.attempts.check()?;
            inner.generation
        };

        if !provider.prompt("Enable biometric unlock").await {
            return Err(AuthError::BiometricRejected.into());
        }

        let pin = Zeroizing::new(pin.to_owned());
        let outcome = shared
            .run_vault(move |vault| vault.get_with_key(&pin).map(|(_, key)| key))
            .await;

        let mut inner = shared.inner.lock().await;
        let key = match outcome {
            Ok(key) => key,
            Err(WardenError::Auth(AuthError::WrongPin { .. })) if inner.state.has_wallet() => {
                return Err(shared.wrong_pin(&mut inner).into())
            }
            Err(e) => return Err(e),
        };

        if inner.generation != generation || inner.state != SessionState::Authenticated {
            debug!("Biometric enrollment overtaken by lock or delete, discarding");
            return Err(AuthError::Cancelled.into());
        }

        shared.vault.put_biometric_key(&key)?;
        inner.metadata.biometric_enabled = true;
        shared.vault.save_metadata(&inner.metadata)?;
        info!("Biometric unlock enabled");
        Ok(())
    }

    /// Remove biometric enrollment
    pub async fn disable_biometric(&self) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if !inner.state.has_wallet() {
            return Err(AuthError::NotFound.into());
        }

        shared.vault.erase_biometric_key()?;
        inner.metadata.biometric_enabled = false;
        shared.vault.save_metadata(&inner.metadata)?;
        info!("Biometric unlock disabled");
        Ok(())
    }

    /// Persist a new auto-lock duration and retime a running timer
    pub async fn set_auto_lock_duration(&self, duration_ms: u64) -> Result<()> {
        if duration_ms == 0 {
            return Err(WardenError::Config("auto-lock duration must be positive".into()));
        }

        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if !inner.state.has_wallet() {
            return Err(AuthError::NotFound.into());
        }

        inner.metadata.auto_lock_duration_ms = duration_ms;
        shared.vault.save_metadata(&inner.metadata)?;
        shared.monitor.set_duration(Duration::from_millis(duration_ms));
        debug!("Auto-lock duration set to {}ms", duration_ms);
        Ok(())
    }

    /// Deliver an app lifecycle signal; returns once it has been processed
    pub async fn app_lifecycle(&self, signal: AppLifecycle) {
        self.shared.monitor.lifecycle(signal).await;
    }

    /// Note user interaction (fire-and-forget)
    pub fn record_activity(&self) {
        self.shared.monitor.activity();
    }

    /// Wait until every queued lifecycle signal and activity ping is handled
    pub async fn settle(&self) {
        self.shared.monitor.settle().await;
    }

    /// KDF runs performed by this session's vault
    pub fn kdf_invocations(&self) -> u64 {
        self.shared.vault.kdf_invocations()
    }

    async fn ensure_initialized(&self) -> Result<()> {
        let uninitialized = self.shared.inner.lock().await.state == SessionState::Uninitialized;
        if uninitialized {
            self.initialize().await?;
        }
        Ok(())
    }
}

impl Shared {
    fn empty_metadata(&self) -> WalletMetadata {
        let mut metadata = WalletMetadata::empty(self.config.chain_id);
        metadata.auto_lock_duration_ms = self.config.auto_lock_ms;
        metadata
    }

    fn snapshot(&self, inner: &Inner) -> AuthState {
        AuthState {
            state: inner.state,
            has_wallet: inner.state.has_wallet(),
            is_authenticated: inner.state == SessionState::Authenticated,
            last_unlock_time: inner.last_unlock_time,
            auto_lock_duration_ms: inner.metadata.auto_lock_duration_ms,
            biometric_enabled: inner.metadata.biometric_enabled,
            failed_attempt_count: inner.attempts.count(),
            lockout_until: inner.attempts.lockout_until(),
            address: inner.metadata.address,
            smart_account_address: inner.metadata.smart_account_address,
            active_chain_id: inner.metadata.active_chain_id,
        }
    }

    fn transition(&self, inner: &mut Inner, to: SessionState) {
        let from = std::mem::replace(&mut inner.state, to);
        if from != to {
            info!("Session {} -> {}", from, to);
            let _ = self.events.send(SessionEvent::StateChanged { from, to });
        }
    }

    /// Enter `Authenticated` and arm the auto-lock timer
    fn authenticate(&self, inner: &mut Inner, key: DerivedKey, address: Address) {
        let mut dirty = inner.attempts.count() > 0 || inner.metadata.last_failed_at.is_some();

        if inner.metadata.address != Some(address) {
            inner.metadata.address = Some(address);
            dirty = true;
        }
        if inner.metadata.smart_account_address.is_none() {
            if let Some(resolver) = &self.resolver {
                inner.metadata.smart_account_address = Some(resolver.resolve(&address));
                dirty = true;
            }
        }

        inner.key = Some(key);
        inner.attempts.reset();
        inner.last_unlock_time = Some(Utc::now());
        inner.generation += 1;
        self.transition(inner, SessionState::Authenticated);

        if dirty {
            self.persist(inner);
        }

        self.monitor.start(
            Duration::from_millis(inner.metadata.auto_lock_duration_ms),
            inner.generation,
        );
    }

    fn lock_inner(&self, inner: &mut Inner) -> bool {
        match inner.state {
            SessionState::Authenticated | SessionState::Unlocking => {
                inner.key = None;
                inner.generation += 1;
                self.monitor.stop();
                self.transition(inner, SessionState::Locked);
                true
            }
            _ => false,
        }
    }

    async fn finish_unlock(
        &self,
        generation: u64,
        outcome: Result<(DerivedKey, Address)>,
        method: UnlockMethod,
    ) -> Result<AuthResult> {
        let mut inner = self.inner.lock().await;
        let current = inner.generation == generation && inner.state == SessionState::Unlocking;

        match outcome {
            Ok((key, address)) => {
                if !current {
                    debug!("Discarding unlock result after lock or delete");
                    return Err(AuthError::Cancelled.into());
                }
                self.authenticate(&mut inner, key, address);
                info!("Unlocked with {:?}", method);
                Ok(AuthResult { address, method })
            }
            Err(WardenError::Auth(AuthError::WrongPin { .. })) => {
                let err = if inner.state.has_wallet() {
                    self.wrong_pin(&mut inner)
                } else {
                    AuthError::WrongPin { remaining: 0 }
                };
                if current {
                    self.transition(&mut inner, SessionState::Locked);
                }
                Err(err.into())
            }
            Err(e) => {
                if current {
                    self.transition(&mut inner, SessionState::Locked);
                }
                warn!("Unlock failed: {}", e);
                Err(e)
            }
        }
    }

    /// Settle a credential check made while already `Authenticated`. The
    /// session stays unlocked whatever the outcome.
    async fn finish_confirm(
        &self,
        generation: u64,
        outcome: Result<(DerivedKey, Address)>,
        method: UnlockMethod,
    ) -> Result<AuthResult> {
        let mut inner = self.inner.lock().await;
        let current = inner.generation == generation && inner.state == SessionState::Authenticated;

        match outcome {
            Ok((_, address)) => {
                if !current {
                    debug!("Discarding confirmation after lock or delete");
                    return Err(AuthError::Cancelled.into());
                }
                if inner.attempts.count() > 0 {
                    inner.attempts.reset();
                    self.persist(&mut inner);
                }
                self.monitor.activity();
                debug!("Credential confirmed with {:?}", method);
                Ok(AuthResult { address, method })
            }
            Err(WardenError::Auth(AuthError::WrongPin { .. })) if inner.state.has_wallet() => {
                Err(self.wrong_pin(&mut inner).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Count a wrong PIN and persist the streak
    fn wrong_pin(&self, inner: &mut Inner) -> AuthError {
        let remaining = inner.attempts.record_failure(&self.config.lockout);
        self.persist(inner);
        AuthError::WrongPin { remaining }
    }

    async fn biometric_key(&self) -> Result<(DerivedKey, Address)> {
        let provider = self
            .biometric
            .as_ref()
            .filter(|provider| provider.is_available())
            .ok_or(AuthError::BiometricUnavailable)?;
        let key = self
            .vault
            .biometric_key()?
            .ok_or(AuthError::BiometricNotEnrolled)?;

        if !provider.prompt("Unlock wallet").await {
            return Err(AuthError::BiometricRejected.into());
        }

        let plaintext = self.vault.open(&key)?;
        let address = SecretMaterial::from_plaintext(&plaintext)?
            .owner_key()?
            .address();
        Ok((key, address))
    }

    /// Best-effort metadata write
    fn persist(&self, inner: &mut Inner) {
        inner.metadata.failed_attempts = inner.attempts.count();
        inner.metadata.last_failed_at = inner.attempts.last_failed_at();
        if let Err(e) = self.vault.save_metadata(&inner.metadata) {
            warn!("Failed to persist wallet metadata: {}", e);
        }
    }

    /// Run a KDF-bound vault operation off the async workers, bounded by
    /// the configured timeout. A timed-out operation still runs to
    /// completion; its result is dropped.
    async fn run_vault<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CredentialVault) -> Result<T> + Send + 'static,
    {
        let vault = Arc::clone(&self.vault);
        let task = tokio::task::spawn_blocking(move || op(&vault));

        match tokio::time::timeout(self.config.kdf_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(WardenError::Crypto(format!("Vault task failed: {}", e))),
            Err(_) => {
                warn!(
                    "Vault operation exceeded {}ms",
                    self.config.kdf_timeout_ms
                );
                Err(WardenError::Timeout)
            }
        }
    }
}

#[async_trait]
impl LockTarget for Shared {
    async fn auto_lock(&self, reason: LockReason, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Authenticated || inner.generation != epoch {
            debug!("Ignoring stale auto-lock ({:?})", reason);
            return;
        }

        info!("Auto-locking session: {:?}", reason);
        self.lock_inner(&mut inner);
        let _ = self.events.send(SessionEvent::AutoLocked(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometric::StaticBiometric;
    use crate::store::{MemoryStore, SecureStore, BIOMETRIC_RECORD, METADATA_RECORD, SECRET_RECORD};

    const PIN: &str = "123456";
    const MNEMONIC: &str = "test test test test test test test test test test test junk";
    const ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn session_with(
        store: Arc<MemoryStore>,
        biometric: Option<Arc<dyn BiometricProvider>>,
    ) -> Session {
        Session::new(WardenConfig::testing(), store, biometric, None).unwrap()
    }

    async fn authenticated() -> (Arc<MemoryStore>, Session) {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), None);
        session.import_wallet(PIN, MNEMONIC).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_initialize_empty() {
        let session = session_with(Arc::new(MemoryStore::new()), None);
        let state = session.initialize().await.unwrap();
        assert_eq!(state.state, SessionState::NoWallet);
        assert!(!state.has_wallet);
        assert!(!state.is_authenticated);
    }

    #[tokio::test]
    async fn test_initialize_storage_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let session = session_with(store, None);

        assert!(matches!(
            session.initialize().await,
            Err(WardenError::Storage(StorageError::Unavailable(_)))
        ));
        assert_eq!(session.state().await, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_import_then_unlock() {
        let (store, session) = authenticated().await;
        let state = session.get_auth_state().await;
        assert!(state.is_authenticated);
        assert_eq!(state.address.unwrap().to_checksum(), ADDRESS);
        assert!(state.last_unlock_time.is_some());
        assert!(state.smart_account_address.is_some());

        session.lock().await;
        assert_eq!(session.state().await, SessionState::Locked);

        let result = session.unlock_with_pin(PIN).await.unwrap();
        assert_eq!(result.address.to_checksum(), ADDRESS);
        assert_eq!(result.method, UnlockMethod::Pin);

        // A second session over the same store starts locked
        let restarted = session_with(store, None);
        let state = restarted.initialize().await.unwrap();
        assert_eq!(state.state, SessionState::Locked);
        assert_eq!(state.address.unwrap().to_checksum(), ADDRESS);
    }

    #[tokio::test]
    async fn test_create_generates_mnemonic() {
        let session = session_with(Arc::new(MemoryStore::new()), None);
        let created = session.create_wallet(PIN, None).await.unwrap();

        let mnemonic = created.mnemonic.unwrap();
        assert_eq!(mnemonic.split(' ').count(), 12);
        let expected = SecretMaterial::parse(&mnemonic)
            .unwrap()
            .owner_key()
            .unwrap()
            .address();
        assert_eq!(created.address, expected);
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let (_, session) = authenticated().await;
        let err = session.create_wallet(PIN, None).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::WalletExists));
    }

    #[tokio::test]
    async fn test_invalid_pin_format() {
        let session = session_with(Arc::new(MemoryStore::new()), None);
        let err = session.create_wallet("12ab56", None).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::InvalidPinFormat));
        assert_eq!(session.state().await, SessionState::NoWallet);
    }

    #[tokio::test]
    async fn test_wrong_pin_counts_down() {
        let (_, session) = authenticated().await;
        session.lock().await;

        let err = session.unlock_with_pin("000000").await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::WrongPin { remaining: 4 }));

        let state = session.get_auth_state().await;
        assert_eq!(state.state, SessionState::Locked);
        assert_eq!(state.failed_attempt_count, 1);
        assert!(state.has_wallet);

        // Success resets the counter
        session.unlock_with_pin(PIN).await.unwrap();
        assert_eq!(session.get_auth_state().await.failed_attempt_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_unlock_is_busy() {
        let (_, session) = authenticated().await;
        session.lock().await;

        let (first, second) = tokio::join!(
            session.unlock_with_pin(PIN),
            session.unlock_with_pin(PIN)
        );
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().as_auth(), Some(&AuthError::Busy));
    }

    #[tokio::test]
    async fn test_lock_during_unlock_discards_result() {
        let (_, session) = authenticated().await;
        session.lock().await;

        let (result, _) = tokio::join!(session.unlock_with_pin(PIN), session.lock());
        assert_eq!(result.unwrap_err().as_auth(), Some(&AuthError::Cancelled));
        assert_eq!(session.state().await, SessionState::Locked);
    }

    #[tokio::test]
    async fn test_unlock_while_authenticated_checks_pin() {
        let (_, session) = authenticated().await;
        let before = session.get_auth_state().await;

        let err = session.unlock_with_pin("000000").await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::WrongPin { remaining: 4 }));
        let state = session.get_auth_state().await;
        assert_eq!(state.state, SessionState::Authenticated);
        assert_eq!(state.failed_attempt_count, 1);

        let result = session.unlock_with_pin(PIN).await.unwrap();
        assert_eq!(result.address.to_checksum(), ADDRESS);
        let state = session.get_auth_state().await;
        assert_eq!(state.state, SessionState::Authenticated);
        assert_eq!(state.failed_attempt_count, 0);
        assert_eq!(state.last_unlock_time, before.last_unlock_time);
    }

    #[tokio::test]
    async fn test_unlock_while_authenticated_honors_lockout() {
        let (_, session) = authenticated().await;
        for _ in 0..5 {
            assert!(session.unlock_with_pin("000000").await.is_err());
        }

        let err = session.unlock_with_pin(PIN).await.unwrap_err();
        assert!(matches!(err.as_auth(), Some(AuthError::LockedOut(_))));
        assert_eq!(session.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_change_pin_overtaken_by_delete() {
        let (store, session) = authenticated().await;

        let (result, outcome) = tokio::join!(session.change_pin(PIN, "654321"), session.delete_wallet());
        assert!(outcome.warning.is_none());
        let err = result.unwrap_err();
        assert!(matches!(
            err.as_auth(),
            Some(AuthError::Cancelled) | Some(AuthError::NotFound)
        ));

        assert_eq!(session.state().await, SessionState::NoWallet);
        assert!(!store.exists(SECRET_RECORD).unwrap());
        assert!(!store.exists(METADATA_RECORD).unwrap());

        let restarted = session_with(store, None);
        assert_eq!(restarted.initialize().await.unwrap().state, SessionState::NoWallet);
    }

    #[tokio::test]
    async fn test_change_pin_overtaken_by_lock_keeps_old_pin() {
        let (_, session) = authenticated().await;

        let (result, _) = tokio::join!(session.change_pin(PIN, "654321"), session.lock());
        assert_eq!(result.unwrap_err().as_auth(), Some(&AuthError::Cancelled));
        assert_eq!(session.state().await, SessionState::Locked);

        let err = session.unlock_with_pin("654321").await.unwrap_err();
        assert!(matches!(err.as_auth(), Some(AuthError::WrongPin { .. })));
        session.unlock_with_pin(PIN).await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_biometric_overtaken_by_delete() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), Some(Arc::new(StaticBiometric::accepting())));
        session.import_wallet(PIN, MNEMONIC).await.unwrap();

        let (result, _) = tokio::join!(session.enable_biometric(PIN), session.delete_wallet());
        assert!(result.is_err());
        assert!(!store.exists(BIOMETRIC_RECORD).unwrap());
        assert!(!store.exists(METADATA_RECORD).unwrap());
        assert!(!store.exists(SECRET_RECORD).unwrap());
        assert!(!session.get_auth_state().await.biometric_enabled);
    }

    #[tokio::test]
    async fn test_enable_biometric_overtaken_by_lock() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), Some(Arc::new(StaticBiometric::accepting())));
        session.import_wallet(PIN, MNEMONIC).await.unwrap();

        let (result, _) = tokio::join!(session.enable_biometric(PIN), session.lock());
        assert_eq!(result.unwrap_err().as_auth(), Some(&AuthError::Cancelled));
        assert!(!store.exists(BIOMETRIC_RECORD).unwrap());

        let err = session.unlock(UnlockCredential::Biometric).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::BiometricNotEnrolled));
    }

    #[tokio::test]
    async fn test_lock_is_idempotent() {
        let (_, session) = authenticated().await;
        session.lock().await;
        let before = session.get_auth_state().await;
        session.lock().await;
        assert_eq!(session.get_auth_state().await, before);
    }

    #[tokio::test]
    async fn test_with_decrypted_key() {
        let (_, session) = authenticated().await;
        let address = session
            .with_decrypted_key(|key| key.address())
            .await
            .unwrap();
        assert_eq!(address.to_checksum(), ADDRESS);

        session.lock().await;
        let err = session.with_decrypted_key(|key| key.address()).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_change_pin() {
        let (_, session) = authenticated().await;

        let err = session.change_pin("000000", "654321").await.unwrap_err();
        assert!(matches!(err.as_auth(), Some(AuthError::WrongPin { .. })));

        session.change_pin(PIN, "654321").await.unwrap();
        session.lock().await;

        assert!(session.unlock_with_pin(PIN).await.is_err());
        session.unlock_with_pin("654321").await.unwrap();
    }

    #[tokio::test]
    async fn test_biometric_unlock() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(StaticBiometric::accepting());
        let session = session_with(store, Some(provider.clone()));
        session.import_wallet(PIN, MNEMONIC).await.unwrap();

        session.lock().await;
        let err = session.unlock(UnlockCredential::Biometric).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::BiometricNotEnrolled));

        session.unlock_with_pin(PIN).await.unwrap();
        session.enable_biometric(PIN).await.unwrap();
        assert!(session.get_auth_state().await.biometric_enabled);
        session.lock().await;

        let kdf_runs = session.kdf_invocations();
        let result = session.unlock(UnlockCredential::Biometric).await.unwrap();
        assert_eq!(result.method, UnlockMethod::Biometric);
        assert_eq!(result.address.to_checksum(), ADDRESS);
        assert_eq!(session.kdf_invocations(), kdf_runs);

        // Rejection leaves the session locked and the PIN counter alone
        session.lock().await;
        provider.set_accept(false);
        let err = session.unlock(UnlockCredential::Biometric).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::BiometricRejected));
        let state = session.get_auth_state().await;
        assert_eq!(state.state, SessionState::Locked);
        assert_eq!(state.failed_attempt_count, 0);
    }

    #[tokio::test]
    async fn test_biometric_survives_pin_change() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store, Some(Arc::new(StaticBiometric::accepting())));
        session.import_wallet(PIN, MNEMONIC).await.unwrap();
        session.enable_biometric(PIN).await.unwrap();

        session.change_pin(PIN, "654321").await.unwrap();
        session.lock().await;
        session.unlock(UnlockCredential::Biometric).await.unwrap();

        session.disable_biometric().await.unwrap();
        session.lock().await;
        let err = session.unlock(UnlockCredential::Biometric).await.unwrap_err();
        assert_eq!(err.as_auth(), Some(&AuthError::BiometricNotEnrolled));
    }

    #[tokio::test]
    async fn test_delete_reports_warning() {
        let (store, session) = authenticated().await;
        store.set_fail_erase(true);

        let outcome = session.delete_wallet().await;
        assert!(matches!(outcome.warning, Some(StorageError::IoFailure(_))));

        let state = session.get_auth_state().await;
        assert!(!state.has_wallet);
        assert!(!state.is_authenticated);
        assert_eq!(state.failed_attempt_count, 0);
        assert!(state.lockout_until.is_none());
    }

    #[tokio::test]
    async fn test_set_auto_lock_duration_persists() {
        let (store, session) = authenticated().await;
        session.set_auto_lock_duration(60_000).await.unwrap();
        assert!(session.set_auto_lock_duration(0).await.is_err());

        let restarted = session_with(store, None);
        let state = restarted.initialize().await.unwrap();
        assert_eq!(state.auto_lock_duration_ms, 60_000);
    }

    #[tokio::test]
    async fn test_state_events() {
        let session = session_with(Arc::new(MemoryStore::new()), None);
        let mut events = session.subscribe();
        session.import_wallet(PIN, MNEMONIC).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                from: SessionState::Uninitialized,
                to: SessionState::NoWallet
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                from: SessionState::NoWallet,
                to: SessionState::Authenticated
            }
        );
    }
}
