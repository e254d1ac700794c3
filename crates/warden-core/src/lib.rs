//! Warden Core - PIN-gated custody for a self-custodial wallet
//!
//! This crate provides:
//! - PIN-derived key sealing of the wallet secret (`PinCipher`, `CredentialVault`)
//! - The custody session state machine with lockout (`Session`)
//! - Inactivity and background auto-lock (`AutoLockMonitor`)
//! - Counterfactual smart account addresses (`SmartAccountResolver`)

pub mod autolock;
pub mod biometric;
pub mod cipher;
pub mod config;
pub mod error;
pub mod lockout;
pub mod metadata;
pub mod secret;
pub mod session;
pub mod smart_account;
pub mod store;
pub mod types;
pub mod vault;

pub use autolock::{AppLifecycle, AutoLockMonitor, AutoLockPolicy, LockReason, LockTarget};
pub use biometric::{BiometricProvider, StaticBiometric};
pub use cipher::{DerivedKey, KdfParams, PinCipher};
pub use config::{PinPolicy, WardenConfig, DEFAULT_AUTO_LOCK_MS, DEFAULT_CHAIN_ID};
pub use error::{
    AuthError, IntegrityError, NetworkError, Result, StorageError, WardenError,
};
pub use lockout::LockoutPolicy;
pub use metadata::WalletMetadata;
pub use secret::{OwnerKey, SecretKind, SecretMaterial};
pub use session::{
    AuthResult, AuthState, CreatedWallet, DeleteOutcome, Session, SessionEvent, SessionState,
    UnlockCredential, UnlockMethod,
};
pub use smart_account::{
    ChainClient, FactoryConfig, JsonRpcClient, SmartAccountResolver, StaticChainClient,
};
pub use store::{FileStore, MemoryStore, SecureStore};
pub use types::Address;
pub use vault::{CredentialVault, EncryptedSecret};
