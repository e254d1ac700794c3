//! Session states and the values exchanged with callers

use std::fmt;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::autolock::LockReason;
use crate::error::StorageError;
use crate::types::Address;

/// Custody session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Storage not inspected yet
    Uninitialized,
    NoWallet,
    Locked,
    /// A credential check is in flight
    Unlocking,
    Authenticated,
    Deleting,
}

impl SessionState {
    pub fn has_wallet(self) -> bool {
        matches!(
            self,
            SessionState::Locked | SessionState::Unlocking | SessionState::Authenticated
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::NoWallet => "no wallet",
            SessionState::Locked => "locked",
            SessionState::Unlocking => "unlocking",
            SessionState::Authenticated => "authenticated",
            SessionState::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of the session for the UI layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    pub state: SessionState,
    pub has_wallet: bool,
    pub is_authenticated: bool,
    /// Set on every transition into `Authenticated`
    pub last_unlock_time: Option<DateTime<Utc>>,
    pub auto_lock_duration_ms: u64,
    pub biometric_enabled: bool,
    pub failed_attempt_count: u32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub address: Option<Address>,
    pub smart_account_address: Option<Address>,
    pub active_chain_id: u64,
}

/// Credential presented to `unlock`
#[derive(Clone, Copy)]
pub enum UnlockCredential<'a> {
    Pin(&'a str),
    Biometric,
}

impl fmt::Debug for UnlockCredential<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockCredential::Pin(_) => f.write_str("Pin([REDACTED])"),
            UnlockCredential::Biometric => f.write_str("Biometric"),
        }
    }
}

/// How a session was authenticated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockMethod {
    Pin,
    Biometric,
}

/// Successful unlock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResult {
    pub address: Address,
    pub method: UnlockMethod,
}

/// A wallet that was just created
pub struct CreatedWallet {
    pub address: Address,
    /// The generated mnemonic, returned once for backup. `None` when the
    /// caller supplied the secret.
    pub mnemonic: Option<Zeroizing<String>>,
}

impl fmt::Debug for CreatedWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedWallet")
            .field("address", &self.address)
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Result of `delete_wallet`. The wallet is gone from the session either
/// way; a warning means some storage could not be erased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub warning: Option<StorageError>,
}

impl DeleteOutcome {
    pub fn is_clean(&self) -> bool {
        self.warning.is_none()
    }
}

/// Notifications for UI subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    AutoLocked(LockReason),
    SmartAccountDeployed(Address),
}
