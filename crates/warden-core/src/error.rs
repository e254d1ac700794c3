//! Error types for the warden custody core

use thiserror::Error;

/// Result type alias for custody operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Authentication failures surfaced to the user for retry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Incorrect PIN ({remaining} attempts before lockout)")]
    WrongPin { remaining: u32 },

    #[error("No wallet found on this device")]
    NotFound,

    #[error("Another unlock attempt is already in progress")]
    Busy,

    #[error("Too many failed attempts - locked out for {0} seconds")]
    LockedOut(u64),

    #[error("PIN must be {0}-{1} digits")]
    InvalidPinLength(usize, usize),

    #[error("PIN must contain only digits")]
    InvalidPinFormat,

    #[error("Session is locked - unlock first")]
    NotAuthenticated,

    #[error("A wallet already exists - delete it before creating another")]
    WalletExists,

    #[error("Biometric authentication is not available on this device")]
    BiometricUnavailable,

    #[error("Biometric unlock is not enrolled")]
    BiometricNotEnrolled,

    #[error("Biometric prompt was rejected")]
    BiometricRejected,

    #[error("Operation was cancelled by a lock or delete")]
    Cancelled,
}

/// Failures of the underlying secure store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Secure storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O failure: {0}")]
    IoFailure(String),

    #[error("Stored wallet data is corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::IoFailure(e.to_string())
    }
}

/// Authenticated decryption failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Ciphertext was tampered with or the key is wrong")]
    TamperedOrWrongKey,
}

/// Failures talking to a chain node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("No RPC endpoint configured")]
    NotConfigured,

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),
}

/// Errors that can occur anywhere in the custody core
#[derive(Debug, Error)]
pub enum WardenError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A KDF-bound vault operation exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid secret material: {0}")]
    Secret(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl WardenError {
    /// Whether the caller may retry the operation (possibly after backoff).
    ///
    /// `StorageError::Corrupt` is terminal: the only way forward is deleting
    /// the wallet and importing it again.
    pub fn is_retryable(&self) -> bool {
        match self {
            WardenError::Auth(AuthError::NotFound | AuthError::WalletExists) => false,
            WardenError::Auth(_) => true,
            WardenError::Storage(StorageError::Corrupt(_)) => false,
            WardenError::Storage(_) => true,
            WardenError::Integrity(_) => true,
            WardenError::Network(NetworkError::NotConfigured) => false,
            WardenError::Network(_) => true,
            WardenError::Timeout => true,
            WardenError::Config(_) | WardenError::Secret(_) | WardenError::Crypto(_) => false,
        }
    }

    /// Shorthand for matching a specific auth failure in callers and tests
    pub fn as_auth(&self) -> Option<&AuthError> {
        match self {
            WardenError::Auth(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Storage(StorageError::Corrupt(e.to_string()))
    }
}
