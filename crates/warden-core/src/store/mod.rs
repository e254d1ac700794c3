//! Secure key-value storage capability
//!
//! The platform keystore (Keychain, Android Keystore, ...) is reached only
//! through [`SecureStore`]: opaque blobs keyed by name. The vault owns the
//! store handle exclusively.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use zeroize::Zeroizing;

use crate::error::StorageError;

/// Name of the encrypted secret record
pub const SECRET_RECORD: &str = "wallet.secret";
/// Name of the plaintext metadata record
pub const METADATA_RECORD: &str = "wallet.meta";
/// Name of the biometric-gated key record
pub const BIOMETRIC_RECORD: &str = "wallet.biometric";

/// Opaque blob storage keyed by name
pub trait SecureStore: Send + Sync {
    /// Store `blob` under `name`, replacing any previous value
    fn put(&self, name: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Fetch the blob stored under `name`
    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;

    /// Whether `name` holds a value
    fn exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Remove `name`. Erasing a missing entry succeeds.
    fn erase(&self, name: &str) -> Result<(), StorageError>;
}

/// Reject names that could escape a directory-backed store
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(StorageError::IoFailure(format!("Invalid record name: {:?}", name)))
    }
}
