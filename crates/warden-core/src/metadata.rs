//! Plaintext wallet metadata
//!
//! Stored separately from the encrypted secret so a cold start can tell
//! whether a wallet exists, show its public addresses, and restore an active
//! lockout without any decryption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_AUTO_LOCK_MS;
use crate::error::{Result, StorageError, WardenError};
use crate::store::{SecureStore, METADATA_RECORD};
use crate::types::Address;

/// Current metadata schema version
pub const METADATA_VERSION: u32 = 1;

/// Public wallet fields persisted in plaintext
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletMetadata {
    /// Version for future migrations
    pub version: u32,
    pub has_wallet: bool,
    /// Owner (EOA) address derived from the secret
    pub address: Option<Address>,
    /// Counterfactual smart account address
    pub smart_account_address: Option<Address>,
    /// Best-effort deployment flag from the last refresh
    #[serde(default)]
    pub is_smart_account_deployed: bool,
    pub active_chain_id: u64,
    pub auto_lock_duration_ms: u64,
    #[serde(default)]
    pub biometric_enabled: bool,
    /// Consecutive failed PIN attempts
    #[serde(default)]
    pub failed_attempts: u32,
    /// Wall-clock time of the last failed attempt
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl WalletMetadata {
    /// Metadata for a freshly created wallet
    pub fn new(address: Address, chain_id: u64, auto_lock_duration_ms: u64) -> Self {
        Self {
            version: METADATA_VERSION,
            has_wallet: true,
            address: Some(address),
            smart_account_address: None,
            is_smart_account_deployed: false,
            active_chain_id: chain_id,
            auto_lock_duration_ms,
            biometric_enabled: false,
            failed_attempts: 0,
            last_failed_at: None,
        }
    }

    /// Metadata describing an empty device
    pub fn empty(chain_id: u64) -> Self {
        Self {
            version: METADATA_VERSION,
            has_wallet: false,
            address: None,
            smart_account_address: None,
            is_smart_account_deployed: false,
            active_chain_id: chain_id,
            auto_lock_duration_ms: DEFAULT_AUTO_LOCK_MS,
            biometric_enabled: false,
            failed_attempts: 0,
            last_failed_at: None,
        }
    }

    /// Load from the store, `None` if no record exists
    pub fn load(store: &dyn SecureStore) -> Result<Option<Self>> {
        let Some(blob) = store.get(METADATA_RECORD)? else {
            return Ok(None);
        };

        let metadata: Self = serde_json::from_slice(&blob).map_err(|e| {
            WardenError::Storage(StorageError::Corrupt(format!("Metadata parse failed: {}", e)))
        })?;

        if metadata.version > METADATA_VERSION {
            return Err(StorageError::Corrupt(format!(
                "Unsupported metadata version {}",
                metadata.version
            ))
            .into());
        }

        Ok(Some(metadata))
    }

    /// Persist to the store
    pub fn save(&self, store: &dyn SecureStore) -> Result<()> {
        let blob = serde_json::to_vec_pretty(self)
            .map_err(|e| WardenError::Storage(StorageError::IoFailure(e.to_string())))?;
        store.put(METADATA_RECORD, &blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn address() -> Address {
        Address::new([0x11; 20])
    }

    #[test]
    fn test_missing_record() {
        let store = MemoryStore::new();
        assert!(WalletMetadata::load(&store).unwrap().is_none());
    }

    #[test]
    fn test_save_load() {
        let store = MemoryStore::new();
        let mut metadata = WalletMetadata::new(address(), 4202, 5000);
        metadata.failed_attempts = 3;
        metadata.last_failed_at = Some(Utc::now());
        metadata.save(&store).unwrap();

        let loaded = WalletMetadata::load(&store).unwrap().unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let store = MemoryStore::new();
        store.put(METADATA_RECORD, b"not json").unwrap();
        assert!(matches!(
            WalletMetadata::load(&store),
            Err(WardenError::Storage(StorageError::Corrupt(_)))
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let store = MemoryStore::new();
        let mut metadata = WalletMetadata::empty(1);
        metadata.version = METADATA_VERSION + 1;
        metadata.save(&store).unwrap();
        assert!(WalletMetadata::load(&store).is_err());
    }
}
