//! Encrypted-at-rest credential vault
//!
//! The wallet secret is sealed with [`PinCipher`] and stored as one opaque
//! record in the [`SecureStore`].
//!
//! # Record Format
//!
//! The secret record is JSON holding:
//! - version and algorithm identifier
//! - KDF parameters used for this record (so defaults can change later)
//! - 32-byte salt, 12-byte nonce (hex)
//! - ciphertext with the 16-byte Poly1305 tag appended (hex)
//! - 32-byte PIN verification tag (hex)
//!
//! A wrong PIN is detected from the verification tag alone. The AEAD is only
//! opened once the tag matches, so an AEAD failure at that point means the
//! record itself is damaged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{
    DerivedKey, KdfParams, PinCipher, AEAD_ALGORITHM, KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
use crate::error::{AuthError, Result, StorageError, WardenError};
use crate::metadata::WalletMetadata;
use crate::store::{SecureStore, BIOMETRIC_RECORD, METADATA_RECORD, SECRET_RECORD};
use crate::types::{hex_array, hex_vec};

/// Current secret record version
pub const VAULT_VERSION: u32 = 1;

/// Persisted form of the sealed wallet secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Version for future migrations
    pub version: u32,
    /// Algorithm identifier
    pub algorithm: String,
    pub kdf: KdfParams,
    #[serde(with = "hex_array")]
    pub salt: [u8; SALT_SIZE],
    #[serde(with = "hex_array")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "hex_vec")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_array")]
    pub verifier: [u8; TAG_SIZE],
}

impl EncryptedSecret {
    /// Parse a stored record
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, StorageError> {
        let record: Self = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Corrupt(format!("Secret record parse failed: {}", e)))?;

        if record.version > VAULT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "Unsupported secret record version {}",
                record.version
            )));
        }
        if record.algorithm != AEAD_ALGORITHM {
            return Err(StorageError::Corrupt(format!(
                "Unknown algorithm {:?}",
                record.algorithm
            )));
        }

        Ok(record)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self)
            .map_err(|e| StorageError::IoFailure(format!("Serialization failed: {}", e)))
    }
}

/// Owns the secure store and mediates every access to the sealed secret
pub struct CredentialVault {
    store: Arc<dyn SecureStore>,
    cipher: PinCipher,
    /// KDF parameters for records written from now on
    params: KdfParams,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SecureStore>, params: KdfParams) -> Self {
        Self {
            store,
            cipher: PinCipher::new(),
            params,
        }
    }

    /// Number of KDF runs performed through this vault
    pub fn kdf_invocations(&self) -> u64 {
        self.cipher.derivations()
    }

    /// Seal `plaintext` under `pin` and store it
    pub fn put(&self, plaintext: &[u8], pin: &str) -> Result<EncryptedSecret> {
        self.seal(plaintext, pin).map(|(record, _)| record)
    }

    /// Like [`put`](Self::put), also handing back the derived key
    pub fn seal(&self, plaintext: &[u8], pin: &str) -> Result<(EncryptedSecret, DerivedKey)> {
        let (record, key) = self.encrypt(plaintext, pin)?;
        self.store_record(&record)?;
        Ok((record, key))
    }

    /// Derive a key under a fresh salt and encrypt `plaintext`, without
    /// touching the store. Pair with [`store_record`](Self::store_record)
    /// when the write has to be decided after the KDF.
    pub fn encrypt(&self, plaintext: &[u8], pin: &str) -> Result<(EncryptedSecret, DerivedKey)> {
        let salt = PinCipher::generate_salt();
        let key = self.cipher.derive_key(pin, &salt, &self.params)?;
        let (ciphertext, nonce) = self.cipher.encrypt(plaintext, key.encryption_key())?;

        let record = EncryptedSecret {
            version: VAULT_VERSION,
            algorithm: AEAD_ALGORITHM.to_string(),
            kdf: self.params,
            salt,
            nonce,
            ciphertext,
            verifier: key.verification_tag(&salt)?,
        };

        Ok((record, key))
    }

    /// Write a sealed record, replacing any previous one
    pub fn store_record(&self, record: &EncryptedSecret) -> std::result::Result<(), StorageError> {
        self.store.put(SECRET_RECORD, &record.to_bytes()?)?;
        info!("Sealed wallet secret ({} byte ciphertext)", record.ciphertext.len());
        Ok(())
    }

    /// Open the secret with `pin`.
    ///
    /// Fails with `AuthError::WrongPin` on a tag mismatch. The `remaining`
    /// count is left at zero; attempt accounting belongs to the session.
    pub fn get(&self, pin: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.get_with_key(pin).map(|(plaintext, _)| plaintext)
    }

    /// Like [`get`](Self::get), also handing back the derived key
    pub fn get_with_key(&self, pin: &str) -> Result<(Zeroizing<Vec<u8>>, DerivedKey)> {
        let record = self.load()?;
        let key = self.cipher.derive_key(pin, &record.salt, &record.kdf)?;

        if !key.matches_tag(&record.salt, &record.verifier)? {
            debug!("PIN verification tag mismatch");
            return Err(AuthError::WrongPin { remaining: 0 }.into());
        }

        let plaintext = self
            .cipher
            .decrypt(&record.ciphertext, &record.nonce, key.encryption_key())
            .map_err(|_| {
                warn!("Verification tag matched but ciphertext failed authentication");
                StorageError::Corrupt("Ciphertext failed authentication".into())
            })?;

        Ok((plaintext, key))
    }

    /// Open the secret with an already-derived key, skipping the KDF.
    ///
    /// Used for the biometric path and for scoped signing while a session is
    /// authenticated.
    pub fn open(&self, key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.load()?;
        Ok(self
            .cipher
            .decrypt(&record.ciphertext, &record.nonce, key.encryption_key())?)
    }

    /// Whether a sealed secret is present. Never decrypts.
    pub fn exists(&self) -> std::result::Result<bool, StorageError> {
        self.store.exists(SECRET_RECORD)
    }

    /// Remove the sealed secret, the biometric key and the metadata record.
    /// Idempotent. Every record is attempted even if an earlier one fails.
    pub fn erase(&self) -> std::result::Result<(), StorageError> {
        let secret = self.store.erase(SECRET_RECORD);
        let biometric = self.store.erase(BIOMETRIC_RECORD);
        let metadata = self.store.erase(METADATA_RECORD);
        secret.and(biometric).and(metadata)?;
        info!("Erased wallet records");
        Ok(())
    }

    /// Plaintext metadata record, if present. Never decrypts.
    pub fn metadata(&self) -> Result<Option<WalletMetadata>> {
        WalletMetadata::load(self.store.as_ref())
    }

    pub fn save_metadata(&self, metadata: &WalletMetadata) -> Result<()> {
        metadata.save(self.store.as_ref())
    }

    /// Store the encryption key under the platform-gated biometric entry
    pub fn put_biometric_key(&self, key: &DerivedKey) -> std::result::Result<(), StorageError> {
        self.store.put(BIOMETRIC_RECORD, key.encryption_key())?;
        debug!("Stored biometric key");
        Ok(())
    }

    /// Load the biometric-gated key, if enrolled
    pub fn biometric_key(&self) -> Result<Option<DerivedKey>> {
        let Some(blob) = self.store.get(BIOMETRIC_RECORD)? else {
            return Ok(None);
        };

        if blob.len() != KEY_SIZE {
            return Err(StorageError::Corrupt(format!(
                "Biometric key has {} bytes, expected {}",
                blob.len(),
                KEY_SIZE
            ))
            .into());
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&blob);
        let derived = DerivedKey::from_encryption_key(key);
        zeroize::Zeroize::zeroize(&mut key);
        Ok(Some(derived))
    }

    pub fn erase_biometric_key(&self) -> std::result::Result<(), StorageError> {
        self.store.erase(BIOMETRIC_RECORD)
    }

    fn load(&self) -> Result<EncryptedSecret> {
        let blob = self
            .store
            .get(SECRET_RECORD)?
            .ok_or(WardenError::Auth(AuthError::NotFound))?;
        Ok(EncryptedSecret::from_bytes(&blob)?)
    }
}
