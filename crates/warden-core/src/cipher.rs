//! PIN-keyed authenticated encryption
//!
//! A 6-digit PIN has only 10^6 candidates, so the key is stretched with
//! Argon2id (memory-hard) over a per-install salt. The KDF output is split in
//! two halves:
//!
//! - the first 32 bytes key ChaCha20-Poly1305 for the wallet secret
//! - the last 32 bytes key an HMAC-SHA256 verification tag
//!
//! The tag lets the vault reject a wrong PIN without touching the ciphertext,
//! so an AEAD failure after a tag match can be reported as corruption rather
//! than as a typo.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{IntegrityError, Result, WardenError};

/// Size of the symmetric key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the ChaCha20-Poly1305 nonce
pub const NONCE_SIZE: usize = 12;
/// Size of the per-install KDF salt
pub const SALT_SIZE: usize = 32;
/// Size of the PIN verification tag
pub const TAG_SIZE: usize = 32;

/// Algorithm tag stored alongside every ciphertext
pub const AEAD_ALGORITHM: &str = "chacha20poly1305";

/// Associated data bound into every ciphertext
const AEAD_CONTEXT: &[u8] = b"warden/secret/v1";

/// Domain separator for the verification tag
const TAG_CONTEXT: &[u8] = b"warden/pin-check/v1";

type HmacSha256 = Hmac<Sha256>;

/// Key-derivation function identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
}

/// Tunable KDF cost parameters.
///
/// These are persisted next to each ciphertext, so raising the defaults only
/// affects vaults written afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP minimum for Argon2id
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for test suites only
    pub fn testing() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn to_argon2(self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE * 2),
        )
        .map_err(|e| WardenError::Config(format!("Invalid KDF parameters: {}", e)))?;

        Ok(match self.algorithm {
            KdfAlgorithm::Argon2id => Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

/// Key material derived from a PIN (zeroized on drop)
pub struct DerivedKey {
    encryption: Zeroizing<[u8; KEY_SIZE]>,
    verification: Zeroizing<[u8; KEY_SIZE]>,
}

impl DerivedKey {
    /// Wrap an already-derived encryption key (biometric path).
    ///
    /// The verification half is not available, so the result can decrypt
    /// but cannot produce a verification tag.
    pub fn from_encryption_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            encryption: Zeroizing::new(key),
            verification: Zeroizing::new([0u8; KEY_SIZE]),
        }
    }

    /// The AEAD key
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption
    }

    /// HMAC tag proving knowledge of the PIN for this salt
    pub fn verification_tag(&self, salt: &[u8; SALT_SIZE]) -> Result<[u8; TAG_SIZE]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.verification[..])
            .map_err(|e| WardenError::Crypto(format!("HMAC init failed: {}", e)))?;
        mac.update(TAG_CONTEXT);
        mac.update(salt);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time comparison against a stored tag
    pub fn matches_tag(&self, salt: &[u8; SALT_SIZE], expected: &[u8; TAG_SIZE]) -> Result<bool> {
        let tag = self.verification_tag(salt)?;
        Ok(bool::from(tag.ct_eq(expected)))
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derives keys from PINs and seals/opens the wallet secret
#[derive(Default)]
pub struct PinCipher {
    derivations: AtomicU64,
}

impl PinCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the memory-hard derivation for `pin` under `salt`.
    ///
    /// This is the expensive step; callers must keep it off any thread that
    /// services the user interface.
    pub fn derive_key(
        &self,
        pin: &str,
        salt: &[u8; SALT_SIZE],
        params: &KdfParams,
    ) -> Result<DerivedKey> {
        self.derivations.fetch_add(1, Ordering::Relaxed);

        let argon2 = params.to_argon2()?;
        let mut output = Zeroizing::new([0u8; KEY_SIZE * 2]);
        argon2
            .hash_password_into(pin.as_bytes(), salt, &mut output[..])
            .map_err(|e| WardenError::Crypto(format!("Key derivation failed: {}", e)))?;

        let mut encryption = Zeroizing::new([0u8; KEY_SIZE]);
        let mut verification = Zeroizing::new([0u8; KEY_SIZE]);
        encryption.copy_from_slice(&output[..KEY_SIZE]);
        verification.copy_from_slice(&output[KEY_SIZE..]);

        Ok(DerivedKey {
            encryption,
            verification,
        })
    }

    /// Encrypt under a fresh random nonce
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &[u8; KEY_SIZE],
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| WardenError::Crypto(format!("Invalid key: {}", e)))?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: AEAD_CONTEXT,
                },
            )
            .map_err(|e| WardenError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt and authenticate.
    ///
    /// Any tag mismatch, whether from tampering or a wrong key, is reported as
    /// [`IntegrityError::TamperedOrWrongKey`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        key: &[u8; KEY_SIZE],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, IntegrityError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| IntegrityError::TamperedOrWrongKey)?;

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: AEAD_CONTEXT,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| IntegrityError::TamperedOrWrongKey)
    }

    /// Fresh random salt for a new vault
    pub fn generate_salt() -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// How many times the KDF has run on this instance
    pub fn derivations(&self) -> u64 {
        self.derivations.load(Ordering::Relaxed)
    }
}
