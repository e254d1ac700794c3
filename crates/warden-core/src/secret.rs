//! Wallet secret material and owner-key derivation
//!
//! A wallet secret is either a BIP-39 English mnemonic or a raw secp256k1
//! private key. Mnemonics are expanded to the first Ethereum account at
//! `m/44'/60'/0'/0/0` with BIP-32 (HMAC-SHA512). The owner address is the
//! last 20 bytes of `keccak256(uncompressed_pubkey[1..])`.
//!
//! Nothing in this module implements `Debug` with content or logs.

use std::fmt;

use bip39::Mnemonic;
use hmac::{Hmac, Mac};
use k256::{
    ecdsa::SigningKey,
    elliptic_curve::{sec1::ToEncodedPoint, PrimeField},
    FieldBytes, NonZeroScalar, Scalar, SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::error::{Result, WardenError};
use crate::types::{keccak256, Address};

type HmacSha512 = Hmac<Sha512>;

/// The hardened index offset (0x80000000) per BIP-32
const HARDENED: u32 = 0x8000_0000;

/// HMAC key for master key generation per BIP-32
const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

/// `m/44'/60'/0'/0/0`
pub const ETHEREUM_ACCOUNT_PATH: [u32; 5] = [44 | HARDENED, 60 | HARDENED, HARDENED, 0, 0];

/// Entropy for freshly generated mnemonics (128 bits, 12 words)
const GENERATED_ENTROPY_BYTES: usize = 16;

/// Which form the secret takes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretKind {
    Mnemonic,
    PrivateKey,
}

/// Wallet secret in canonical text form.
///
/// Mnemonics are normalized to single-space-separated lowercase words;
/// private keys to `0x` + 64 lowercase hex digits. The canonical form is what
/// the vault encrypts.
pub struct SecretMaterial {
    kind: SecretKind,
    canonical: Zeroizing<String>,
}

impl SecretMaterial {
    /// Parse user-supplied material
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        if body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut bytes = Zeroizing::new([0u8; 32]);
            hex::decode_to_slice(body, bytes.as_mut_slice())
                .map_err(|e| WardenError::Secret(format!("Invalid private key hex: {}", e)))?;
            // Range check (non-zero, below the curve order)
            SecretKey::from_slice(bytes.as_slice())
                .map_err(|_| WardenError::Secret("Private key out of range".into()))?;

            return Ok(Self {
                kind: SecretKind::PrivateKey,
                canonical: Zeroizing::new(format!("0x{}", hex::encode(bytes.as_slice()))),
            });
        }

        let mut words = Zeroizing::new(String::with_capacity(trimmed.len()));
        for word in trimmed.split_whitespace() {
            if !words.is_empty() {
                words.push(' ');
            }
            words.extend(word.chars().flat_map(char::to_lowercase));
        }
        let mnemonic = Mnemonic::parse(words.as_str())
            .map_err(|e| WardenError::Secret(format!("Invalid mnemonic: {}", e)))?;

        Ok(Self {
            kind: SecretKind::Mnemonic,
            canonical: Zeroizing::new(mnemonic.to_string()),
        })
    }

    /// Generate a fresh 12-word mnemonic from OS entropy
    pub fn generate() -> Result<Self> {
        let mut entropy = Zeroizing::new([0u8; GENERATED_ENTROPY_BYTES]);
        OsRng.fill_bytes(entropy.as_mut_slice());

        let mnemonic = Mnemonic::from_entropy(entropy.as_slice())
            .map_err(|e| WardenError::Secret(format!("Mnemonic generation failed: {}", e)))?;

        Ok(Self {
            kind: SecretKind::Mnemonic,
            canonical: Zeroizing::new(mnemonic.to_string()),
        })
    }

    /// Rebuild from decrypted vault plaintext
    pub fn from_plaintext(plaintext: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(plaintext)
            .map_err(|_| WardenError::Secret("Stored secret is not UTF-8".into()))?;
        Self::parse(text)
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    /// Canonical bytes handed to the cipher
    pub fn as_bytes(&self) -> &[u8] {
        self.canonical.as_bytes()
    }

    /// Canonical text, for showing a new mnemonic to the user once
    pub fn expose(&self) -> &str {
        &self.canonical
    }

    /// Derive the owning secp256k1 key
    pub fn owner_key(&self) -> Result<OwnerKey> {
        let secret = match self.kind {
            SecretKind::PrivateKey => {
                let body = self.canonical.trim_start_matches("0x");
                let mut bytes = Zeroizing::new([0u8; 32]);
                hex::decode_to_slice(body, bytes.as_mut_slice())
                    .map_err(|e| WardenError::Secret(e.to_string()))?;
                SecretKey::from_slice(bytes.as_slice())
                    .map_err(|_| WardenError::Secret("Private key out of range".into()))?
            }
            SecretKind::Mnemonic => {
                let mnemonic = Mnemonic::parse(self.canonical.as_str())
                    .map_err(|e| WardenError::Secret(format!("Invalid mnemonic: {}", e)))?;
                let seed = Zeroizing::new(mnemonic.to_seed(""));
                derive_bip32(seed.as_slice(), &ETHEREUM_ACCOUNT_PATH)?
            }
        };

        Ok(OwnerKey { secret })
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretMaterial({:?}, [REDACTED])", self.kind)
    }
}

/// The secp256k1 key that owns the wallet (zeroized on drop)
pub struct OwnerKey {
    secret: SecretKey,
}

impl OwnerKey {
    /// EOA address of this key
    pub fn address(&self) -> Address {
        let point = self.secret.public_key().to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Address::new(bytes)
    }

    /// ECDSA signing key for transaction collaborators
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }

    /// Raw 32-byte scalar
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes().into())
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKey({})", self.address())
    }
}

/// BIP-32 secp256k1 derivation along `path`
fn derive_bip32(seed: &[u8], path: &[u32]) -> Result<SecretKey> {
    let i = hmac_sha512(MASTER_HMAC_KEY, &[seed])?;
    let mut chain_code = Zeroizing::new([0u8; 32]);
    chain_code.copy_from_slice(&i[32..]);
    let mut secret = SecretKey::from_slice(&i[..32])
        .map_err(|_| WardenError::Secret("Invalid master key".into()))?;

    for &index in path {
        let mut data = Zeroizing::new(Vec::with_capacity(37));
        if index & HARDENED != 0 {
            data.push(0u8);
            data.extend_from_slice(&secret.to_bytes());
        } else {
            data.extend_from_slice(secret.public_key().to_encoded_point(true).as_bytes());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let i = hmac_sha512(&chain_code[..], &[data.as_slice()])?;

        let tweak = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(
            &i[..32],
        )))
        .ok_or_else(|| WardenError::Secret(format!("Invalid child tweak at index {}", index)))?;

        let parent: Scalar = *secret.to_nonzero_scalar();
        let child = Option::<NonZeroScalar>::from(NonZeroScalar::new(tweak + parent))
            .ok_or_else(|| WardenError::Secret(format!("Zero child key at index {}", index)))?;

        secret = SecretKey::from(child);
        chain_code.copy_from_slice(&i[32..]);
    }

    Ok(secret)
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 64]>> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key)
        .map_err(|e| WardenError::Crypto(format!("HMAC init failed: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development mnemonic and its first account
    const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn test_mnemonic_derives_known_address() {
        let secret = SecretMaterial::parse(DEV_MNEMONIC).unwrap();
        assert_eq!(secret.kind(), SecretKind::Mnemonic);
        let key = secret.owner_key().unwrap();
        assert_eq!(key.address().to_checksum(), DEV_ADDRESS);
        assert_eq!(hex::encode(*key.secret_bytes()), DEV_KEY.trim_start_matches("0x"));
    }

    #[test]
    fn test_private_key_derives_known_address() {
        let secret = SecretMaterial::parse(DEV_KEY).unwrap();
        assert_eq!(secret.kind(), SecretKind::PrivateKey);
        assert_eq!(secret.owner_key().unwrap().address().to_checksum(), DEV_ADDRESS);

        // Bare hex works too
        let bare = SecretMaterial::parse(DEV_KEY.trim_start_matches("0x")).unwrap();
        assert_eq!(bare.expose(), DEV_KEY);
    }

    #[test]
    fn test_mnemonic_is_normalized() {
        let secret = SecretMaterial::parse("  TEST test  test test test test test test test test test   junk\n").unwrap();
        assert_eq!(secret.expose(), DEV_MNEMONIC);
    }

    #[test]
    fn test_generate_round_trips() {
        let secret = SecretMaterial::generate().unwrap();
        assert_eq!(secret.expose().split(' ').count(), 12);

        let restored = SecretMaterial::from_plaintext(secret.as_bytes()).unwrap();
        assert_eq!(
            restored.owner_key().unwrap().address(),
            secret.owner_key().unwrap().address()
        );
    }

    #[test]
    fn test_invalid_material_rejected() {
        assert!(SecretMaterial::parse("not a mnemonic at all").is_err());
        // Bad checksum word
        assert!(SecretMaterial::parse("test test test test test test test test test test test test").is_err());
        // Zero key is out of range
        assert!(SecretMaterial::parse(&"0".repeat(64)).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretMaterial::parse(DEV_MNEMONIC).unwrap();
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("test"));
        assert!(rendered.contains("REDACTED"));
    }
}
