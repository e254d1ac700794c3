#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::vault::{EncryptedSecret, VAULT_VERSION};

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = EncryptedSecret::from_bytes(data) {
        // Only supported versions are accepted
        assert!(record.version <= VAULT_VERSION);

        // Round-trip
        let reserialized = record.to_bytes().unwrap();
        let record2 = EncryptedSecret::from_bytes(&reserialized).unwrap();
        assert_eq!(record.ciphertext, record2.ciphertext);
        assert_eq!(record.nonce, record2.nonce);
        assert_eq!(record.salt, record2.salt);
    }
});
