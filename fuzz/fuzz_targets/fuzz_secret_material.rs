#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::SecretMaterial;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(secret) = SecretMaterial::parse(text) {
            // Canonical form is stable
            let again = SecretMaterial::parse(secret.expose()).unwrap();
            assert_eq!(again.expose(), secret.expose());
            assert_eq!(again.kind(), secret.kind());
        }
    }
});
