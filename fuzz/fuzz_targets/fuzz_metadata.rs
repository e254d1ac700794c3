#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::store::{MemoryStore, SecureStore, METADATA_RECORD};
use warden_core::WalletMetadata;

fuzz_target!(|data: &[u8]| {
    let store = MemoryStore::new();
    store.put(METADATA_RECORD, data).unwrap();

    if let Ok(Some(metadata)) = WalletMetadata::load(&store) {
        // Whatever loads must save and load back unchanged
        metadata.save(&store).unwrap();
        let reloaded = WalletMetadata::load(&store).unwrap().unwrap();
        assert_eq!(metadata, reloaded);
    }
});
