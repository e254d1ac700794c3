#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::Address;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(address) = Address::parse(text) {
            // Checksum rendering parses back
            let rendered = address.to_checksum();
            assert_eq!(Address::parse(&rendered).unwrap(), address);
        }
    }

    if data.len() >= 20 {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&data[..20]);
        let address = Address::new(bytes);
        assert_eq!(address.to_checksum().parse::<Address>().unwrap(), address);
    }
});
