#![no_main]

use libfuzzer_sys::fuzz_target;
use datagram_protocol::utils::crypto::{Cipher, SealedBox};

fuzz_target!(|data: &[u8]| {
    // Opening arbitrary blobs must fail cleanly, never panic
    if let Ok(keys) = SealedBox.generate_keypair() {
        let _ = SealedBox.decrypt(&keys.private, data);
    }
    let _ = SealedBox.import_public_key(data);
    let _ = SealedBox.import_private_key(data);
});
