//! Fuzz target for inbound packet framing.
//!
//! Feeds arbitrary bytes through [`open`] in the unencrypted phase and under
//! aes128-ctr with hmac-sha1. Nothing may panic; MAC failures are expected.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run packet_open -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::crypto::{new_cipher, new_mac, CipherAlgorithm, Direction, MacAlgorithm, NullCipher, NullMac};
use kestrel_proto::ssh::packet::open;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = open(data, &mut NullCipher, &NullMac, 0);

    if let (Ok(mut cipher), Ok(mac)) = (
        new_cipher(CipherAlgorithm::Aes128Ctr, Direction::Decrypt, &[7; 16], &[9; 16]),
        new_mac(MacAlgorithm::HmacSha1, &[3; 20]),
    ) {
        let _ = open(data, cipher.as_mut(), mac.as_ref(), 0);
    }
});
