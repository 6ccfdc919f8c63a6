//! Fuzz target for message decoding.
//!
//! Every parser the client applies to server input must reject garbage with
//! an error, never a panic.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run message_decode -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::auth::{parse_banner, AuthFailure};
use kestrel_proto::ssh::connection::{
    parse_global_request, parse_window_adjust, ChannelData, ChannelRequest, OpenConfirmation,
    OpenFailure,
};
use kestrel_proto::ssh::hostkey::RsaHostKey;
use kestrel_proto::ssh::kex::KexInit;
use kestrel_proto::ssh::version::Version;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = KexInit::from_bytes(data);
    let _ = AuthFailure::from_bytes(data);
    let _ = parse_banner(data);
    let _ = OpenConfirmation::from_bytes(data);
    let _ = OpenFailure::from_bytes(data);
    let _ = parse_window_adjust(data);
    let _ = ChannelData::from_bytes(data);
    let _ = ChannelRequest::from_bytes(data);
    let _ = parse_global_request(data);
    if let Ok(key) = RsaHostKey::from_blob(data) {
        let _ = key.verify(data, data);
    }
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = Version::parse(line);
    }
});
