//! Fuzz target for the frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_codec_decode
//!
//! Feeds arbitrary bytes to `decode`. Attribute views must never panic, and
//! anything the encoder accepts again must decode to the same message.

#![no_main]

use gnlink_core::codec::{self, DEFAULT_MTU};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = codec::decode(data) else {
        return;
    };
    for attr in &message.attributes {
        let _ = attr.as_str();
        let _ = attr.as_u32();
    }
    // Type-0 attributes decode but are refused by the encoder.
    if let Ok(encoded) = codec::encode(&message, DEFAULT_MTU) {
        assert_eq!(codec::decode(&encoded).as_ref(), Ok(&message));
    }
});
