#![no_main]

use libfuzzer_sys::fuzz_target;
use masala_dht::bprotocol::{deserialize_message, serialize_message};

fuzz_target!(|data: &[u8]| {
    // Whatever decodes must encode again.
    if let Ok(msg) = deserialize_message(data) {
        let mut buf = Vec::new();
        serialize_message(&mut buf, msg).unwrap();
    }
});
