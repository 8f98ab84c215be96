//! Fuzz the full parse→open path: hostile envelopes must fail cleanly with
//! `AuthFailure`, never panic or leak.

#![no_main]

use bartho_envelope::{Envelope, MemoryKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let key = MemoryKey::new("std", [0x5A; 32]);
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(env) = Envelope::from_json(text) {
            let _ = env.open(&key);
            let _ = env.open_bound(&key, b"kind\0key\0ts");
        }
    }
});
