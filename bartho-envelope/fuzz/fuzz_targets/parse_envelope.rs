//! Fuzz the envelope JSON parser: arbitrary bytes must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = bartho_envelope::Envelope::from_json(text);
        let _ = bartho_envelope::Envelope::is_envelope(text);
    }
});
