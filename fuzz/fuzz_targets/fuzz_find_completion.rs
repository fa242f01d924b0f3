//! Fuzz target: end-marker scanner.
//!
//! Arbitrary serial output must never panic the scanner, and any completion
//! it reports must point at an end marker inside the buffer.
#![no_main]

use ember_executor::protocol::{find_completion, END_PREFIX};
use libfuzzer_sys::fuzz_target;

const NONCE: &str = "0123456789abcdef";

fuzz_target!(|data: &[u8]| {
    let buffer = String::from_utf8_lossy(data);
    if let Some(completion) = find_completion(&buffer, NONCE) {
        let marker = format!("{END_PREFIX}{NONCE}:");
        assert!(buffer[completion.marker_start..].starts_with(&marker));
    }
});
