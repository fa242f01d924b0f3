//! Fuzz target: command output extraction.
//!
//! Feeds arbitrary guest output followed by a well-formed end marker. The
//! extracted output must never contain prompt lines.
#![no_main]

use ember_executor::protocol::{extract_output, find_completion, BEGIN_PREFIX, END_PREFIX};
use libfuzzer_sys::fuzz_target;

const NONCE: &str = "feedfacecafebeef";
const TOKEN: &str = "EMBER_fuzz";

fuzz_target!(|data: &[u8]| {
    let body = String::from_utf8_lossy(data);
    let buffer = format!("{BEGIN_PREFIX}{NONCE}\r\n{body}\r\n{END_PREFIX}{NONCE}:0\r\n{TOKEN}> ");
    let Some(completion) = find_completion(&buffer, NONCE) else {
        return;
    };
    let output = extract_output(&buffer, NONCE, completion, TOKEN);
    let prompt = format!("{TOKEN}>");
    assert!(output.lines().all(|line| !line.contains(&prompt)));
});
