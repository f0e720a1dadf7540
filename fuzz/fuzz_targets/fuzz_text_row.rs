//! Fuzz target for COPY text escaping.
//!
//! Escaped fields must never contain a raw separator, whatever the input.

#![no_main]

use doc_replication_engine::codec::{escape_text, sanitize};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let clean = sanitize(data);
    assert!(!clean.contains('\0'));

    let escaped = escape_text(&clean);
    assert!(!escaped.contains('\t'));
    assert!(!escaped.contains('\n'));
    assert!(!escaped.contains('\r'));
    assert!(escaped.len() >= clean.len());
});
