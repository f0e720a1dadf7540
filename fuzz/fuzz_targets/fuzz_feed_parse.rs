//! Fuzz target for feed event parsing.
//!
//! Arbitrary bytes that decode as BSON must parse as an oplog entry and as
//! a change stream event without panicking, and cursors must round-trip.

#![no_main]

use doc_replication_engine::feed::{parse_change_event, parse_oplog_entry, FeedPosition};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = bson::Document::from_reader(data) else {
        return;
    };

    for event in [parse_oplog_entry(&document), parse_change_event(&document)] {
        let _ = event.change.flatten();
        if let Some(position) = event.position {
            if let Ok(encoded) = position.encode() {
                assert!(FeedPosition::decode(&encoded).is_ok());
            }
        }
    }

    // Cursor decoding on arbitrary text
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = FeedPosition::decode(text);
    }
});
