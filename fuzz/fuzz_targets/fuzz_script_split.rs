//! Fuzz target for table init script splitting.

#![no_main]

use doc_replication_engine::spec::script_to_statements;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|script: &str| {
    for statement in script_to_statements(script) {
        assert!(!statement.is_empty());
        assert!(!statement.contains(';'));
        assert_eq!(statement.trim(), statement);
    }
});
