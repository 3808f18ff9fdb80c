//! Fuzz target for grammar rule decoding and the declaration scanner.
//!
//! Run with: cargo +nightly fuzz run fuzz_grammar_scan
//!
//! The first byte picks where the grammar document ends and the source
//! text begins.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parsekit_core::adapter::grammar::GrammarRules;
use parsekit_core::adapter::scan::scan;

const PYTHON: &str = r##"{
    "language": "python",
    "version": "fuzz",
    "line_comment": "#",
    "block": "indent",
    "rules": [
        { "kind": "function", "keywords": ["def"] },
        { "kind": "class", "keywords": ["class"] },
        { "kind": "import", "keywords": ["import", "from"], "block": "line" }
    ]
}"##;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let split = (data[0] as usize % data.len()).max(1);
    let (grammar, source) = data[1..].split_at(split - 1);

    let Ok(source) = std::str::from_utf8(source) else {
        return;
    };

    if let Ok(rules) = GrammarRules::from_slice(grammar) {
        let _ = scan(&rules, source);
    }

    if let Ok(rules) = GrammarRules::from_slice(PYTHON.as_bytes()) {
        for node in scan(&rules, source) {
            assert!(node.span.start_byte <= node.span.end_byte);
            assert!(node.span.end_byte <= source.len());
            assert!(node.span.start_line <= node.span.end_line);
        }
    }
});
