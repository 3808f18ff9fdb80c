//! Grammar documents the rule engines understand.

/// Python: indentation blocks, `def` and `class`.
pub const PYTHON: &str = r##"{
  "language": "python",
  "version": "1",
  "line_comment": "#",
  "block": "indent",
  "modifiers": ["async"],
  "rules": [
    { "kind": "function", "keywords": ["def"] },
    { "kind": "class", "keywords": ["class"] },
    { "kind": "import", "keywords": ["import", "from"], "block": "line" }
  ]
}"##;

/// Rust: brace blocks with visibility modifiers.
pub const RUST: &str = r##"{
  "language": "rust",
  "version": "1",
  "line_comment": "//",
  "block": "braces",
  "modifiers": ["pub", "pub(crate)", "async", "unsafe"],
  "rules": [
    { "kind": "function", "keywords": ["fn"] },
    { "kind": "struct", "keywords": ["struct"] },
    { "kind": "enum", "keywords": ["enum"] },
    { "kind": "trait", "keywords": ["trait"] },
    { "kind": "module", "keywords": ["mod"] }
  ]
}"##;

#[cfg(test)]
mod tests {
    use parsekit_core::adapter::grammar::GrammarRules;

    use super::*;

    #[test]
    fn test_fixture_grammars_decode_whole() {
        let python = GrammarRules::from_slice(PYTHON.as_bytes()).unwrap();
        assert_eq!(python.language, "python");
        assert_eq!(python.line_comment.as_deref(), Some("#"));
        assert_eq!(python.rules.len(), 3);

        let rust = GrammarRules::from_slice(RUST.as_bytes()).unwrap();
        assert_eq!(rust.language, "rust");
        assert_eq!(rust.line_comment.as_deref(), Some("//"));
        assert_eq!(rust.rules.len(), 5);
    }
}
