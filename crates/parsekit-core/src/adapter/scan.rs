//! Line-oriented declaration scanner.
//!
//! Each line is matched against the grammar's keywords after stripping
//! indentation and modifiers; the declared name is the identifier following
//! the keyword. Nested declarations are reported alongside their parents.

use super::grammar::{BlockStyle, GrammarRules};
use super::{RawNode, Span};

struct Line<'a> {
    text: &'a str,
    start: usize,
    indent: usize,
}

impl Line<'_> {
    fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn end(&self) -> usize {
        self.start + self.text.len()
    }
}

fn split_lines(source: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in source.split_inclusive('\n') {
        let text = raw.trim_end_matches('\n').trim_end_matches('\r');
        let indent = text.len() - text.trim_start().len();
        lines.push(Line {
            text,
            start,
            indent,
        });
        start += raw.len();
    }
    lines
}

/// All declarations in `source`, in source order.
pub fn scan(rules: &GrammarRules, source: &str) -> Vec<RawNode> {
    let lines = split_lines(source);
    let mut nodes = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.text.trim_start();
        if trimmed.is_empty() || is_comment(rules, trimmed) {
            continue;
        }
        let head = strip_modifiers(rules, trimmed);

        let matched = rules.rules.iter().find_map(|rule| {
            rule.keywords
                .iter()
                .find_map(|keyword| strip_keyword(head, keyword))
                .map(|rest| (rule, rest))
        });
        let Some((rule, rest)) = matched else {
            continue;
        };

        let end_index = match rules.block_for(rule) {
            BlockStyle::Braces => brace_end(rules, &lines, index),
            BlockStyle::Indent => indent_end(&lines, index),
            BlockStyle::Line => index,
        };
        nodes.push(RawNode {
            kind: rule.kind.clone(),
            name: identifier(rest),
            span: Span {
                start_byte: line.start + line.indent,
                end_byte: lines[end_index].end(),
                start_line: index + 1,
                end_line: end_index + 1,
            },
        });
    }
    nodes
}

fn is_comment(rules: &GrammarRules, trimmed: &str) -> bool {
    rules
        .line_comment
        .as_deref()
        .is_some_and(|marker| trimmed.starts_with(marker))
}

fn strip_modifiers<'a>(rules: &GrammarRules, mut text: &'a str) -> &'a str {
    'outer: loop {
        for modifier in &rules.modifiers {
            if let Some(rest) = strip_keyword(text, modifier) {
                text = rest;
                continue 'outer;
            }
        }
        return text;
    }
}

/// The text after `keyword` when it starts `text` as a whole word.
fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(keyword)?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn identifier(text: &str) -> Option<String> {
    let name: String = text
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect();
    if name.is_empty() { None } else { Some(name) }
}

fn code_part<'a>(rules: &GrammarRules, text: &'a str) -> &'a str {
    match rules.line_comment.as_deref() {
        Some(marker) => text.find(marker).map_or(text, |i| &text[..i]),
        None => text,
    }
}

fn brace_end(rules: &GrammarRules, lines: &[Line<'_>], start: usize) -> usize {
    let mut depth: i64 = 0;
    let mut opened = false;
    for (index, line) in lines.iter().enumerate().skip(start) {
        let code = code_part(rules, line.text);
        for c in code.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
            if opened && depth <= 0 {
                return index;
            }
        }
        if !opened {
            let ends_statement = code.trim_end().ends_with(';');
            let next_blank = lines.get(index + 1).is_none_or(Line::is_blank);
            if ends_statement || next_blank {
                return index;
            }
        }
    }
    lines.len().saturating_sub(1).max(start)
}

fn indent_end(lines: &[Line<'_>], start: usize) -> usize {
    let base = lines[start].indent;
    let mut end = start;
    for (index, line) in lines.iter().enumerate().skip(start + 1) {
        if line.is_blank() {
            continue;
        }
        if line.indent <= base {
            break;
        }
        end = index;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::grammar::DeclarationRule;

    fn rule(kind: &str, keywords: &[&str]) -> DeclarationRule {
        DeclarationRule {
            kind: kind.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            block: None,
        }
    }

    fn python() -> GrammarRules {
        GrammarRules {
            language: "python".to_string(),
            version: None,
            line_comment: Some("#".to_string()),
            block: BlockStyle::Indent,
            modifiers: vec!["async".to_string()],
            rules: vec![rule("function", &["def"]), rule("class", &["class"])],
        }
    }

    fn rust() -> GrammarRules {
        GrammarRules {
            language: "rust".to_string(),
            version: None,
            line_comment: Some("//".to_string()),
            block: BlockStyle::Braces,
            modifiers: vec!["pub".to_string(), "pub(crate)".to_string(), "async".to_string()],
            rules: vec![
                rule("function", &["fn"]),
                rule("struct", &["struct"]),
                DeclarationRule {
                    block: Some(BlockStyle::Line),
                    ..rule("import", &["use"])
                },
            ],
        }
    }

    #[test]
    fn test_python_indent_blocks() {
        let src = "class Greeter:\n    def hello(self):\n        return 1\n\n    async def bye(self):\n        pass\n\ndef main():\n    pass\n";
        let nodes = scan(&python(), src);
        let summary: Vec<_> = nodes
            .iter()
            .map(|n| (n.kind.as_str(), n.name.as_deref(), n.span.start_line, n.span.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("class", Some("Greeter"), 1, 6),
                ("function", Some("hello"), 2, 3),
                ("function", Some("bye"), 5, 6),
                ("function", Some("main"), 8, 9),
            ]
        );
        assert_eq!(nodes[1].span.start_byte, src.find("def hello").unwrap());
    }

    #[test]
    fn test_rust_brace_blocks() {
        let src = "use std::fmt;\n\npub struct Point {\n    x: i32,\n}\n\npub(crate) async fn run() {\n    if true { }\n}\n";
        let nodes = scan(&rust(), src);
        let summary: Vec<_> = nodes
            .iter()
            .map(|n| (n.kind.as_str(), n.name.as_deref(), n.span.start_line, n.span.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("import", Some("std"), 1, 1),
                ("struct", Some("Point"), 3, 5),
                ("function", Some("run"), 7, 9),
            ]
        );
        assert_eq!(&src[nodes[1].span.start_byte..nodes[1].span.end_byte], "pub struct Point {\n    x: i32,\n}");
    }

    #[test]
    fn test_comments_and_partial_words_ignored() {
        let src = "// fn commented() {}\nfnord();\nlet define = 1;\n";
        assert!(scan(&rust(), src).is_empty());
        assert!(scan(&python(), "# def hidden():\ndefault = 1\n").is_empty());
    }

    #[test]
    fn test_declaration_without_body() {
        let src = "pub struct Marker;\nfn later() {}\n";
        let nodes = scan(&rust(), src);
        assert_eq!(nodes.len(), 2);
        assert_eq!((nodes[0].span.start_line, nodes[0].span.end_line), (1, 1));
        assert_eq!((nodes[1].span.start_line, nodes[1].span.end_line), (2, 2));
    }

    #[test]
    fn test_crlf_offsets() {
        let src = "def a():\r\n    pass\r\n";
        let nodes = scan(&python(), src);
        assert_eq!(nodes[0].span.end_byte, src.len() - 2);
        assert_eq!(nodes[0].span.end_line, 2);
    }
}
