//! Recursive-descent parser for the regex dialect.
//!
//! The dialect is deliberately narrower than general-purpose engines: an
//! empty first alternative (`(|abc)`) is rejected, a `{` that does not start
//! a well-formed repetition is a literal, and a leading `]` inside a class is
//! a literal member.

use super::ast::{ByteSet, Node};
use super::RegexError;

/// Largest bound accepted in `{m,n}`.
pub const MAX_REPEAT: u32 = 32_767;

const MAX_NESTING: usize = 256;

/// Parse raw pattern bytes (the text between the slashes) into a [`Node`].
pub fn parse(pattern: &[u8]) -> Result<Node, RegexError> {
    let mut parser = RegexParser {
        input: pattern,
        position: 0,
        depth: 0,
    };
    let node = parser.parse_alternation()?;
    if parser.position < pattern.len() {
        return Err(parser.error("unmatched ')'"));
    }
    if node == Node::Empty {
        return Err(RegexError::new("empty regular expression", 0));
    }
    Ok(node)
}

enum ClassItem {
    Byte(u8),
    Set(ByteSet),
}

struct RegexParser<'a> {
    input: &'a [u8],
    position: usize,
    depth: usize,
}

impl<'a> RegexParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.input.get(self.position + ahead).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek();
        if byte.is_some() {
            self.position += 1;
        }
        byte
    }

    fn error(&self, message: &str) -> RegexError {
        RegexError::new(message, self.position)
    }

    fn parse_alternation(&mut self) -> Result<Node, RegexError> {
        let first = self.parse_concat()?;
        if self.peek() != Some(b'|') {
            return Ok(first);
        }
        if first == Node::Empty {
            return Err(self.error("empty alternative"));
        }
        let mut alternatives = vec![first];
        while self.peek() == Some(b'|') {
            self.advance();
            alternatives.push(self.parse_concat()?);
        }
        Ok(Node::Alternation(alternatives))
    }

    fn parse_concat(&mut self) -> Result<Node, RegexError> {
        let mut nodes = Vec::new();
        while let Some(byte) = self.peek() {
            if byte == b'|' || byte == b')' {
                break;
            }
            nodes.push(self.parse_repeat()?);
        }
        Ok(match nodes.len() {
            0 => Node::Empty,
            1 => nodes.remove(0),
            _ => Node::Concat(nodes),
        })
    }

    fn parse_repeat(&mut self) -> Result<Node, RegexError> {
        let atom = self.parse_atom()?;
        let Some((min, max, width)) = self.quantifier()? else {
            return Ok(atom);
        };
        if matches!(
            atom,
            Node::StartAnchor | Node::EndAnchor | Node::WordBoundary | Node::NotWordBoundary
        ) {
            return Err(self.error("nothing to repeat"));
        }
        self.position += width;
        let greedy = if self.peek() == Some(b'?') {
            self.advance();
            false
        } else {
            true
        };
        if self.quantifier()?.is_some() {
            return Err(self.error("multiple repeat"));
        }
        Ok(Node::Repeat {
            node: Box::new(atom),
            min,
            max,
            greedy,
        })
    }

    /// Recognizes a quantifier at the current position without consuming it.
    fn quantifier(&self) -> Result<Option<(u32, Option<u32>, usize)>, RegexError> {
        match self.peek() {
            Some(b'*') => Ok(Some((0, None, 1))),
            Some(b'+') => Ok(Some((1, None, 1))),
            Some(b'?') => Ok(Some((0, Some(1), 1))),
            Some(b'{') => self.bounds(),
            _ => Ok(None),
        }
    }

    /// `{m}`, `{m,}`, `{,n}` or `{m,n}`; anything else is not a quantifier.
    fn bounds(&self) -> Result<Option<(u32, Option<u32>, usize)>, RegexError> {
        let rest = &self.input[self.position..];
        let Some(close) = rest.iter().position(|b| *b == b'}') else {
            return Ok(None);
        };
        let body = &rest[1..close];
        if body.is_empty() || !body.iter().all(|b| b.is_ascii_digit() || *b == b',') {
            return Ok(None);
        }
        let number = |digits: &[u8]| -> Result<Option<u32>, RegexError> {
            if digits.is_empty() {
                return Ok(None);
            }
            let value = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|v| *v <= MAX_REPEAT)
                .ok_or_else(|| self.error("repeat interval too large"))?;
            Ok(Some(value))
        };
        let bounds = match body.iter().position(|b| *b == b',') {
            None => {
                let Some(exact) = number(body)? else {
                    return Ok(None);
                };
                (exact, Some(exact))
            }
            Some(comma) => {
                let (lo, hi) = (&body[..comma], &body[comma + 1..]);
                if hi.contains(&b',') || (lo.is_empty() && hi.is_empty()) {
                    return Ok(None);
                }
                (number(lo)?.unwrap_or(0), number(hi)?)
            }
        };
        if let (min, Some(max)) = bounds {
            if min > max {
                return Err(self.error("bad repeat interval"));
            }
        }
        Ok(Some((bounds.0, bounds.1, close + 1)))
    }

    fn parse_atom(&mut self) -> Result<Node, RegexError> {
        let Some(byte) = self.advance() else {
            return Err(self.error("unexpected end of regular expression"));
        };
        match byte {
            b'(' => {
                self.depth += 1;
                if self.depth > MAX_NESTING {
                    return Err(self.error("groups nested too deeply"));
                }
                let inner = self.parse_alternation()?;
                if self.advance() != Some(b')') {
                    return Err(self.error("missing ')'"));
                }
                self.depth -= 1;
                if inner == Node::Empty {
                    return Err(self.error("empty group"));
                }
                Ok(Node::Group(Box::new(inner)))
            }
            b'[' => self.parse_class(),
            b'.' => Ok(Node::Any),
            b'^' => Ok(Node::StartAnchor),
            b'$' => Ok(Node::EndAnchor),
            b'*' | b'+' | b'?' => Err(self.error("nothing to repeat")),
            b'{' => {
                self.position -= 1;
                if self.bounds()?.is_some() {
                    return Err(self.error("nothing to repeat"));
                }
                self.position += 1;
                Ok(Node::Literal(b'{'))
            }
            b'\\' if self.peek() == Some(b'b') => {
                self.advance();
                Ok(Node::WordBoundary)
            }
            b'\\' if self.peek() == Some(b'B') => {
                self.advance();
                Ok(Node::NotWordBoundary)
            }
            b'\\' => match self.parse_escape()? {
                ClassItem::Byte(byte) => Ok(Node::Literal(byte)),
                ClassItem::Set(set) => Ok(Node::Class(set)),
            },
            other => Ok(Node::Literal(other)),
        }
    }

    /// Handles the character following a backslash, outside or inside a class.
    fn parse_escape(&mut self) -> Result<ClassItem, RegexError> {
        let Some(byte) = self.advance() else {
            return Err(self.error("trailing backslash"));
        };
        let item = match byte {
            b'n' => ClassItem::Byte(b'\n'),
            b'r' => ClassItem::Byte(b'\r'),
            b't' => ClassItem::Byte(b'\t'),
            b'f' => ClassItem::Byte(0x0c),
            b'v' => ClassItem::Byte(0x0b),
            b'a' => ClassItem::Byte(0x07),
            b'x' => {
                let hi = self.advance().and_then(hex_value);
                let lo = self.advance().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => ClassItem::Byte(hi << 4 | lo),
                    _ => return Err(self.error("invalid hex escape")),
                }
            }
            b'w' => ClassItem::Set(ByteSet::word()),
            b'W' => ClassItem::Set(ByteSet::word().negated()),
            b's' => ClassItem::Set(ByteSet::space()),
            b'S' => ClassItem::Set(ByteSet::space().negated()),
            b'd' => ClassItem::Set(ByteSet::digit()),
            b'D' => ClassItem::Set(ByteSet::digit().negated()),
            other => ClassItem::Byte(other),
        };
        Ok(item)
    }

    fn parse_class(&mut self) -> Result<Node, RegexError> {
        let negated = self.peek() == Some(b'^');
        if negated {
            self.advance();
        }
        let mut set = ByteSet::empty();
        let mut first = true;
        loop {
            let Some(byte) = self.advance() else {
                return Err(self.error("missing ']'"));
            };
            if byte == b']' && !first {
                break;
            }
            first = false;
            let item = self.class_item(byte)?;
            match item {
                ClassItem::Set(other) => set.union(&other),
                ClassItem::Byte(lo) => {
                    let is_range = self.peek() == Some(b'-')
                        && self.peek_at(1).map_or(false, |next| next != b']');
                    if !is_range {
                        set.insert(lo);
                        continue;
                    }
                    self.advance();
                    let Some(next) = self.advance() else {
                        return Err(self.error("missing ']'"));
                    };
                    match self.class_item(next)? {
                        ClassItem::Byte(hi) if lo <= hi => set.insert_range(lo, hi),
                        ClassItem::Byte(_) => return Err(self.error("bad character range")),
                        ClassItem::Set(_) => return Err(self.error("bad character range")),
                    }
                }
            }
        }
        if negated {
            set.negate();
        }
        if set.is_empty() {
            return Err(self.error("empty character class"));
        }
        Ok(Node::Class(set))
    }

    fn class_item(&mut self, byte: u8) -> Result<ClassItem, RegexError> {
        if byte != b'\\' {
            return Ok(ClassItem::Byte(byte));
        }
        // Inside a class `\b` is a backspace, not a boundary.
        if self.peek() == Some(b'b') {
            self.advance();
            return Ok(ClassItem::Byte(0x08));
        }
        self.parse_escape()
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejects(pattern: &str) {
        assert!(
            parse(pattern.as_bytes()).is_err(),
            "pattern {pattern:?} should be rejected"
        );
    }

    fn accepts(pattern: &str) -> Node {
        parse(pattern.as_bytes())
            .unwrap_or_else(|e| panic!("pattern {pattern:?} should parse: {e}"))
    }

    #[test]
    fn test_malformed_patterns() {
        for pattern in [
            ")", "(abc", "abc)", "a[]b", "a\\", "a[\\", "[b-a]", ")(", "(|abc)ef", "a**",
            "*a", "a{3,1}", "()", "|a", "a[b-\\w]",
        ] {
            rejects(pattern);
        }
    }

    #[test]
    fn test_literal_brackets_and_braces() {
        assert_eq!(
            accepts("a]"),
            Node::Concat(vec![Node::Literal(b'a'), Node::Literal(b']')])
        );
        let Node::Concat(nodes) = accepts("ab{.*}") else {
            panic!("expected concatenation");
        };
        assert_eq!(nodes[2], Node::Literal(b'{'));
        assert_eq!(nodes[nodes.len() - 1], Node::Literal(b'}'));
    }

    #[test]
    fn test_trailing_empty_alternative_allowed() {
        let Node::Concat(nodes) = accepts("(abc|)ef") else {
            panic!("expected concatenation");
        };
        let Node::Group(inner) = &nodes[0] else {
            panic!("expected group");
        };
        assert!(matches!(inner.as_ref(), Node::Alternation(alts) if alts[1] == Node::Empty));
    }

    #[test]
    fn test_class_edge_members() {
        let Node::Concat(nodes) = accepts("a[]]b") else {
            panic!("expected concatenation");
        };
        let Node::Class(set) = nodes[1] else {
            panic!("expected class");
        };
        assert!(set.contains(b']'));
        assert_eq!(set.len(), 1);

        let Node::Class(set) = accepts("[a-c-e]") else {
            panic!("expected class");
        };
        assert!(set.contains(b'b') && set.contains(b'-') && set.contains(b'e'));
        assert!(!set.contains(b'd'));

        let Node::Class(set) = accepts("[b-]") else {
            panic!("expected class");
        };
        assert!(set.contains(b'-') && set.contains(b'b'));
    }

    #[test]
    fn test_negated_class_with_leading_bracket() {
        let Node::Class(set) = accepts("[^]b]") else {
            panic!("expected class");
        };
        assert!(!set.contains(b']'));
        assert!(!set.contains(b'b'));
        assert!(set.contains(b'a'));
    }

    #[test]
    fn test_hex_escape_range() {
        let Node::Class(set) = accepts("[\\0x5A-\\x5D]") else {
            panic!("expected class");
        };
        assert!(set.contains(0x5b));
        assert!(set.contains(b'0'));
    }

    #[test]
    fn test_quantifier_forms() {
        let cases: [(&str, u32, Option<u32>, bool); 6] = [
            ("a*", 0, None, true),
            ("a+?", 1, None, false),
            ("a??", 0, Some(1), false),
            ("a{2}", 2, Some(2), true),
            ("a{,3}", 0, Some(3), true),
            ("a{2,}?", 2, None, false),
        ];
        for (pattern, want_min, want_max, want_greedy) in cases {
            match accepts(pattern) {
                Node::Repeat {
                    min, max, greedy, ..
                } => {
                    assert_eq!((min, max, greedy), (want_min, want_max, want_greedy), "{pattern}");
                }
                other => panic!("{pattern}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_escapes() {
        assert_eq!(accepts("\\x41"), Node::Literal(b'A'));
        assert_eq!(accepts("\\a"), Node::Literal(0x07));
        assert_eq!(accepts("\\."), Node::Literal(b'.'));
        assert_eq!(accepts("\\b"), Node::WordBoundary);
        assert!(matches!(accepts("\\s"), Node::Class(set) if set.contains(0x0b)));
        rejects("\\xZZ");
    }

    #[test]
    fn test_repeating_anchor_rejected() {
        rejects("^*");
        rejects("a\\b+");
    }
}
