//! Regex syntax tree shared by regular expressions and lowered hex patterns.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Membership set over all 256 byte values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ByteSet([u64; 4]);

impl ByteSet {
    pub const fn empty() -> Self {
        ByteSet([0; 4])
    }

    pub const fn full() -> Self {
        ByteSet([u64::MAX; 4])
    }

    pub fn single(byte: u8) -> Self {
        let mut set = Self::empty();
        set.insert(byte);
        set
    }

    pub fn insert(&mut self, byte: u8) {
        self.0[usize::from(byte >> 6)] |= 1 << (byte & 63);
    }

    pub fn insert_range(&mut self, lo: u8, hi: u8) {
        for byte in lo..=hi {
            self.insert(byte);
        }
    }

    #[inline]
    pub fn contains(&self, byte: u8) -> bool {
        self.0[usize::from(byte >> 6)] & (1 << (byte & 63)) != 0
    }

    pub fn union(&mut self, other: &ByteSet) {
        for (word, other) in self.0.iter_mut().zip(other.0.iter()) {
            *word |= other;
        }
    }

    pub fn negate(&mut self) {
        for word in &mut self.0 {
            *word = !*word;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |b| self.contains(*b))
    }

    /// Adds the other-case counterpart of every ASCII letter in the set.
    pub fn fold_case(&mut self) {
        for byte in b'A'..=b'Z' {
            let lower = byte.to_ascii_lowercase();
            if self.contains(byte) || self.contains(lower) {
                self.insert(byte);
                self.insert(lower);
            }
        }
    }

    /// `[A-Za-z0-9_]`
    pub fn word() -> Self {
        let mut set = Self::empty();
        set.insert_range(b'a', b'z');
        set.insert_range(b'A', b'Z');
        set.insert_range(b'0', b'9');
        set.insert(b'_');
        set
    }

    pub fn digit() -> Self {
        let mut set = Self::empty();
        set.insert_range(b'0', b'9');
        set
    }

    /// Space, tab, newline, carriage return, vertical tab and form feed.
    pub fn space() -> Self {
        let mut set = Self::empty();
        for byte in [b' ', b'\t', b'\n', b'\r', 0x0b, 0x0c] {
            set.insert(byte);
        }
        set
    }

    pub fn negated(mut self) -> Self {
        self.negate();
        self
    }
}

impl fmt::Debug for ByteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut iter = self.iter().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&hi.wrapping_add(1)) && hi != 255 {
                hi = iter.next().unwrap_or(hi);
            }
            if lo == hi {
                write!(f, "\\x{lo:02x}")?;
            } else {
                write!(f, "\\x{lo:02x}-\\x{hi:02x}")?;
            }
        }
        write!(f, "]")
    }
}

/// Whether `byte` counts as a word character for `\b`, `\B` and `fullword`.
#[inline]
pub fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Empty,
    Literal(u8),
    Class(ByteSet),
    /// `.`: any byte but `\n` unless dot-all.
    Any,
    /// Any byte at all (hex `??`).
    AnyByte,
    StartAnchor,
    EndAnchor,
    WordBoundary,
    NotWordBoundary,
    Concat(Vec<Node>),
    Alternation(Vec<Node>),
    Group(Box<Node>),
    Repeat {
        node: Box<Node>,
        min: u32,
        max: Option<u32>,
        greedy: bool,
    },
    /// Lazy run of arbitrary bytes (hex jumps).
    Gap { min: u32, max: Option<u32> },
}

impl Node {
    /// True if the node can succeed without consuming input.
    pub fn can_be_empty(&self) -> bool {
        match self {
            Node::Empty
            | Node::StartAnchor
            | Node::EndAnchor
            | Node::WordBoundary
            | Node::NotWordBoundary => true,
            Node::Literal(_) | Node::Class(_) | Node::Any | Node::AnyByte => false,
            Node::Concat(nodes) => nodes.iter().all(Node::can_be_empty),
            Node::Alternation(nodes) => nodes.iter().any(Node::can_be_empty),
            Node::Group(node) => node.can_be_empty(),
            Node::Repeat { node, min, .. } => *min == 0 || node.can_be_empty(),
            Node::Gap { min, .. } => *min == 0,
        }
    }

    /// True if some unbounded repetition has a body that can match empty.
    pub fn has_empty_loop(&self) -> bool {
        match self {
            Node::Concat(nodes) | Node::Alternation(nodes) => nodes.iter().any(Node::has_empty_loop),
            Node::Group(node) => node.has_empty_loop(),
            Node::Repeat { node, max, .. } => {
                (max.is_none() && node.can_be_empty()) || node.has_empty_loop()
            }
            _ => false,
        }
    }

    /// Bytes every match must start with, ignoring a leading `^`.
    pub fn literal_prefix(&self) -> Vec<u8> {
        let mut prefix = Vec::new();
        self.collect_prefix(&mut prefix);
        prefix
    }

    /// Returns false once the prefix can no longer be extended.
    fn collect_prefix(&self, prefix: &mut Vec<u8>) -> bool {
        match self {
            Node::Literal(byte) => {
                prefix.push(*byte);
                true
            }
            Node::StartAnchor if prefix.is_empty() => true,
            Node::Group(node) => node.collect_prefix(prefix),
            Node::Concat(nodes) => nodes.iter().all(|n| n.collect_prefix(prefix)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_set_basics() {
        let mut set = ByteSet::empty();
        assert!(set.is_empty());
        set.insert(b'a');
        set.insert_range(b'x', b'z');
        assert!(set.contains(b'a'));
        assert!(set.contains(b'y'));
        assert!(!set.contains(b'b'));
        assert_eq!(set.len(), 4);
        assert_eq!(set.iter().collect::<Vec<_>>(), b"axyz".to_vec());
    }

    #[test]
    fn test_byte_set_negate_and_fold() {
        let mut set = ByteSet::single(b'q');
        set.fold_case();
        assert!(set.contains(b'Q'));
        let negated = set.negated();
        assert!(!negated.contains(b'q'));
        assert_eq!(negated.len(), 254);
        assert!(ByteSet::full().contains(0xff));
    }

    #[test]
    fn test_shorthand_sets() {
        assert!(ByteSet::word().contains(b'_'));
        assert!(!ByteSet::word().contains(b'-'));
        assert!(ByteSet::space().contains(0x0b));
        assert_eq!(ByteSet::digit().len(), 10);
    }

    #[test]
    fn test_byte_set_debug_ranges() {
        let mut set = ByteSet::empty();
        set.insert_range(b'a', b'c');
        set.insert(b'z');
        assert_eq!(format!("{set:?}"), "[\\x61-\\x63\\x7a]");
    }

    #[test]
    fn test_can_be_empty() {
        let star = Node::Repeat {
            node: Box::new(Node::Literal(b'a')),
            min: 0,
            max: None,
            greedy: true,
        };
        assert!(star.can_be_empty());
        assert!(!Node::Concat(vec![Node::Literal(b'a'), star.clone()]).can_be_empty());
        assert!(Node::Alternation(vec![Node::Literal(b'a'), Node::Empty]).can_be_empty());
    }

    #[test]
    fn test_empty_loop_detection() {
        let inner = Node::Repeat {
            node: Box::new(Node::Literal(b'a')),
            min: 0,
            max: None,
            greedy: true,
        };
        let outer = Node::Repeat {
            node: Box::new(Node::Group(Box::new(inner.clone()))),
            min: 0,
            max: None,
            greedy: true,
        };
        assert!(!inner.has_empty_loop());
        assert!(outer.has_empty_loop());
    }

    #[test]
    fn test_literal_prefix() {
        let node = Node::Concat(vec![
            Node::StartAnchor,
            Node::Literal(b'a'),
            Node::Group(Box::new(Node::Literal(b'b'))),
            Node::Any,
            Node::Literal(b'c'),
        ]);
        assert_eq!(node.literal_prefix(), b"ab".to_vec());
        assert!(Node::Alternation(vec![Node::Literal(b'a'), Node::Literal(b'b')])
            .literal_prefix()
            .is_empty());
    }
}
