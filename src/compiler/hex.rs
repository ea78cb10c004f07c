//! Hex string parsing, validation and lowering.
//!
//! A hex string such as `{ 4D 5A [2-4] ( 6A | ?B ) ~00 }` is parsed into
//! [`HexToken`]s, validated, then lowered to the shared regex [`Node`] tree
//! so it runs on the same backtracking matcher as regular expressions.

use crate::ir::Atom;
use crate::regex::{ByteSet, Node, RegexError};

const MAX_ATOM_LEN: usize = 4;
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HexToken {
    /// Matches bytes `b` with `b & mask == value`, or the complement when negated.
    Byte { value: u8, mask: u8, negated: bool },
    Jump { min: u32, max: Option<u32> },
    Alternation(Vec<Vec<HexToken>>),
}

impl HexToken {
    fn is_exact(&self) -> bool {
        matches!(
            self,
            HexToken::Byte {
                mask: 0xFF,
                negated: false,
                ..
            }
        )
    }
}

/// Parses and validates a hex string body.
pub(crate) fn parse(body: &str) -> Result<Vec<HexToken>, RegexError> {
    let mut parser = HexParser {
        src: body.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let tokens = parser.sequence(false)?;
    if parser.pos < parser.src.len() {
        return Err(parser.error("unbalanced parenthesis in hex string"));
    }
    if tokens.is_empty() {
        return Err(RegexError::new("empty hex string", 0));
    }
    if matches!(tokens.first(), Some(HexToken::Jump { .. }))
        || matches!(tokens.last(), Some(HexToken::Jump { .. }))
    {
        return Err(RegexError::new(
            "hex string cannot start or end with a jump",
            0,
        ));
    }
    Ok(tokens)
}

struct HexParser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> HexParser<'a> {
    fn error(&self, message: &str) -> RegexError {
        RegexError::new(message, self.pos)
    }

    fn skip_space(&mut self) {
        while self.src.get(self.pos).map_or(false, u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn sequence(&mut self, in_alternation: bool) -> Result<Vec<HexToken>, RegexError> {
        let mut tokens: Vec<HexToken> = Vec::new();
        loop {
            self.skip_space();
            let token = match self.src.get(self.pos) {
                None | Some(b'|') | Some(b')') => return Ok(tokens),
                Some(b'[') => {
                    let jump = self.jump()?;
                    if in_alternation && matches!(jump, HexToken::Jump { max: None, .. }) {
                        return Err(self.error("unbounded jumps not allowed inside alternation"));
                    }
                    jump
                }
                Some(b'(') => self.alternation()?,
                Some(b'~') => {
                    self.pos += 1;
                    let (value, mask) = self.byte()?;
                    if mask == 0 {
                        return Err(self.error("negated wildcard is not allowed"));
                    }
                    HexToken::Byte {
                        value,
                        mask,
                        negated: true,
                    }
                }
                Some(_) => {
                    let (value, mask) = self.byte()?;
                    HexToken::Byte {
                        value,
                        mask,
                        negated: false,
                    }
                }
            };
            if let (
                Some(HexToken::Jump { min, max }),
                HexToken::Jump {
                    min: next_min,
                    max: next_max,
                },
            ) = (tokens.last_mut(), &token)
            {
                *min = min.saturating_add(*next_min);
                *max = match (*max, *next_max) {
                    (Some(a), Some(b)) => Some(a.saturating_add(b)),
                    _ => None,
                };
                continue;
            }
            tokens.push(token);
        }
    }

    fn nibble(&mut self) -> Result<(u8, u8), RegexError> {
        let Some(&c) = self.src.get(self.pos) else {
            return Err(self.error("incomplete byte in hex string"));
        };
        self.pos += 1;
        match c {
            b'?' => Ok((0, 0)),
            _ => (c as char)
                .to_digit(16)
                .map(|d| (d as u8, 0xF))
                .ok_or_else(|| {
                    self.pos -= 1;
                    self.error("invalid character in hex string")
                }),
        }
    }

    fn byte(&mut self) -> Result<(u8, u8), RegexError> {
        let (hi, hi_mask) = self.nibble()?;
        let (lo, lo_mask) = self.nibble()?;
        Ok((hi << 4 | lo, hi_mask << 4 | lo_mask))
    }

    fn number(&mut self) -> Result<Option<u32>, RegexError> {
        self.skip_space();
        let start = self.pos;
        while self.src.get(self.pos).map_or(false, u8::is_ascii_digit) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| self.error("jump length is too large"))
    }

    fn jump(&mut self) -> Result<HexToken, RegexError> {
        self.pos += 1;
        let min = self.number()?;
        self.skip_space();
        let token = match self.src.get(self.pos) {
            Some(b']') => {
                let Some(n) = min else {
                    return Err(self.error("empty jump"));
                };
                if n == 0 {
                    return Err(self.error("invalid jump length"));
                }
                HexToken::Jump {
                    min: n,
                    max: Some(n),
                }
            }
            Some(b'-') => {
                self.pos += 1;
                let max = self.number()?;
                self.skip_space();
                if self.src.get(self.pos) != Some(&b']') {
                    return Err(self.error("unterminated jump"));
                }
                let min = min.unwrap_or(0);
                match max {
                    Some(0) => return Err(self.error("invalid jump length")),
                    Some(max) if min > max => return Err(self.error("invalid jump range")),
                    _ => {}
                }
                HexToken::Jump { min, max }
            }
            _ => return Err(self.error("malformed jump")),
        };
        self.pos += 1;
        Ok(token)
    }

    fn alternation(&mut self) -> Result<HexToken, RegexError> {
        self.pos += 1;
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("hex string alternation nested too deeply"));
        }
        let mut alternatives = Vec::new();
        loop {
            let alternative = self.sequence(true)?;
            if alternative.is_empty() {
                return Err(self.error("empty alternative in hex string"));
            }
            alternatives.push(alternative);
            match self.src.get(self.pos) {
                Some(b'|') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    self.depth -= 1;
                    return Ok(HexToken::Alternation(alternatives));
                }
                _ => return Err(self.error("unbalanced parenthesis in hex string")),
            }
        }
    }
}

/// Lowers validated tokens into a matcher tree.
pub(crate) fn to_node(tokens: &[HexToken]) -> Node {
    Node::Concat(tokens.iter().map(token_node).collect())
}

fn token_node(token: &HexToken) -> Node {
    match token {
        HexToken::Byte {
            value,
            mask: 0xFF,
            negated: false,
        } => Node::Literal(*value),
        HexToken::Byte {
            mask: 0,
            negated: false,
            ..
        } => Node::AnyByte,
        HexToken::Byte {
            value,
            mask,
            negated,
        } => {
            let mut set = ByteSet::empty();
            for byte in 0..=255u8 {
                if byte & mask == value & mask {
                    set.insert(byte);
                }
            }
            Node::Class(if *negated { set.negated() } else { set })
        }
        HexToken::Jump { min, max } => Node::Gap {
            min: *min,
            max: *max,
        },
        HexToken::Alternation(alternatives) => Node::Group(Box::new(Node::Alternation(
            alternatives.iter().map(|alt| to_node(alt)).collect(),
        ))),
    }
}

/// Length matched by `tokens` when it cannot vary.
fn fixed_len(tokens: &[HexToken]) -> Option<usize> {
    tokens.iter().try_fold(0usize, |total, token| {
        let len = match token {
            HexToken::Byte { .. } => 1,
            HexToken::Jump { min, max } if Some(*min) == *max => *min as usize,
            HexToken::Jump { .. } => return None,
            HexToken::Alternation(alternatives) => {
                let mut lens = alternatives.iter().map(|alt| fixed_len(alt));
                let first = lens.next()??;
                if lens.all(|len| len == Some(first)) {
                    first
                } else {
                    return None;
                }
            }
        };
        Some(total + len)
    })
}

/// Score of a byte as a search anchor; common filler bytes score lowest.
pub(crate) fn byte_quality(byte: u8) -> u32 {
    match byte {
        0x00 | 0xFF | 0x20 | 0xCC | 0x90 => 1,
        b if b.is_ascii_alphabetic() => 2,
        _ => 3,
    }
}

/// Picks the best fixed window of at most four exact bytes reachable at a
/// fixed distance from the start of the match.
pub(crate) fn best_atom(tokens: &[HexToken]) -> Option<Atom> {
    let mut best: Option<(u32, Atom)> = None;
    let mut offset = 0usize;
    let mut run: Vec<u8> = Vec::new();
    let mut run_start = 0usize;

    let consider = |run: &[u8], run_start: usize, best: &mut Option<(u32, Atom)>| {
        let width = run.len().min(MAX_ATOM_LEN);
        if width == 0 {
            return;
        }
        for (i, window) in run.windows(width).enumerate() {
            let score: u32 = window.iter().map(|b| byte_quality(*b)).sum();
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                *best = Some((
                    score,
                    Atom {
                        bytes: window.to_vec(),
                        offset: run_start + i,
                    },
                ));
            }
        }
    };

    for token in tokens {
        if token.is_exact() {
            if run.is_empty() {
                run_start = offset;
            }
            if let HexToken::Byte { value, .. } = token {
                run.push(*value);
            }
            offset += 1;
            continue;
        }
        consider(&run, run_start, &mut best);
        run.clear();
        match fixed_len(std::slice::from_ref(token)) {
            Some(len) => offset += len,
            None => break,
        }
    }
    consider(&run, run_start, &mut best);
    best.map(|(_, atom)| atom)
}
