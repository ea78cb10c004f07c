//! Regex engine for the rule language's regex dialect.
//!
//! Patterns are parsed into a [`Node`] tree ([`parser`]), lowered into a
//! small instruction set ([`program`]) and run by a bounded backtracking
//! matcher ([`backtrack`]). Hex patterns reuse the same tree and matcher:
//! their jumps and alternations become [`Node::Gap`] and
//! [`Node::Alternation`].
//!
//! # Examples
//!
//! ```rust
//! use yara_engine::regex::{Regex, RegexFlags};
//!
//! let re = Regex::new(b"a.*?bbb", RegexFlags::default())?;
//! assert_eq!(re.find(b"abbbbbb"), Some((0, 4)));
//! assert!(!re.is_match(b"acccc"));
//! # Ok::<(), yara_engine::regex::RegexError>(())
//! ```

pub mod ast;
pub mod backtrack;
pub mod parser;
pub mod program;

pub use ast::{ByteSet, Node};
pub use backtrack::{Backtracker, Budget, MatchAbort};
pub use program::{Inst, LowerOptions, Program};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected regex or hex construct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RegexError {
    pub message: String,
    /// Byte offset into the pattern where the problem was noticed.
    pub offset: usize,
}

impl RegexError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Flags written after the closing slash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegexFlags {
    /// `i`
    pub nocase: bool,
    /// `s`
    pub dotall: bool,
}

/// A compiled regular expression used by the `matches` operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regex {
    source: String,
    flags: RegexFlags,
    program: Program,
}

impl Regex {
    /// # Errors
    ///
    /// Returns a [`RegexError`] for any malformed construct.
    pub fn new(pattern: &[u8], flags: RegexFlags) -> Result<Self, RegexError> {
        let node = parser::parse(pattern)?;
        let program = Program::compile(
            &node,
            LowerOptions {
                nocase: flags.nocase,
                dotall: flags.dotall,
                ..LowerOptions::default()
            },
        )?;
        Ok(Self {
            source: String::from_utf8_lossy(pattern).into_owned(),
            flags,
            program,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> RegexFlags {
        self.flags
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.find(haystack).is_some()
    }

    /// Leftmost match as `(start, end)`.
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        self.find_with_budget(haystack, &mut Budget::unlimited())
            .ok()
            .flatten()
    }

    pub fn find_with_budget(
        &self,
        haystack: &[u8],
        budget: &mut Budget<'_>,
    ) -> Result<Option<(usize, usize)>, MatchAbort> {
        Backtracker::new(&self.program).find_from(haystack, 0, budget)
    }
}
