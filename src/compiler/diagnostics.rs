//! Compiler warning collection.

use crate::error::{Result, SourceLocation, YaraError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// A pattern whose best atom is short or made of very common bytes.
    SlowPattern,
    /// A quantifier asks for more patterns than the set contains.
    UnsatisfiableQuantifier,
}

/// A non-fatal finding produced while compiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: WarningKind,
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: WarningKind, location: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Warnings accumulated across every source added to one compiler.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    warnings: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn warn(&mut self, diagnostic: Diagnostic) {
        warn!(warning = %diagnostic, "compiler warning");
        self.warnings.push(diagnostic);
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Drops warnings added after `len`, used when a source is rejected.
    pub fn truncate(&mut self, len: usize) {
        self.warnings.truncate(len);
    }

    /// Consumes the collector, failing with the whole list when warnings are fatal.
    pub fn finish(self, error_on_warning: bool) -> Result<Vec<Diagnostic>> {
        if error_on_warning && !self.warnings.is_empty() {
            return Err(YaraError::Warnings(self.warnings));
        }
        Ok(self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow(line: usize) -> Diagnostic {
        Diagnostic::new(
            WarningKind::SlowPattern,
            SourceLocation::new(None, line),
            "string \"$a\" may slow down scanning",
        )
    }

    #[test]
    fn test_display() {
        assert_eq!(
            slow(2).to_string(),
            "line 2: string \"$a\" may slow down scanning"
        );
    }

    #[test]
    fn test_finish_lenient() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.warn(slow(1));
        let warnings = diagnostics.finish(false).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_finish_strict_reports_all() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.warn(slow(1));
        diagnostics.warn(slow(4));
        match diagnostics.finish(true) {
            Err(YaraError::Warnings(list)) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_strict_without_warnings_succeeds() {
        assert!(Diagnostics::default().finish(true).unwrap().is_empty());
    }

    #[test]
    fn test_truncate() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.warn(slow(1));
        let mark = diagnostics.len();
        diagnostics.warn(slow(2));
        diagnostics.truncate(mark);
        assert_eq!(diagnostics.warnings(), &[slow(1)]);
    }
}
