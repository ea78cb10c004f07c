//! Error types for the YARA engine crate.

use crate::compiler::Diagnostic;
use crate::deadline::Interrupt;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, YaraError>;

/// Where in the rule source a diagnostic points.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Included file name, `None` for the source passed to the compiler directly.
    pub file: Option<String>,
    /// 1-based line number.
    pub line: usize,
}

impl SourceLocation {
    pub fn new(file: Option<String>, line: usize) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}, line {}", self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum YaraError {
    #[error("{location}: {message}")]
    Syntax {
        location: SourceLocation,
        message: String,
    },
    #[error("{location}: type error: {message}")]
    Type {
        location: SourceLocation,
        message: String,
    },
    #[error("{} warning(s) treated as errors: {}", .0.len(), join_diagnostics(.0))]
    Warnings(Vec<Diagnostic>),
    #[error("undefined external variable \"{0}\"")]
    UndefinedVariable(String),
    #[error("external variable \"{name}\" is {expected}, got {found}")]
    VariableType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("scan timed out")]
    Timeout,
    #[error("scan cancelled")]
    Cancelled,
    #[error("compilation failed: {0}")]
    Compilation(String),
    #[error("incompatible compiled image: format version {found}, expected {expected}")]
    IncompatibleImage { found: u32, expected: u32 },
    #[error("invalid compiled image: {0}")]
    InvalidImage(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl YaraError {
    pub(crate) fn syntax(location: SourceLocation, message: impl Into<String>) -> Self {
        YaraError::Syntax {
            location,
            message: message.into(),
        }
    }

    pub(crate) fn type_error(location: SourceLocation, message: impl Into<String>) -> Self {
        YaraError::Type {
            location,
            message: message.into(),
        }
    }

    /// Line number for compile-time errors.
    pub fn line(&self) -> Option<usize> {
        match self {
            YaraError::Syntax { location, .. } | YaraError::Type { location, .. } => {
                Some(location.line)
            }
            _ => None,
        }
    }
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for YaraError {
    fn from(err: std::io::Error) -> Self {
        YaraError::Io(err.to_string())
    }
}

impl From<Interrupt> for YaraError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Timeout => YaraError::Timeout,
            Interrupt::Cancelled => YaraError::Cancelled,
        }
    }
}
