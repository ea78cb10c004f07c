//! # YARA Rule Engine
//!
//! A Rust library for compiling [YARA](https://virustotal.github.io/yara/)
//! rules and scanning byte buffers with them.
//!
//! Rules are compiled once into an immutable [`Rules`] set. Scanning finds
//! every pattern with a single Aho-Corasick pass over short atoms, verifies
//! the candidates, then evaluates each rule condition over the confirmed
//! matches.
//!
//! ## Quick Start
//!
//! ### Basic Usage
//!
//! ```rust
//! use yara_engine::Compiler;
//!
//! let mut compiler = Compiler::new();
//! compiler.add_source(r#"
//!     rule mz_header : pe {
//!         meta:
//!             author = "analyst"
//!         strings:
//!             $mz = { 4D 5A }
//!             $msg = "This program" ascii wide
//!         condition:
//!             $mz at 0 and $msg
//!     }
//! "#)?;
//! let rules = compiler.compile()?;
//!
//! let results = rules.scan(b"MZ\x90\x00This program cannot be run in DOS mode")?;
//! assert!(results.matched("mz_header"));
//!
//! let rule = results.get("mz_header").unwrap();
//! assert_eq!(rule.tags, vec!["pe".to_string()]);
//! assert_eq!(rule.pattern("$msg").unwrap().occurrences[0].offset, 4);
//! # Ok::<(), yara_engine::YaraError>(())
//! ```
//!
//! ### Scanner Configuration
//!
//! ```rust
//! use std::time::Duration;
//! use yara_engine::{CallbackAction, Compiler, ScanEvent};
//!
//! let mut compiler = Compiler::new();
//! compiler.define_variable("min_count", 1)?;
//! compiler.add_source(r#"
//!     rule many { strings: $a = "ab" condition: #a >= min_count }
//!     rule never { condition: false }
//! "#)?;
//! let rules = compiler.compile()?;
//!
//! let mut scanner = rules.scanner();
//! scanner.set_timeout(Duration::from_secs(5));
//! scanner.set_variable("min_count", 3)?;
//!
//! let mut seen = Vec::new();
//! let results = scanner.scan_with_callback(b"ab ab ab", |event| {
//!     if let ScanEvent::RuleMatching(rule) = event {
//!         seen.push(rule.identifier.clone());
//!     }
//!     CallbackAction::Continue
//! })?;
//! assert_eq!(seen, vec!["many".to_string()]);
//! assert!(!results.matched("never"));
//! # Ok::<(), yara_engine::YaraError>(())
//! ```
//!
//! ### Saving Compiled Rules
//!
//! ```rust
//! use yara_engine::{Compiler, Rules};
//!
//! let mut compiler = Compiler::new();
//! compiler.add_source("rule r { strings: $a = /fo+bar/ condition: $a }")?;
//! let image = compiler.compile()?.serialize()?;
//!
//! let rules = Rules::deserialize(&image)?;
//! assert!(rules.scan(b"xx fooobar")?.matched("r"));
//! # Ok::<(), yara_engine::YaraError>(())
//! ```

pub mod compiler;
pub mod config;
mod deadline;
pub mod entrypoint;
pub mod error;
mod evaluator;
pub mod ir;
pub mod module;
pub mod regex;
pub mod rules;
pub mod scanner;
mod serialize;

// Compiler and configuration
pub use compiler::{
    Compiler, Diagnostic, FileIncludeResolver, IncludeResolver, IncludedSource, WarningKind,
};
pub use config::{CallbackFilter, CompilerConfig, EngineConfig, ScanConfig};

// Core types and errors
pub use error::{Result, SourceLocation, YaraError};
pub use ir::{ExternalValue, MetaValue};

// Scanning
pub use entrypoint::entry_point_offset;
pub use module::{ModuleFunction, ModuleProvider, ModuleValue, StaticModules};
pub use rules::Rules;
pub use scanner::{
    CallbackAction, MatchOccurrence, PatternMatches, PrefilterStats, RuleInfo, RuleMatch,
    ScanEvent, ScanResults, ScanWarning, Scanner,
};
