//! Scanning buffers against a compiled rule set.
//!
//! A scan runs in three phases:
//! 1. [`prefilter`] finds every atom occurrence in one Aho-Corasick pass.
//! 2. [`matches`] verifies the candidate starts and records occurrences.
//! 3. Conditions are evaluated rule by rule, in declaration order, and the
//!    results are reported through [`ScanResults`] and the optional callback.
//!
//! # Examples
//!
//! ```rust
//! use yara_engine::Compiler;
//!
//! let mut compiler = Compiler::new();
//! compiler.define_variable("threshold", 1)?;
//! compiler.add_source(r#"
//!     rule hello {
//!         strings:
//!             $h = "hello" nocase
//!         condition:
//!             #h > threshold
//!     }
//! "#)?;
//! let rules = compiler.compile()?;
//!
//! let mut scanner = rules.scanner();
//! assert!(scanner.scan(b"Hello HELLO")?.matched("hello"));
//! scanner.set_variable("threshold", 2)?;
//! assert!(!scanner.scan(b"Hello HELLO")?.matched("hello"));
//! # Ok::<(), yara_engine::YaraError>(())
//! ```

pub(crate) mod matches;
pub(crate) mod prefilter;
pub mod results;

pub use prefilter::PrefilterStats;
pub use results::{
    CallbackAction, MatchOccurrence, PatternMatches, RuleInfo, RuleMatch, ScanEvent, ScanResults,
    ScanWarning,
};

use crate::config::ScanConfig;
use crate::deadline::Deadline;
use crate::entrypoint::entry_point_offset;
use crate::error::{Result, YaraError};
use crate::evaluator::{evaluate_rule, ScanContext};
use crate::ir::{CompiledRule, ExternalValue};
use crate::module::{ModuleProvider, ModuleValue};
use crate::rules::Rules;
use matches::{MatchTable, PatternScan};
use rayon::prelude::*;
use results::resolve_metadata;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A configurable scan over one [`Rules`] set.
///
/// A scanner is cheap to create and can be reused for many buffers; the
/// variable bindings and configuration persist across scans.
pub struct Scanner<'r> {
    rules: &'r Rules,
    config: ScanConfig,
    variables: Vec<ExternalValue>,
    modules: Option<Arc<dyn ModuleProvider>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'r> Scanner<'r> {
    pub fn new(rules: &'r Rules) -> Self {
        Self {
            rules,
            config: ScanConfig::default(),
            variables: rules.externals.iter().map(|e| e.default.clone()).collect(),
            modules: None,
            cancel: None,
        }
    }

    /// Bind an external variable for subsequent scans.
    ///
    /// # Errors
    /// [`YaraError::UndefinedVariable`] if the rules never declared `name`,
    /// [`YaraError::VariableType`] if `value` has a different type than the
    /// declared default.
    pub fn set_variable(&mut self, name: &str, value: impl Into<ExternalValue>) -> Result<&mut Self> {
        let value = value.into();
        let index = self
            .rules
            .externals
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| YaraError::UndefinedVariable(name.to_string()))?;
        let expected = self.rules.externals[index].default.type_name();
        if expected != value.type_name() {
            return Err(YaraError::VariableType {
                name: name.to_string(),
                expected,
                found: value.type_name(),
            });
        }
        self.variables[index] = value;
        Ok(self)
    }

    pub fn set_module_provider(&mut self, provider: impl ModuleProvider + 'static) -> &mut Self {
        self.modules = Some(Arc::new(provider));
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn set_config(&mut self, config: ScanConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Setting the flag makes the running scan fail with
    /// [`YaraError::Cancelled`].
    pub fn set_cancellation(&mut self, flag: Arc<AtomicBool>) -> &mut Self {
        self.cancel = Some(flag);
        self
    }

    pub fn scan(&self, data: &[u8]) -> Result<ScanResults> {
        self.scan_with_callback(data, |_| CallbackAction::Continue)
    }

    /// Scan several buffers in parallel.
    pub fn scan_batch(&self, buffers: &[&[u8]]) -> Vec<Result<ScanResults>> {
        buffers.par_iter().map(|data| self.scan(data)).collect()
    }

    /// Scan `data`, calling `callback` for every non-private rule selected by
    /// [`ScanConfig::callbacks`]. Returning [`CallbackAction::Abort`] stops the
    /// scan and marks the results as aborted.
    ///
    /// # Errors
    /// [`YaraError::Timeout`] or [`YaraError::Cancelled`] when the scan
    /// budget runs out.
    pub fn scan_with_callback<F>(&self, data: &[u8], mut callback: F) -> Result<ScanResults>
    where
        F: FnMut(ScanEvent<'_>) -> CallbackAction,
    {
        let deadline = Deadline::new(self.config.timeout, self.cancel.clone());
        let mut results = ScanResults::default();

        let (matches, stats) = PatternScan {
            patterns: &self.rules.patterns,
            rules: &self.rules.rules,
            prefilter: &self.rules.prefilter,
            config: &self.config,
            deadline: &deadline,
        }
        .run(data, &mut results.warnings)?;
        debug!(
            bytes = data.len(),
            atom_hits = stats.atom_hits,
            candidates = stats.candidates,
            "patterns verified"
        );

        let modules = self.load_modules(data);
        let entrypoint = if self.rules.needs_entrypoint {
            entry_point_offset(data)
        } else {
            None
        };
        let ctx = ScanContext {
            data,
            matches: &matches,
            externals: &self.variables,
            modules: &modules,
            entrypoint,
            deadline: &deadline,
            regex_steps: self.config.max_verification_steps,
        };

        let mut rule_results: Vec<bool> = Vec::with_capacity(self.rules.rules.len());
        let mut gated: HashSet<&str> = HashSet::new();
        for rule in &self.rules.rules {
            let matched = if gated.contains(rule.namespace.as_str()) {
                false
            } else {
                evaluate_rule(&ctx, &rule_results, rule)?
            };
            if rule.is_global && !matched {
                gated.insert(rule.namespace.as_str());
            }
            rule_results.push(matched);
            if rule.is_private {
                continue;
            }

            if matched {
                trace!(rule = %rule.identifier, namespace = %rule.namespace, "rule matched");
                results
                    .matching_rules
                    .push(self.rule_match(rule, &matches, data));
            }
            let callbacks = self.config.callbacks;
            let event = match (matched, results.matching_rules.last()) {
                (true, Some(found)) if callbacks.wants(true) => Some(ScanEvent::RuleMatching(found)),
                (false, _) if callbacks.wants(false) => Some(ScanEvent::RuleNotMatching(rule.into())),
                _ => None,
            };
            if let Some(event) = event {
                if callback(event) == CallbackAction::Abort {
                    debug!(rule = %rule.identifier, "scan aborted by callback");
                    results.aborted = true;
                    break;
                }
            }
        }

        #[cfg(feature = "metrics")]
        {
            results.statistics = results::ScanStatistics {
                atom_hits: stats.atom_hits,
                candidates_verified: stats.candidates,
                rules_evaluated: rule_results.len(),
                elapsed: deadline.elapsed(),
            };
        }
        Ok(results)
    }

    fn load_modules(&self, data: &[u8]) -> HashMap<String, ModuleValue> {
        let Some(provider) = &self.modules else {
            return HashMap::new();
        };
        self.rules
            .imports
            .iter()
            .filter_map(|module| {
                provider
                    .load(module, data)
                    .map(|value| (module.clone(), value))
            })
            .collect()
    }

    fn rule_match(&self, rule: &CompiledRule, matches: &MatchTable, data: &[u8]) -> RuleMatch {
        let patterns = rule
            .patterns
            .iter()
            .filter_map(|id| {
                let pattern = &self.rules.patterns[*id];
                let hits = matches.hits(*id);
                if pattern.private || hits.is_empty() {
                    return None;
                }
                let occurrences = hits
                    .iter()
                    .map(|(offset, length)| {
                        let kept = (*length).min(self.config.max_match_data);
                        MatchOccurrence {
                            offset: *offset,
                            length: *length,
                            data: data[*offset..*offset + kept].to_vec(),
                        }
                    })
                    .collect();
                Some(PatternMatches {
                    identifier: pattern.identifier.clone(),
                    occurrences,
                })
            })
            .collect();
        RuleMatch {
            identifier: rule.identifier.clone(),
            namespace: rule.namespace.clone(),
            tags: rule.tags.clone(),
            metadata: resolve_metadata(&rule.metadata, self.config.allow_duplicate_metadata),
            patterns,
        }
    }
}
