//! What a scan reports back.

use crate::ir::{CompiledRule, MetaValue};
use serde::{Deserialize, Serialize};
use std::fmt;
#[cfg(feature = "metrics")]
use std::time::Duration;

/// One occurrence of a pattern in the scanned data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOccurrence {
    pub offset: usize,
    pub length: usize,
    /// Matched bytes, truncated to `ScanConfig::max_match_data`.
    pub data: Vec<u8>,
}

/// Occurrences of one pattern, in ascending offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatches {
    /// Pattern name including `$`.
    pub identifier: String,
    pub occurrences: Vec<MatchOccurrence>,
}

/// A rule whose condition held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub identifier: String,
    pub namespace: String,
    pub tags: Vec<String>,
    /// Resolved metadata: one entry per key holding its last value, or every
    /// entry in declaration order when duplicates were requested.
    pub metadata: Vec<(String, MetaValue)>,
    /// Non-private patterns with at least one occurrence.
    pub patterns: Vec<PatternMatches>,
}

impl RuleMatch {
    /// Last value declared for `key`.
    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn pattern(&self, identifier: &str) -> Option<&PatternMatches> {
        self.patterns.iter().find(|p| p.identifier == identifier)
    }
}

/// Resource limit hit during a scan. Results for the pattern are capped, the
/// scan goes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanWarning {
    TooManyMatches {
        namespace: String,
        rule: String,
        pattern: String,
    },
    /// Some candidate needed more verification steps than allowed and was
    /// treated as not matching.
    VerificationBudget {
        namespace: String,
        rule: String,
        pattern: String,
    },
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanWarning::TooManyMatches {
                namespace,
                rule,
                pattern,
            } => write!(f, "too many matches for {namespace}:{rule}:{pattern}"),
            ScanWarning::VerificationBudget {
                namespace,
                rule,
                pattern,
            } => write!(
                f,
                "verification budget exhausted for {namespace}:{rule}:{pattern}"
            ),
        }
    }
}

/// Counters collected while scanning.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStatistics {
    pub atom_hits: usize,
    pub candidates_verified: usize,
    pub rules_evaluated: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    /// Matching non-private rules in declaration order.
    pub matching_rules: Vec<RuleMatch>,
    pub warnings: Vec<ScanWarning>,
    /// A callback asked to stop; later rules were not evaluated.
    pub aborted: bool,
    #[cfg(feature = "metrics")]
    pub statistics: ScanStatistics,
}

impl ScanResults {
    pub fn matched(&self, identifier: &str) -> bool {
        self.matching_rules.iter().any(|r| r.identifier == identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<&RuleMatch> {
        self.matching_rules.iter().find(|r| r.identifier == identifier)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.matching_rules
            .iter()
            .map(|r| r.identifier.as_str())
            .collect()
    }
}

/// Description of a compiled rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleInfo<'r> {
    pub identifier: &'r str,
    pub namespace: &'r str,
    pub tags: &'r [String],
    /// Every declared entry, duplicates included.
    pub metadata: &'r [(String, MetaValue)],
    pub is_global: bool,
    pub is_private: bool,
}

impl<'r> From<&'r CompiledRule> for RuleInfo<'r> {
    fn from(rule: &'r CompiledRule) -> Self {
        Self {
            identifier: &rule.identifier,
            namespace: &rule.namespace,
            tags: &rule.tags,
            metadata: &rule.metadata,
            is_global: rule.is_global,
            is_private: rule.is_private,
        }
    }
}

/// Passed to the scan callback once per non-private rule.
#[derive(Debug, Clone, Copy)]
pub enum ScanEvent<'a> {
    RuleMatching(&'a RuleMatch),
    RuleNotMatching(RuleInfo<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Abort,
}

/// Metadata as reported for a match.
pub(crate) fn resolve_metadata(
    metadata: &[(String, MetaValue)],
    allow_duplicates: bool,
) -> Vec<(String, MetaValue)> {
    if allow_duplicates {
        return metadata.to_vec();
    }
    let mut resolved: Vec<(String, MetaValue)> = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        match resolved.iter_mut().find(|(name, _)| name == key) {
            Some(entry) => entry.1 = value.clone(),
            None => resolved.push((key.clone(), value.clone())),
        }
    }
    resolved
}
