//! Candidate verification.
//!
//! Turns atom hits into confirmed pattern occurrences: each candidate start
//! is checked against the owning form (byte comparison for literals, the
//! bounded backtracker for hex and regex programs), then against the
//! `fullword` boundary rule. Occurrences are kept per pattern, sorted and
//! unique by offset.

use super::prefilter::AtomPrefilter;
use super::results::ScanWarning;
use crate::config::ScanConfig;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::ir::{CompiledPattern, CompiledRule, FormMatcher, PatternForm, PatternId};
use crate::regex::ast::is_word_byte;
use crate::regex::{Backtracker, Budget, MatchAbort};
use std::collections::{BTreeMap, HashMap};
use tracing::{trace, warn};

const DEADLINE_CHECK_INTERVAL: usize = 1024;

/// Confirmed `(offset, length)` occurrences for every pattern of a rule set.
#[derive(Debug, Clone, Default)]
pub(crate) struct MatchTable {
    hits: Vec<Vec<(usize, usize)>>,
}

impl MatchTable {
    pub fn hits(&self, pattern: PatternId) -> &[(usize, usize)] {
        self.hits.get(pattern).map(Vec::as_slice).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MatchStats {
    pub atom_hits: usize,
    pub candidates: usize,
}

enum Starts {
    List(Vec<usize>),
    Every,
}

pub(crate) struct PatternScan<'a> {
    pub patterns: &'a [CompiledPattern],
    pub rules: &'a [CompiledRule],
    pub prefilter: &'a AtomPrefilter,
    pub config: &'a ScanConfig,
    pub deadline: &'a Deadline,
}

impl PatternScan<'_> {
    pub fn run(
        &self,
        data: &[u8],
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<(MatchTable, MatchStats)> {
        let mut stats = MatchStats::default();
        let mut candidates: HashMap<(PatternId, usize), Vec<usize>> = HashMap::new();
        stats.atom_hits = self.prefilter.candidates(data, |pattern, form, start| {
            candidates.entry((pattern, form)).or_default().push(start);
        });
        self.deadline.check()?;

        let mut grouped: BTreeMap<PatternId, Vec<(usize, Starts)>> = BTreeMap::new();
        for ((pattern, form), mut starts) in candidates {
            starts.sort_unstable();
            starts.dedup();
            grouped
                .entry(pattern)
                .or_default()
                .push((form, Starts::List(starts)));
        }
        for unanchored in self.prefilter.unanchored() {
            grouped
                .entry(unanchored.pattern)
                .or_default()
                .push((unanchored.form, Starts::Every));
        }

        let mut table = MatchTable {
            hits: vec![Vec::new(); self.patterns.len()],
        };
        for (pattern_id, mut forms) in grouped {
            forms.sort_by_key(|(form, _)| *form);
            let hits = self.verify_pattern(pattern_id, &forms, data, &mut stats, warnings)?;
            trace!(
                pattern = %self.patterns[pattern_id].identifier,
                occurrences = hits.len(),
                "pattern verified"
            );
            table.hits[pattern_id] = hits;
        }
        Ok((table, stats))
    }

    fn verify_pattern(
        &self,
        pattern_id: PatternId,
        forms: &[(usize, Starts)],
        data: &[u8],
        stats: &mut MatchStats,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<Vec<(usize, usize)>> {
        let pattern = &self.patterns[pattern_id];
        let mut found: BTreeMap<usize, usize> = BTreeMap::new();
        let mut budget_warned = false;

        'forms: for (form_id, starts) in forms {
            let form = &pattern.forms[*form_id];
            let mut verifier = FormVerifier::new(form, self.config.max_unbounded_gap);
            let starts: Box<dyn Iterator<Item = usize> + '_> = match starts {
                Starts::List(list) => Box::new(list.iter().copied()),
                Starts::Every => Box::new(0..data.len()),
            };
            for start in starts {
                stats.candidates += 1;
                if stats.candidates % DEADLINE_CHECK_INTERVAL == 0 {
                    self.deadline.check()?;
                }
                if found.contains_key(&start) {
                    continue;
                }
                let mut budget =
                    Budget::new(self.config.max_verification_steps, Some(self.deadline));
                match verifier.verify(data, start, &mut budget) {
                    Ok(Some(length)) if length > 0 => {
                        if pattern.fullword && !is_fullword(data, start, start + length, form.wide)
                        {
                            continue;
                        }
                        if found.len() >= self.config.max_matches_per_pattern {
                            warnings.push(self.warning(pattern, true));
                            break 'forms;
                        }
                        found.insert(start, length);
                    }
                    Ok(_) => {}
                    Err(MatchAbort::StepLimit) => {
                        if !budget_warned {
                            budget_warned = true;
                            warnings.push(self.warning(pattern, false));
                        }
                    }
                    Err(MatchAbort::Interrupted(interrupt)) => return Err(interrupt.into()),
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    fn warning(&self, pattern: &CompiledPattern, too_many: bool) -> ScanWarning {
        let rule = &self.rules[pattern.rule];
        let (namespace, rule, pattern) = (
            rule.namespace.clone(),
            rule.identifier.clone(),
            pattern.identifier.clone(),
        );
        let warning = if too_many {
            ScanWarning::TooManyMatches {
                namespace,
                rule,
                pattern,
            }
        } else {
            ScanWarning::VerificationBudget {
                namespace,
                rule,
                pattern,
            }
        };
        warn!(%warning, "scan warning");
        warning
    }
}

enum FormVerifier<'p> {
    Literal { bytes: &'p [u8], nocase: bool },
    Program(Backtracker<'p>),
}

impl<'p> FormVerifier<'p> {
    fn new(form: &'p PatternForm, gap_ceiling: Option<usize>) -> Self {
        match &form.matcher {
            FormMatcher::Literal { bytes, nocase } => FormVerifier::Literal {
                bytes,
                nocase: *nocase,
            },
            FormMatcher::Program(program) => {
                FormVerifier::Program(Backtracker::new(program).with_gap_ceiling(gap_ceiling))
            }
        }
    }

    /// Length of the match anchored at `start`.
    fn verify(
        &mut self,
        data: &[u8],
        start: usize,
        budget: &mut Budget<'_>,
    ) -> std::result::Result<Option<usize>, MatchAbort> {
        match self {
            FormVerifier::Literal { bytes, nocase } => {
                let Some(window) = data.get(start..start + bytes.len()) else {
                    return Ok(None);
                };
                let hit = if *nocase {
                    window.eq_ignore_ascii_case(bytes)
                } else {
                    window == *bytes
                };
                Ok(hit.then_some(bytes.len()))
            }
            FormVerifier::Program(backtracker) => Ok(backtracker
                .match_at(data, start, budget)?
                .map(|end| end - start)),
        }
    }
}

/// No word character directly before or after `data[start..end]`. For wide
/// forms the neighbours are UTF-16LE code units.
fn is_fullword(data: &[u8], start: usize, end: usize, wide: bool) -> bool {
    if wide {
        let before = start >= 2 && data[start - 1] == 0 && is_word_byte(data[start - 2]);
        let after = end + 1 < data.len() && data[end + 1] == 0 && is_word_byte(data[end]);
        !before && !after
    } else {
        let before = start > 0 && is_word_byte(data[start - 1]);
        let after = end < data.len() && is_word_byte(data[end]);
        !before && !after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fullword_ascii() {
        assert!(is_fullword(b"a domain.com", 2, 8, false));
        assert!(!is_fullword(b"mydomain.com", 2, 8, false));
        assert!(!is_fullword(b"domains", 0, 6, false));
        assert!(is_fullword(b"domain", 0, 6, false));
    }

    #[test]
    fn test_fullword_wide() {
        let data = b"x\0a\0b\0 \0";
        assert!(!is_fullword(data, 2, 6, true));
        assert!(!is_fullword(data, 2, 4, true));
        let spaced = b" \0a\0b\0 \0";
        assert!(is_fullword(spaced, 2, 6, true));
    }

    #[test]
    fn test_literal_verifier() {
        let form = PatternForm {
            matcher: FormMatcher::Literal {
                bytes: b"abc".to_vec(),
                nocase: true,
            },
            atoms: Vec::new(),
            wide: false,
        };
        let mut verifier = FormVerifier::new(&form, None);
        let mut budget = Budget::unlimited();
        assert_eq!(verifier.verify(b"xABc", 1, &mut budget), Ok(Some(3)));
        assert_eq!(verifier.verify(b"xABc", 2, &mut budget), Ok(None));
    }
}
