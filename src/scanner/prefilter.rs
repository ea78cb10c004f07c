//! Atom prefilter for the multi-pattern scan.
//!
//! Every pattern form contributes short atoms; one Aho-Corasick automaton
//! over the distinct atoms finds all of their occurrences in a single pass,
//! overlapping ones included. Each hit becomes a candidate match start for
//! the forms owning that atom. Forms without atoms are reported separately
//! and are verified at every offset.
//!
//! The automaton is never serialized; it is rebuilt from the pattern table
//! when a rule set is compiled or loaded.

use crate::error::{Result, YaraError};
use crate::ir::{CompiledPattern, PatternId};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use std::collections::HashMap;

/// A form that must be tried at every offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FormRef {
    pub pattern: PatternId,
    pub form: usize,
}

#[derive(Debug, Clone, Copy)]
struct AtomOwner {
    pattern: PatternId,
    form: usize,
    /// Distance from match start to atom start.
    offset: usize,
}

/// Statistics about the atom table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefilterStats {
    /// Distinct atoms in the automaton.
    pub atom_count: usize,
    /// Forms verified at every offset for lack of an atom.
    pub unanchored_forms: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AtomPrefilter {
    automaton: Option<AhoCorasick>,
    /// Indexed by automaton pattern id.
    owners: Vec<Vec<AtomOwner>>,
    unanchored: Vec<FormRef>,
}

impl AtomPrefilter {
    pub fn build(patterns: &[CompiledPattern]) -> Result<Self> {
        let mut atoms: Vec<Vec<u8>> = Vec::new();
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut owners: Vec<Vec<AtomOwner>> = Vec::new();
        let mut unanchored = Vec::new();

        for (pattern_id, pattern) in patterns.iter().enumerate() {
            for (form_id, form) in pattern.forms.iter().enumerate() {
                if form.atoms.is_empty() {
                    unanchored.push(FormRef {
                        pattern: pattern_id,
                        form: form_id,
                    });
                    continue;
                }
                for atom in &form.atoms {
                    let slot = *index.entry(atom.bytes.clone()).or_insert_with(|| {
                        atoms.push(atom.bytes.clone());
                        owners.push(Vec::new());
                        atoms.len() - 1
                    });
                    owners[slot].push(AtomOwner {
                        pattern: pattern_id,
                        form: form_id,
                        offset: atom.offset,
                    });
                }
            }
        }

        let automaton = if atoms.is_empty() {
            None
        } else {
            let automaton = AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .build(&atoms)
                .map_err(|e| {
                    YaraError::Compilation(format!("failed to build atom automaton: {e}"))
                })?;
            Some(automaton)
        };

        tracing::debug!(
            atoms = atoms.len(),
            unanchored = unanchored.len(),
            "atom table built"
        );
        Ok(Self {
            automaton,
            owners,
            unanchored,
        })
    }

    pub fn stats(&self) -> PrefilterStats {
        PrefilterStats {
            atom_count: self.owners.len(),
            unanchored_forms: self.unanchored.len(),
        }
    }

    pub fn unanchored(&self) -> &[FormRef] {
        &self.unanchored
    }

    /// Calls `found(pattern, form, start)` for every atom occurrence whose
    /// implied match start lies inside `data`. Returns the number of atom hits.
    pub fn candidates(
        &self,
        data: &[u8],
        mut found: impl FnMut(PatternId, usize, usize),
    ) -> usize {
        let Some(automaton) = &self.automaton else {
            return 0;
        };
        let mut hits = 0;
        for hit in automaton.find_overlapping_iter(data) {
            hits += 1;
            for owner in &self.owners[hit.pattern().as_usize()] {
                if let Some(start) = hit.start().checked_sub(owner.offset) {
                    found(owner.pattern, owner.form, start);
                }
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Atom, FormMatcher, PatternForm, PatternKind};

    fn pattern(forms: Vec<Vec<Atom>>) -> CompiledPattern {
        CompiledPattern {
            identifier: "$a".to_string(),
            rule: 0,
            kind: PatternKind::Text,
            fullword: false,
            private: false,
            forms: forms
                .into_iter()
                .map(|atoms| PatternForm {
                    matcher: FormMatcher::Literal {
                        bytes: b"x".to_vec(),
                        nocase: false,
                    },
                    atoms,
                    wide: false,
                })
                .collect(),
            line: 1,
        }
    }

    fn atom(bytes: &[u8], offset: usize) -> Atom {
        Atom {
            bytes: bytes.to_vec(),
            offset,
        }
    }

    #[test]
    fn test_shared_atoms_and_offsets() {
        let patterns = vec![
            pattern(vec![vec![atom(b"abc", 0)]]),
            pattern(vec![vec![atom(b"abc", 2)], vec![]]),
        ];
        let prefilter = AtomPrefilter::build(&patterns).unwrap();
        assert_eq!(
            prefilter.stats(),
            PrefilterStats {
                atom_count: 1,
                unanchored_forms: 1
            }
        );

        let mut found = Vec::new();
        let hits = prefilter.candidates(b"xxabcabc", |p, f, s| found.push((p, f, s)));
        assert_eq!(hits, 2);
        assert_eq!(found, vec![(0, 0, 2), (1, 0, 0), (0, 0, 5), (1, 0, 3)]);
    }

    #[test]
    fn test_overlapping_hits() {
        let patterns = vec![pattern(vec![vec![atom(b"aa", 0)]])];
        let prefilter = AtomPrefilter::build(&patterns).unwrap();
        let mut starts = Vec::new();
        prefilter.candidates(b"aaaa", |_, _, s| starts.push(s));
        assert_eq!(starts, vec![0, 1, 2]);
    }

    #[test]
    fn test_atom_before_buffer_start_is_dropped() {
        let patterns = vec![pattern(vec![vec![atom(b"bc", 3)]])];
        let prefilter = AtomPrefilter::build(&patterns).unwrap();
        let mut starts = Vec::new();
        prefilter.candidates(b"abcd", |_, _, s| starts.push(s));
        assert!(starts.is_empty());
    }

    #[test]
    fn test_empty_table() {
        let prefilter = AtomPrefilter::build(&[]).unwrap();
        assert_eq!(prefilter.candidates(b"anything", |_, _, _| {}), 0);
    }
}
