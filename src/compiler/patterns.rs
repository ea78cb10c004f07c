//! Lowering of declared patterns into searchable forms.
//!
//! Every modifier combination a pattern can match under becomes its own
//! [`PatternForm`]: `ascii` and `wide` renditions, one form per xor key, and
//! the three alignments of each base64 encoding. Each form carries the atoms
//! the multi-pattern search seeds verification from.

use super::ast::{Modifiers, PatternDecl, PatternValue};
use super::hex;
use crate::error::{Result, YaraError};
use crate::ir::{Atom, FormMatcher, PatternForm, PatternKind};
use crate::regex::{parser as regex_parser, LowerOptions, Program};
use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD, STANDARD_NO_PAD};
use base64::Engine;

const MAX_ATOM_LEN: usize = 4;
/// Atoms scoring below this are flagged as slowing the scan down.
const MIN_ATOM_QUALITY: u32 = 4;

#[derive(Debug)]
pub(crate) struct LoweredPattern {
    pub kind: PatternKind,
    pub forms: Vec<PatternForm>,
    /// Some form has no atom, or only a weak one.
    pub slow: bool,
}

pub(crate) fn lower_pattern(decl: &PatternDecl, max_program_size: usize) -> Result<LoweredPattern> {
    let error = |message: String| YaraError::syntax(decl.location.clone(), message);
    validate_modifiers(&decl.value, &decl.modifiers).map_err(|m| error(m.to_string()))?;

    let (kind, forms) = match &decl.value {
        PatternValue::Text(text) => {
            if text.is_empty() {
                return Err(error("empty string".to_string()));
            }
            let forms = text_forms(text, &decl.modifiers).map_err(error)?;
            (PatternKind::Text, forms)
        }
        PatternValue::Hex(body) => {
            let tokens = hex::parse(body)
                .map_err(|e| error(format!("invalid hex string \"${}\": {e}", decl.name)))?;
            let options = LowerOptions {
                max_size: max_program_size,
                ..LowerOptions::default()
            };
            let program = Program::compile(&hex::to_node(&tokens), options)
                .map_err(|e| error(format!("invalid hex string \"${}\": {e}", decl.name)))?;
            let form = PatternForm {
                matcher: FormMatcher::Program(program),
                atoms: hex::best_atom(&tokens).into_iter().collect(),
                wide: false,
            };
            (PatternKind::Hex, vec![form])
        }
        PatternValue::Regex {
            pattern,
            nocase,
            dotall,
        } => {
            let node = regex_parser::parse(pattern).map_err(|e| {
                error(format!("invalid regular expression \"${}\": {e}", decl.name))
            })?;
            let nocase = *nocase || decl.modifiers.nocase;
            let prefix = node.literal_prefix();
            let mut forms = Vec::new();
            for wide in widths(&decl.modifiers) {
                let options = LowerOptions {
                    nocase,
                    dotall: *dotall,
                    wide,
                    max_size: max_program_size,
                };
                let program = Program::compile(&node, options).map_err(|e| {
                    error(format!("invalid regular expression \"${}\": {e}", decl.name))
                })?;
                let mut head = if wide { widen(&prefix) } else { prefix.clone() };
                head.truncate(MAX_ATOM_LEN);
                let atoms = if head.is_empty() {
                    Vec::new()
                } else if nocase {
                    case_permutations(&head)
                        .into_iter()
                        .map(|bytes| Atom { bytes, offset: 0 })
                        .collect()
                } else {
                    vec![Atom {
                        bytes: head,
                        offset: 0,
                    }]
                };
                forms.push(PatternForm {
                    matcher: FormMatcher::Program(program),
                    atoms,
                    wide,
                });
            }
            (PatternKind::Regex, forms)
        }
    };

    let slow = forms.iter().any(|form| {
        form.atoms
            .iter()
            .map(|atom| atom_quality(&atom.bytes))
            .min()
            .map_or(true, |quality| quality < MIN_ATOM_QUALITY)
    });
    Ok(LoweredPattern { kind, forms, slow })
}

fn validate_modifiers(value: &PatternValue, modifiers: &Modifiers) -> std::result::Result<(), &'static str> {
    let has_base64 = modifiers.base64.is_some() || modifiers.base64wide.is_some();
    match value {
        PatternValue::Hex(_) => {
            if modifiers
                != &(Modifiers {
                    private: modifiers.private,
                    ..Modifiers::default()
                })
            {
                return Err("invalid modifier for hex string");
            }
        }
        PatternValue::Regex { .. } => {
            if modifiers.xor.is_some() || has_base64 {
                return Err("invalid modifier for regular expression");
            }
        }
        PatternValue::Text(_) => {
            if modifiers.xor.is_some() && modifiers.nocase {
                return Err("invalid modifier combination: xor nocase");
            }
            if has_base64 && modifiers.nocase {
                return Err("invalid modifier combination: base64 nocase");
            }
            if has_base64 && modifiers.xor.is_some() {
                return Err("invalid modifier combination: base64 xor");
            }
            if has_base64 && modifiers.fullword {
                return Err("invalid modifier combination: base64 fullword");
            }
        }
    }
    Ok(())
}

/// `false` for the ascii rendition, `true` for the wide one.
fn widths(modifiers: &Modifiers) -> Vec<bool> {
    match (modifiers.ascii, modifiers.wide) {
        (_, false) => vec![false],
        (false, true) => vec![true],
        (true, true) => vec![false, true],
    }
}

fn text_forms(text: &[u8], modifiers: &Modifiers) -> std::result::Result<Vec<PatternForm>, String> {
    let mut forms = Vec::new();
    if modifiers.base64.is_some() || modifiers.base64wide.is_some() {
        for (alphabet, wide) in [(&modifiers.base64, false), (&modifiers.base64wide, true)] {
            let Some(alphabet) = alphabet else { continue };
            for variant in base64_variants(text, alphabet.as_deref())? {
                let bytes = if wide { widen(&variant) } else { variant };
                forms.push(literal_form(bytes, false, wide));
            }
        }
        if forms.is_empty() {
            return Err("string is too short for base64".to_string());
        }
        return Ok(forms);
    }

    for wide in widths(modifiers) {
        let bytes = if wide { widen(text) } else { text.to_vec() };
        match modifiers.xor {
            Some((lo, hi)) => {
                for key in lo..=hi {
                    let xored = bytes.iter().map(|b| b ^ key).collect();
                    forms.push(literal_form(xored, false, wide));
                }
            }
            None => forms.push(literal_form(bytes, modifiers.nocase, wide)),
        }
    }
    Ok(forms)
}

fn literal_form(bytes: Vec<u8>, nocase: bool, wide: bool) -> PatternForm {
    let width = bytes.len().min(MAX_ATOM_LEN);
    let (offset, window) = bytes
        .windows(width)
        .enumerate()
        .max_by_key(|(i, window)| (atom_quality(window), std::cmp::Reverse(*i)))
        .map(|(i, window)| (i, window.to_vec()))
        .unwrap_or_default();
    let atoms = if nocase {
        case_permutations(&window)
            .into_iter()
            .map(|bytes| Atom { bytes, offset })
            .collect()
    } else {
        vec![Atom {
            bytes: window,
            offset,
        }]
    };
    PatternForm {
        matcher: FormMatcher::Literal { bytes, nocase },
        atoms,
        wide,
    }
}

fn atom_quality(bytes: &[u8]) -> u32 {
    bytes.iter().map(|b| hex::byte_quality(*b)).sum()
}

/// Little-endian UTF-16 rendition of ASCII bytes.
fn widen(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().flat_map(|b| [*b, 0]).collect()
}

fn case_permutations(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::with_capacity(bytes.len())];
    for byte in bytes {
        if byte.is_ascii_alphabetic() {
            let mut upper = out.clone();
            for atom in &mut out {
                atom.push(byte.to_ascii_lowercase());
            }
            for atom in &mut upper {
                atom.push(byte.to_ascii_uppercase());
            }
            out.extend(upper);
        } else {
            for atom in &mut out {
                atom.push(*byte);
            }
        }
    }
    out
}

/// The encodings of `text` at each of the three possible alignments within a
/// larger base64 stream, trimmed to the characters that do not depend on the
/// surrounding data.
fn base64_variants(text: &[u8], alphabet: Option<&[u8]>) -> std::result::Result<Vec<Vec<u8>>, String> {
    let custom = match alphabet {
        Some(alphabet) => {
            let alphabet = std::str::from_utf8(alphabet)
                .ok()
                .and_then(|a| Alphabet::new(a).ok())
                .ok_or_else(|| "invalid base64 alphabet".to_string())?;
            Some(GeneralPurpose::new(&alphabet, NO_PAD))
        }
        None => None,
    };

    let mut variants: Vec<Vec<u8>> = Vec::new();
    for (padding, skip) in [(0usize, 0usize), (1, 2), (2, 3)] {
        let mut input = vec![0u8; padding];
        input.extend_from_slice(text);
        let encoded = match &custom {
            Some(engine) => engine.encode(&input),
            None => STANDARD_NO_PAD.encode(&input),
        };
        let mut encoded = encoded.into_bytes();
        if input.len() % 3 != 0 {
            encoded.pop();
        }
        let variant = encoded.get(skip..).unwrap_or_default().to_vec();
        if !variant.is_empty() && !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLocation;

    fn decl(value: PatternValue, modifiers: Modifiers) -> PatternDecl {
        PatternDecl {
            name: "a".to_string(),
            value,
            modifiers,
            location: SourceLocation::new(None, 3),
        }
    }

    fn literals(lowered: &LoweredPattern) -> Vec<Vec<u8>> {
        lowered
            .forms
            .iter()
            .filter_map(|form| match &form.matcher {
                FormMatcher::Literal { bytes, .. } => Some(bytes.clone()),
                FormMatcher::Program(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_ascii_and_wide_forms() {
        let modifiers = Modifiers {
            wide: true,
            ascii: true,
            ..Modifiers::default()
        };
        let lowered = lower_pattern(&decl(PatternValue::Text(b"ab".to_vec()), modifiers), 1 << 16).unwrap();
        assert_eq!(literals(&lowered), vec![b"ab".to_vec(), b"a\0b\0".to_vec()]);
        assert!(lowered.forms[1].wide);
    }

    #[test]
    fn test_xor_forms() {
        let modifiers = Modifiers {
            xor: Some((1, 3)),
            ..Modifiers::default()
        };
        let lowered = lower_pattern(&decl(PatternValue::Text(b"\x10".to_vec()), modifiers), 1 << 16).unwrap();
        assert_eq!(
            literals(&lowered),
            vec![vec![0x11], vec![0x12], vec![0x13]]
        );
    }

    #[test]
    fn test_base64_variants() {
        assert_eq!(
            base64_variants(b"This program cannot", None).unwrap(),
            vec![
                b"VGhpcyBwcm9ncmFtIGNhbm5vd".to_vec(),
                b"RoaXMgcHJvZ3JhbSBjYW5ub3".to_vec(),
                b"UaGlzIHByb2dyYW0gY2Fubm90".to_vec(),
            ]
        );
    }

    #[test]
    fn test_custom_base64_alphabet() {
        let alphabet = b"!@#$%^&*(){}[].,|ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstu";
        assert!(base64_variants(b"abc", Some(alphabet)).is_ok());
        assert!(base64_variants(b"abc", Some(b"short")).is_err());
    }

    #[test]
    fn test_nocase_atom_permutations() {
        let modifiers = Modifiers {
            nocase: true,
            ..Modifiers::default()
        };
        let lowered = lower_pattern(&decl(PatternValue::Text(b"a1b".to_vec()), modifiers), 1 << 16).unwrap();
        let mut atoms: Vec<_> = lowered.forms[0].atoms.iter().map(|a| a.bytes.clone()).collect();
        atoms.sort();
        assert_eq!(
            atoms,
            vec![b"A1B".to_vec(), b"A1b".to_vec(), b"a1B".to_vec(), b"a1b".to_vec()]
        );
    }

    #[test]
    fn test_literal_atom_prefers_rare_bytes() {
        let form = literal_form(b"\0\0\0\0\0MZ\x90\x13".to_vec(), false, false);
        assert_eq!(form.atoms[0].bytes, b"MZ\x90\x13".to_vec());
        assert_eq!(form.atoms[0].offset, 5);
    }

    #[test]
    fn test_slow_pattern_detection() {
        let short = lower_pattern(&decl(PatternValue::Text(b"A".to_vec()), Modifiers::default()), 1 << 16).unwrap();
        assert!(short.slow);
        let long = lower_pattern(&decl(PatternValue::Text(b"ABCD".to_vec()), Modifiers::default()), 1 << 16).unwrap();
        assert!(!long.slow);
        let regex = PatternValue::Regex {
            pattern: b".*x".to_vec(),
            nocase: false,
            dotall: false,
        };
        assert!(lower_pattern(&decl(regex, Modifiers::default()), 1 << 16).unwrap().slow);
    }

    #[test]
    fn test_regex_atoms() {
        let regex = PatternValue::Regex {
            pattern: b"abcdef[0-9]+".to_vec(),
            nocase: false,
            dotall: false,
        };
        let modifiers = Modifiers {
            wide: true,
            ..Modifiers::default()
        };
        let lowered = lower_pattern(&decl(regex, modifiers), 1 << 16).unwrap();
        assert_eq!(lowered.forms[0].atoms[0].bytes, b"a\0b\0".to_vec());
    }

    #[test]
    fn test_invalid_modifier_combinations() {
        let text = || PatternValue::Text(b"abc".to_vec());
        let bad = [
            Modifiers {
                xor: Some((0, 255)),
                nocase: true,
                ..Modifiers::default()
            },
            Modifiers {
                base64: Some(None),
                nocase: true,
                ..Modifiers::default()
            },
            Modifiers {
                base64: Some(None),
                fullword: true,
                ..Modifiers::default()
            },
        ];
        for modifiers in bad {
            assert!(lower_pattern(&decl(text(), modifiers), 1 << 16).is_err());
        }
        let hex = decl(
            PatternValue::Hex("01 02".to_string()),
            Modifiers {
                wide: true,
                ..Modifiers::default()
            },
        );
        let err = lower_pattern(&hex, 1 << 16).unwrap_err();
        assert_eq!(err.line(), Some(3));
    }

    #[test]
    fn test_empty_string_rejected() {
        assert!(lower_pattern(&decl(PatternValue::Text(Vec::new()), Modifiers::default()), 1 << 16).is_err());
    }
}
