//! Intermediate Representation (IR) for compiled rule sets.
//!
//! This module defines the data the compiler produces and the scanner and
//! evaluator consume: compiled patterns with their search atoms, rules with
//! their resolved condition trees, and the typed values that flow in from
//! metadata and external variables. Everything here is immutable after
//! compilation and serializable.

use crate::regex::{Program, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PatternId = usize;
pub type RuleId = usize;

/// A fixed byte string the multi-pattern search looks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub bytes: Vec<u8>,
    /// Distance from the start of the match to the start of the atom.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    Text,
    Hex,
    Regex,
}

/// How one concrete form of a pattern is verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormMatcher {
    /// Exact byte string, optionally ASCII case-insensitive.
    Literal { bytes: Vec<u8>, nocase: bool },
    Program(Program),
}

/// One searchable rendition of a pattern (for example its wide form, or one
/// xor key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternForm {
    pub matcher: FormMatcher,
    /// Empty when the form has no usable atom and is tried at every offset.
    pub atoms: Vec<Atom>,
    /// Word-boundary checks look at UTF-16LE code units.
    pub wide: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPattern {
    /// Name including the `$`; `$` alone for anonymous patterns.
    pub identifier: String,
    pub rule: RuleId,
    pub kind: PatternKind,
    pub fullword: bool,
    pub private: bool,
    pub forms: Vec<PatternForm>,
    pub line: usize,
}

/// Value of a `meta:` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaValue {
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Integer(value) => write!(f, "{value}"),
            MetaValue::Boolean(value) => write!(f, "{value}"),
            MetaValue::String(value) => write!(f, "{value:?}"),
        }
    }
}

/// Value bound to an external variable.
///
/// # Examples
///
/// ```rust
/// use yara_engine::ExternalValue;
///
/// assert_eq!(ExternalValue::from(7), ExternalValue::Integer(7));
/// assert_eq!(ExternalValue::from("x").type_name(), "string");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(Vec<u8>),
}

impl ExternalValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExternalValue::Integer(_) => "integer",
            ExternalValue::Float(_) => "float",
            ExternalValue::Boolean(_) => "boolean",
            ExternalValue::String(_) => "string",
        }
    }
}

impl From<i64> for ExternalValue {
    fn from(value: i64) -> Self {
        ExternalValue::Integer(value)
    }
}

impl From<i32> for ExternalValue {
    fn from(value: i32) -> Self {
        ExternalValue::Integer(value.into())
    }
}

impl From<f64> for ExternalValue {
    fn from(value: f64) -> Self {
        ExternalValue::Float(value)
    }
}

impl From<bool> for ExternalValue {
    fn from(value: bool) -> Self {
        ExternalValue::Boolean(value)
    }
}

impl From<&str> for ExternalValue {
    fn from(value: &str) -> Self {
        ExternalValue::String(value.as_bytes().to_vec())
    }
}

impl From<String> for ExternalValue {
    fn from(value: String) -> Self {
        ExternalValue::String(value.into_bytes())
    }
}

impl From<Vec<u8>> for ExternalValue {
    fn from(value: Vec<u8>) -> Self {
        ExternalValue::String(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDecl {
    pub name: String,
    pub default: ExternalValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub identifier: String,
    pub namespace: String,
    pub tags: Vec<String>,
    /// Declaration order, duplicates kept.
    pub metadata: Vec<(String, MetaValue)>,
    pub is_global: bool,
    pub is_private: bool,
    pub patterns: Vec<PatternId>,
    pub condition: Expr,
    /// Loop variable slots the condition needs.
    pub variable_slots: usize,
    /// Modules the condition may read.
    pub imports: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrOp {
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IEquals,
}

/// Pattern operand of `$`, `#`, `@` and `!` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternRef {
    Id(PatternId),
    /// The pattern bound by the innermost `for ... of` loop.
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Anchor {
    At(Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Quantifier {
    All,
    Any,
    None,
    Count(Box<Expr>),
    Percent(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Iterable {
    Range(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    /// Module array or dictionary.
    Object(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldBase {
    Module(String),
    Variable(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldStep {
    Field(String),
    Index(Box<Expr>),
    Call(Vec<Expr>),
}

/// Resolved, type-checked condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
    Filesize,
    Entrypoint,
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Defined(Box<Expr>),
    Neg(Box<Expr>),
    BitNot(Box<Expr>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    StrOp {
        op: StrOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Matches {
        lhs: Box<Expr>,
        regex: Regex,
    },
    PatternFound {
        pattern: PatternRef,
        anchor: Option<Anchor>,
    },
    PatternCount {
        pattern: PatternRef,
        range: Option<(Box<Expr>, Box<Expr>)>,
    },
    /// 1-based occurrence index.
    PatternOffset {
        pattern: PatternRef,
        index: Box<Expr>,
    },
    PatternLength {
        pattern: PatternRef,
        index: Box<Expr>,
    },
    ReadInteger {
        width: u8,
        signed: bool,
        big_endian: bool,
        offset: Box<Expr>,
    },
    External(usize),
    Rule(RuleId),
    Variable(usize),
    Field {
        base: FieldBase,
        path: Vec<FieldStep>,
    },
    Of {
        quantifier: Quantifier,
        patterns: Vec<PatternId>,
        anchor: Option<Anchor>,
    },
    ForOf {
        quantifier: Quantifier,
        patterns: Vec<PatternId>,
        body: Box<Expr>,
    },
    ForIn {
        quantifier: Quantifier,
        variables: Vec<usize>,
        iterable: Iterable,
        body: Box<Expr>,
    },
}

impl Expr {
    /// True if evaluating this tree can read `entrypoint`.
    pub fn uses_entrypoint(&self) -> bool {
        let mut found = false;
        self.visit(&mut |expr| found |= matches!(expr, Expr::Entrypoint));
        found
    }

    /// Pre-order walk over every sub-expression.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Not(e) | Expr::Defined(e) | Expr::Neg(e) | Expr::BitNot(e) => e.visit(f),
            Expr::And(list) | Expr::Or(list) => list.iter().for_each(|e| e.visit(f)),
            Expr::Arith { lhs, rhs, .. }
            | Expr::Compare { lhs, rhs, .. }
            | Expr::StrOp { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Matches { lhs, .. } => lhs.visit(f),
            Expr::PatternFound { anchor, .. } => visit_anchor(anchor.as_ref(), f),
            Expr::Of {
                quantifier, anchor, ..
            } => {
                visit_quantifier(quantifier, f);
                visit_anchor(anchor.as_ref(), f);
            }
            Expr::PatternCount { range, .. } => {
                if let Some((lo, hi)) = range {
                    lo.visit(f);
                    hi.visit(f);
                }
            }
            Expr::PatternOffset { index, .. } | Expr::PatternLength { index, .. } => {
                index.visit(f)
            }
            Expr::ReadInteger { offset, .. } => offset.visit(f),
            Expr::Field { path, .. } => {
                for step in path {
                    match step {
                        FieldStep::Index(e) => e.visit(f),
                        FieldStep::Call(args) => args.iter().for_each(|e| e.visit(f)),
                        FieldStep::Field(_) => {}
                    }
                }
            }
            Expr::ForOf {
                quantifier, body, ..
            } => {
                visit_quantifier(quantifier, f);
                body.visit(f);
            }
            Expr::ForIn {
                quantifier,
                iterable,
                body,
                ..
            } => {
                visit_quantifier(quantifier, f);
                match iterable {
                    Iterable::Range(lo, hi) => {
                        lo.visit(f);
                        hi.visit(f);
                    }
                    Iterable::List(items) => items.iter().for_each(|e| e.visit(f)),
                    Iterable::Object(e) => e.visit(f),
                }
                body.visit(f);
            }
            _ => {}
        }
    }
}

fn visit_anchor(anchor: Option<&Anchor>, f: &mut dyn FnMut(&Expr)) {
    match anchor {
        Some(Anchor::At(e)) => e.visit(f),
        Some(Anchor::In(lo, hi)) => {
            lo.visit(f);
            hi.visit(f);
        }
        None => {}
    }
}

fn visit_quantifier(quantifier: &Quantifier, f: &mut dyn FnMut(&Expr)) {
    if let Quantifier::Count(e) | Quantifier::Percent(e) = quantifier {
        e.visit(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_value_conversions() {
        assert_eq!(ExternalValue::from(1.5), ExternalValue::Float(1.5));
        assert_eq!(ExternalValue::from(true).type_name(), "boolean");
        assert_eq!(
            ExternalValue::from(String::from("ab")),
            ExternalValue::String(b"ab".to_vec())
        );
    }

    #[test]
    fn test_meta_value_display() {
        assert_eq!(MetaValue::Integer(-3).to_string(), "-3");
        assert_eq!(MetaValue::String("a\"b".into()).to_string(), "\"a\\\"b\"");
    }

    #[test]
    fn test_uses_entrypoint() {
        let expr = Expr::And(vec![
            Expr::Boolean(true),
            Expr::Compare {
                op: CmpOp::Eq,
                lhs: Box::new(Expr::Entrypoint),
                rhs: Box::new(Expr::Integer(0)),
            },
        ]);
        assert!(expr.uses_entrypoint());
        assert!(!Expr::Filesize.uses_entrypoint());
    }
}
