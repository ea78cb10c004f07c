//! Syntax tree produced by the parser, before name resolution and typing.

use crate::error::SourceLocation;
use crate::ir::MetaValue;

/// Everything one source text (plus its includes) declares.
#[derive(Debug, Clone, Default)]
pub(crate) struct SourceUnit {
    /// Imported module names, in order of first import.
    pub imports: Vec<String>,
    pub rules: Vec<RuleDecl>,
}

#[derive(Debug, Clone)]
pub(crate) struct RuleDecl {
    pub name: String,
    pub tags: Vec<String>,
    pub is_global: bool,
    pub is_private: bool,
    pub metadata: Vec<(String, MetaValue)>,
    pub patterns: Vec<PatternDecl>,
    pub condition: Expr,
    pub location: SourceLocation,
    /// Modules imported before this rule in its file.
    pub imports: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct PatternDecl {
    /// Name without the `$`; empty for anonymous patterns.
    pub name: String,
    pub value: PatternValue,
    pub modifiers: Modifiers,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PatternValue {
    Text(Vec<u8>),
    /// Body between the braces, comments removed.
    Hex(String),
    Regex {
        pattern: Vec<u8>,
        nocase: bool,
        dotall: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Modifiers {
    pub nocase: bool,
    pub wide: bool,
    pub ascii: bool,
    pub fullword: bool,
    pub private: bool,
    /// Inclusive key range.
    pub xor: Option<(u8, u8)>,
    /// Set when `base64` is present; holds the custom alphabet if one was given.
    pub base64: Option<Option<Vec<u8>>>,
    pub base64wide: Option<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

impl Expr {
    pub fn new(kind: ExprKind, line: usize) -> Self {
        Self { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExprKind {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
    Regex {
        pattern: Vec<u8>,
        nocase: bool,
        dotall: bool,
    },
    Filesize,
    Entrypoint,
    /// `$a`, `$a at e`, `$a in (lo..hi)`; an empty name is the for-of `$`.
    PatternMatch {
        name: String,
        anchor: Option<Anchor>,
    },
    PatternCount {
        name: String,
        range: Option<(Box<Expr>, Box<Expr>)>,
    },
    PatternOffset {
        name: String,
        index: Option<Box<Expr>>,
    },
    PatternLength {
        name: String,
        index: Option<Box<Expr>>,
    },
    /// Dotted, indexed or called name, e.g. `pe.sections[0].name`.
    Identifier {
        name: String,
        accessors: Vec<Accessor>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Of {
        quantifier: Quantifier,
        set: PatternSet,
        anchor: Option<Anchor>,
    },
    ForOf {
        quantifier: Quantifier,
        set: PatternSet,
        body: Box<Expr>,
    },
    ForIn {
        quantifier: Quantifier,
        variables: Vec<String>,
        iterable: Iterable,
        body: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Accessor {
    Field(String),
    Index(Expr),
    Call(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Defined,
    Neg,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
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
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IEquals,
    Matches,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "\\",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Contains => "contains",
            BinaryOp::IContains => "icontains",
            BinaryOp::StartsWith => "startswith",
            BinaryOp::IStartsWith => "istartswith",
            BinaryOp::EndsWith => "endswith",
            BinaryOp::IEndsWith => "iendswith",
            BinaryOp::IEquals => "iequals",
            BinaryOp::Matches => "matches",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Anchor {
    At(Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Quantifier {
    All,
    Any,
    None,
    Count(Box<Expr>),
    Percent(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PatternSet {
    Them,
    /// `($a, $b*, $)`; `wildcard` marks a trailing `*`.
    Items(Vec<SetItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SetItem {
    pub name: String,
    pub wildcard: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Iterable {
    Range(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Expr(Box<Expr>),
}
