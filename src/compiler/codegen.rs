//! Condition lowering from the syntax tree to the typed IR.
//!
//! Resolves every name a condition mentions (loop variables, external
//! variables, earlier rules, integer-read functions, imported modules),
//! checks operand types, and records which patterns the condition uses.

use super::ast::{self, Accessor, BinaryOp, ExprKind, PatternSet, UnaryOp};
use super::diagnostics::{Diagnostic, Diagnostics, WarningKind};
use crate::error::{Result, SourceLocation, YaraError};
use crate::ir::{
    Anchor, ArithOp, CmpOp, Expr, ExternalDecl, ExternalValue, FieldBase, FieldStep, Iterable,
    PatternId, PatternRef, Quantifier, RuleId, StrOp,
};
use crate::regex::{Regex, RegexFlags};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Bool,
    Integer,
    Float,
    String,
    /// Module data; checked when the scan reads it.
    Dynamic,
}

impl Ty {
    fn name(self) -> &'static str {
        match self {
            Ty::Bool => "boolean",
            Ty::Integer => "integer",
            Ty::Float => "float",
            Ty::String => "string",
            Ty::Dynamic => "module value",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, Ty::Integer | Ty::Float | Ty::Dynamic)
    }

    fn is_integer(self) -> bool {
        matches!(self, Ty::Integer | Ty::Dynamic)
    }

    fn is_string(self) -> bool {
        matches!(self, Ty::String | Ty::Dynamic)
    }
}

impl From<&ExternalValue> for Ty {
    fn from(value: &ExternalValue) -> Self {
        match value {
            ExternalValue::Integer(_) => Ty::Integer,
            ExternalValue::Float(_) => Ty::Float,
            ExternalValue::Boolean(_) => Ty::Bool,
            ExternalValue::String(_) => Ty::String,
        }
    }
}

/// Names visible to one rule's condition.
pub(crate) struct RuleScope<'a> {
    pub file: Option<&'a str>,
    pub externals: &'a [ExternalDecl],
    /// Rules declared earlier in the same namespace.
    pub rules: &'a HashMap<String, RuleId>,
    pub imports: &'a [String],
    /// The rule's patterns as `(name, id)`; anonymous ones have an empty name.
    pub patterns: &'a [(String, PatternId)],
}

#[derive(Debug)]
pub(crate) struct CompiledCondition {
    pub expr: Expr,
    pub variable_slots: usize,
    pub used_patterns: HashSet<PatternId>,
}

pub(crate) fn compile_condition(
    scope: RuleScope<'_>,
    condition: &ast::Expr,
    diagnostics: &mut Diagnostics,
) -> Result<CompiledCondition> {
    let mut compiler = ConditionCompiler {
        scope,
        diagnostics,
        variables: Vec::new(),
        max_slots: 0,
        for_of_depth: 0,
        used: HashSet::new(),
    };
    let (expr, _) = compiler.lower(condition)?;
    Ok(CompiledCondition {
        expr,
        variable_slots: compiler.max_slots,
        used_patterns: compiler.used,
    })
}

struct ConditionCompiler<'a, 'd> {
    scope: RuleScope<'a>,
    diagnostics: &'d mut Diagnostics,
    /// Loop variables in scope, innermost last.
    variables: Vec<(String, usize, Ty)>,
    max_slots: usize,
    for_of_depth: usize,
    used: HashSet<PatternId>,
}

impl<'a, 'd> ConditionCompiler<'a, 'd> {
    fn location(&self, line: usize) -> SourceLocation {
        SourceLocation::new(self.scope.file.map(str::to_string), line)
    }

    fn syntax(&self, line: usize, message: impl Into<String>) -> YaraError {
        YaraError::syntax(self.location(line), message)
    }

    fn type_error(&self, line: usize, message: impl Into<String>) -> YaraError {
        YaraError::type_error(self.location(line), message)
    }

    fn lower(&mut self, expr: &ast::Expr) -> Result<(Expr, Ty)> {
        let line = expr.line;
        Ok(match &expr.kind {
            ExprKind::Boolean(value) => (Expr::Boolean(*value), Ty::Bool),
            ExprKind::Integer(value) => (Expr::Integer(*value), Ty::Integer),
            ExprKind::Float(value) => (Expr::Float(*value), Ty::Float),
            ExprKind::Text(text) => (Expr::Text(text.clone()), Ty::String),
            ExprKind::Regex { .. } => {
                return Err(self.syntax(line, "regular expression used outside of \"matches\""))
            }
            ExprKind::Filesize => (Expr::Filesize, Ty::Integer),
            ExprKind::Entrypoint => (Expr::Entrypoint, Ty::Integer),
            ExprKind::PatternMatch { name, anchor } => {
                let pattern = self.pattern_ref(name, '$', line)?;
                let anchor = self.anchor(anchor.as_ref())?;
                (Expr::PatternFound { pattern, anchor }, Ty::Bool)
            }
            ExprKind::PatternCount { name, range } => {
                let pattern = self.pattern_ref(name, '#', line)?;
                let range = match range {
                    Some((lo, hi)) => Some(self.range(lo, hi)?),
                    None => None,
                };
                (Expr::PatternCount { pattern, range }, Ty::Integer)
            }
            ExprKind::PatternOffset { name, index } | ExprKind::PatternLength { name, index } => {
                let sigil = if matches!(expr.kind, ExprKind::PatternOffset { .. }) {
                    '@'
                } else {
                    '!'
                };
                let pattern = self.pattern_ref(name, sigil, line)?;
                let index = match index {
                    Some(index) => Box::new(self.integer(index)?),
                    None => Box::new(Expr::Integer(1)),
                };
                let lowered = if sigil == '@' {
                    Expr::PatternOffset { pattern, index }
                } else {
                    Expr::PatternLength { pattern, index }
                };
                (lowered, Ty::Integer)
            }
            ExprKind::Identifier { name, accessors } => self.identifier(name, accessors, line)?,
            ExprKind::Unary { op, operand } => self.unary(*op, operand, line)?,
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, line)?,
            ExprKind::Of {
                quantifier,
                set,
                anchor,
            } => {
                let patterns = self.pattern_set(set, line)?;
                let quantifier = self.quantifier(quantifier, patterns.len(), line)?;
                let anchor = self.anchor(anchor.as_ref())?;
                (
                    Expr::Of {
                        quantifier,
                        patterns,
                        anchor,
                    },
                    Ty::Bool,
                )
            }
            ExprKind::ForOf {
                quantifier,
                set,
                body,
            } => {
                let patterns = self.pattern_set(set, line)?;
                let quantifier = self.quantifier(quantifier, patterns.len(), line)?;
                self.for_of_depth += 1;
                let body = self.lower(body);
                self.for_of_depth -= 1;
                let (body, _) = body?;
                (
                    Expr::ForOf {
                        quantifier,
                        patterns,
                        body: Box::new(body),
                    },
                    Ty::Bool,
                )
            }
            ExprKind::ForIn {
                quantifier,
                variables,
                iterable,
                body,
            } => self.for_in(quantifier, variables, iterable, body, line)?,
        })
    }

    fn integer(&mut self, expr: &ast::Expr) -> Result<Expr> {
        let (lowered, ty) = self.lower(expr)?;
        if !ty.is_integer() {
            return Err(self.type_error(
                expr.line,
                format!("expected integer, found {}", ty.name()),
            ));
        }
        Ok(lowered)
    }

    fn range(&mut self, lo: &ast::Expr, hi: &ast::Expr) -> Result<(Box<Expr>, Box<Expr>)> {
        Ok((Box::new(self.integer(lo)?), Box::new(self.integer(hi)?)))
    }

    fn anchor(&mut self, anchor: Option<&ast::Anchor>) -> Result<Option<Anchor>> {
        Ok(match anchor {
            None => None,
            Some(ast::Anchor::At(offset)) => Some(Anchor::At(Box::new(self.integer(offset)?))),
            Some(ast::Anchor::In(lo, hi)) => {
                let (lo, hi) = self.range(lo, hi)?;
                Some(Anchor::In(lo, hi))
            }
        })
    }

    fn pattern_ref(&mut self, name: &str, sigil: char, line: usize) -> Result<PatternRef> {
        if name.is_empty() {
            if self.for_of_depth == 0 {
                return Err(self.syntax(line, format!("\"{sigil}\" used outside of \"for ... of\"")));
            }
            return Ok(PatternRef::Current);
        }
        let id = self
            .scope
            .patterns
            .iter()
            .find(|(pattern, _)| pattern == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| self.syntax(line, format!("undefined string identifier \"{sigil}{name}\"")))?;
        self.used.insert(id);
        Ok(PatternRef::Id(id))
    }

    fn pattern_set(&mut self, set: &PatternSet, line: usize) -> Result<Vec<PatternId>> {
        let mut ids: Vec<PatternId> = Vec::new();
        match set {
            PatternSet::Them => {
                if self.scope.patterns.is_empty() {
                    return Err(self.syntax(line, "\"them\" used in a rule without strings"));
                }
                ids.extend(self.scope.patterns.iter().map(|(_, id)| *id));
            }
            PatternSet::Items(items) => {
                for item in items {
                    let mut matched = false;
                    for (name, id) in self.scope.patterns {
                        let hit = if item.wildcard {
                            name.starts_with(&item.name)
                        } else {
                            *name == item.name
                        };
                        matched |= hit;
                        if hit && !ids.contains(id) {
                            ids.push(*id);
                        }
                    }
                    if !matched {
                        let suffix = if item.wildcard { "*" } else { "" };
                        return Err(self.syntax(
                            line,
                            format!("undefined string identifier \"${}{suffix}\"", item.name),
                        ));
                    }
                }
            }
        }
        self.used.extend(ids.iter().copied());
        Ok(ids)
    }

    fn quantifier(
        &mut self,
        quantifier: &ast::Quantifier,
        set_len: usize,
        line: usize,
    ) -> Result<Quantifier> {
        Ok(match quantifier {
            ast::Quantifier::All => Quantifier::All,
            ast::Quantifier::Any => Quantifier::Any,
            ast::Quantifier::None => Quantifier::None,
            ast::Quantifier::Count(count) => {
                let lowered = self.integer(count)?;
                if let Expr::Integer(n) = lowered {
                    if set_len > 0 && n > set_len as i64 {
                        let location = self.location(line);
                        self.diagnostics.warn(Diagnostic::new(
                            WarningKind::UnsatisfiableQuantifier,
                            location,
                            format!(
                                "expression always false: requesting {n} of {set_len} items"
                            ),
                        ));
                    }
                }
                Quantifier::Count(Box::new(lowered))
            }
            ast::Quantifier::Percent(percent) => {
                let lowered = self.integer(percent)?;
                if let Expr::Integer(n) = lowered {
                    if !(1..=100).contains(&n) {
                        return Err(self.syntax(line, "percentage must be between 1 and 100"));
                    }
                }
                Quantifier::Percent(Box::new(lowered))
            }
        })
    }

    fn identifier(&mut self, name: &str, accessors: &[Accessor], line: usize) -> Result<(Expr, Ty)> {
        if let Some((_, slot, ty)) = self.variables.iter().rev().find(|(var, ..)| var == name) {
            let (slot, ty) = (*slot, *ty);
            if accessors.is_empty() {
                return Ok((Expr::Variable(slot), ty));
            }
            let path = self.field_path(accessors)?;
            return Ok((
                Expr::Field {
                    base: FieldBase::Variable(slot),
                    path,
                },
                Ty::Dynamic,
            ));
        }

        if let Some(index) = self.scope.externals.iter().position(|e| e.name == name) {
            if !accessors.is_empty() {
                return Err(self.type_error(line, format!("\"{name}\" is not a structure")));
            }
            return Ok((Expr::External(index), Ty::from(&self.scope.externals[index].default)));
        }

        if let Some(id) = self.scope.rules.get(name) {
            if !accessors.is_empty() {
                return Err(self.type_error(line, format!("\"{name}\" is not a structure")));
            }
            return Ok((Expr::Rule(*id), Ty::Bool));
        }

        if let Some((width, signed, big_endian)) = integer_reader(name) {
            let [Accessor::Call(args)] = accessors else {
                return Err(self.syntax(line, format!("\"{name}\" must be called with one argument")));
            };
            let [offset] = args.as_slice() else {
                return Err(self.syntax(line, format!("\"{name}\" must be called with one argument")));
            };
            let offset = Box::new(self.integer(offset)?);
            return Ok((
                Expr::ReadInteger {
                    width,
                    signed,
                    big_endian,
                    offset,
                },
                Ty::Integer,
            ));
        }

        if self.scope.imports.iter().any(|module| module == name) {
            let path = self.field_path(accessors)?;
            return Ok((
                Expr::Field {
                    base: FieldBase::Module(name.to_string()),
                    path,
                },
                Ty::Dynamic,
            ));
        }

        Err(self.syntax(line, format!("undefined identifier \"{name}\"")))
    }

    fn field_path(&mut self, accessors: &[Accessor]) -> Result<Vec<FieldStep>> {
        accessors
            .iter()
            .map(|accessor| {
                Ok(match accessor {
                    Accessor::Field(name) => FieldStep::Field(name.clone()),
                    Accessor::Index(index) => FieldStep::Index(Box::new(self.lower(index)?.0)),
                    Accessor::Call(args) => FieldStep::Call(
                        args.iter()
                            .map(|arg| self.lower(arg).map(|(e, _)| e))
                            .collect::<Result<_>>()?,
                    ),
                })
            })
            .collect()
    }

    fn unary(&mut self, op: UnaryOp, operand: &ast::Expr, line: usize) -> Result<(Expr, Ty)> {
        let (inner, ty) = self.lower(operand)?;
        Ok(match op {
            UnaryOp::Not => (Expr::Not(Box::new(inner)), Ty::Bool),
            UnaryOp::Defined => (Expr::Defined(Box::new(inner)), Ty::Bool),
            UnaryOp::Neg => {
                if !ty.is_numeric() {
                    return Err(self.type_error(line, format!("wrong type for \"-\": {}", ty.name())));
                }
                (Expr::Neg(Box::new(inner)), ty)
            }
            UnaryOp::BitNot => {
                if !ty.is_integer() {
                    return Err(self.type_error(line, format!("wrong type for \"~\": {}", ty.name())));
                }
                (Expr::BitNot(Box::new(inner)), Ty::Integer)
            }
        })
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
        line: usize,
    ) -> Result<(Expr, Ty)> {
        if op == BinaryOp::Matches {
            let (subject, ty) = self.lower(lhs)?;
            if !ty.is_string() {
                return Err(self.type_error(line, format!("wrong type for \"matches\": {}", ty.name())));
            }
            let ExprKind::Regex {
                pattern,
                nocase,
                dotall,
            } = &rhs.kind
            else {
                return Err(self.syntax(line, "\"matches\" requires a regular expression"));
            };
            let regex = Regex::new(
                pattern,
                RegexFlags {
                    nocase: *nocase,
                    dotall: *dotall,
                },
            )
            .map_err(|e| self.syntax(line, format!("invalid regular expression: {e}")))?;
            return Ok((
                Expr::Matches {
                    lhs: Box::new(subject),
                    regex,
                },
                Ty::Bool,
            ));
        }

        let (left, lt) = self.lower(lhs)?;
        let (right, rt) = self.lower(rhs)?;
        let mismatch = || {
            format!(
                "wrong types for \"{}\": {} and {}",
                op.symbol(),
                lt.name(),
                rt.name()
            )
        };

        match op {
            BinaryOp::And | BinaryOp::Or => {
                let mut items = Vec::new();
                for side in [left, right] {
                    match (op, side) {
                        (BinaryOp::And, Expr::And(inner)) | (BinaryOp::Or, Expr::Or(inner)) => {
                            items.extend(inner)
                        }
                        (_, other) => items.push(other),
                    }
                }
                let expr = if op == BinaryOp::And {
                    Expr::And(items)
                } else {
                    Expr::Or(items)
                };
                Ok((expr, Ty::Bool))
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordered = !matches!(op, BinaryOp::Eq | BinaryOp::Ne);
                let compatible = lt == Ty::Dynamic
                    || rt == Ty::Dynamic
                    || (lt.is_numeric() && rt.is_numeric())
                    || (lt == Ty::String && rt == Ty::String)
                    || (!ordered && lt == Ty::Bool && rt == Ty::Bool);
                if !compatible {
                    return Err(self.type_error(line, mismatch()));
                }
                let op = match op {
                    BinaryOp::Eq => CmpOp::Eq,
                    BinaryOp::Ne => CmpOp::Ne,
                    BinaryOp::Lt => CmpOp::Lt,
                    BinaryOp::Le => CmpOp::Le,
                    BinaryOp::Gt => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                Ok((
                    Expr::Compare {
                        op,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    },
                    Ty::Bool,
                ))
            }
            BinaryOp::Contains
            | BinaryOp::IContains
            | BinaryOp::StartsWith
            | BinaryOp::IStartsWith
            | BinaryOp::EndsWith
            | BinaryOp::IEndsWith
            | BinaryOp::IEquals => {
                if !(lt.is_string() && rt.is_string()) {
                    return Err(self.type_error(line, mismatch()));
                }
                let op = match op {
                    BinaryOp::Contains => StrOp::Contains,
                    BinaryOp::IContains => StrOp::IContains,
                    BinaryOp::StartsWith => StrOp::StartsWith,
                    BinaryOp::IStartsWith => StrOp::IStartsWith,
                    BinaryOp::EndsWith => StrOp::EndsWith,
                    BinaryOp::IEndsWith => StrOp::IEndsWith,
                    _ => StrOp::IEquals,
                };
                Ok((
                    Expr::StrOp {
                        op,
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                    },
                    Ty::Bool,
                ))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                if !(lt.is_numeric() && rt.is_numeric()) {
                    return Err(self.type_error(line, mismatch()));
                }
                let ty = match (lt, rt) {
                    (Ty::Dynamic, _) | (_, Ty::Dynamic) => Ty::Dynamic,
                    (Ty::Float, _) | (_, Ty::Float) => Ty::Float,
                    _ => Ty::Integer,
                };
                let op = match op {
                    BinaryOp::Add => ArithOp::Add,
                    BinaryOp::Sub => ArithOp::Sub,
                    BinaryOp::Mul => ArithOp::Mul,
                    _ => ArithOp::Div,
                };
                Ok((arith(op, left, right), ty))
            }
            BinaryOp::Mod
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::Shl
            | BinaryOp::Shr => {
                if !(lt.is_integer() && rt.is_integer()) {
                    return Err(self.type_error(line, mismatch()));
                }
                let op = match op {
                    BinaryOp::Mod => ArithOp::Mod,
                    BinaryOp::BitAnd => ArithOp::BitAnd,
                    BinaryOp::BitOr => ArithOp::BitOr,
                    BinaryOp::BitXor => ArithOp::BitXor,
                    BinaryOp::Shl => ArithOp::Shl,
                    _ => ArithOp::Shr,
                };
                Ok((arith(op, left, right), Ty::Integer))
            }
            BinaryOp::Matches => unreachable!("handled above"),
        }
    }

    fn for_in(
        &mut self,
        quantifier: &ast::Quantifier,
        variables: &[String],
        iterable: &ast::Iterable,
        body: &ast::Expr,
        line: usize,
    ) -> Result<(Expr, Ty)> {
        let (iterable, item_types, set_len) = match iterable {
            ast::Iterable::Range(lo, hi) => {
                let (lo, hi) = self.range(lo, hi)?;
                (Iterable::Range(lo, hi), vec![Ty::Integer], 0)
            }
            ast::Iterable::List(items) => {
                let mut lowered = Vec::with_capacity(items.len());
                let mut item_ty = None;
                for item in items {
                    let (expr, ty) = self.lower(item)?;
                    match item_ty {
                        None => item_ty = Some(ty),
                        Some(first) if first != ty && ty != Ty::Dynamic && first != Ty::Dynamic => {
                            return Err(self.type_error(item.line, "mismatching types in enumeration"))
                        }
                        _ => {}
                    }
                    lowered.push(expr);
                }
                let len = lowered.len();
                (Iterable::List(lowered), vec![item_ty.unwrap_or(Ty::Dynamic)], len)
            }
            ast::Iterable::Expr(object) => {
                let (expr, ty) = self.lower(object)?;
                if ty != Ty::Dynamic {
                    return Err(self.type_error(line, format!("{} is not iterable", ty.name())));
                }
                (Iterable::Object(Box::new(expr)), vec![Ty::Dynamic, Ty::Dynamic], 0)
            }
        };
        let arity_ok = match &iterable {
            Iterable::Object(_) => (1..=2).contains(&variables.len()),
            _ => variables.len() == 1,
        };
        if !arity_ok {
            return Err(self.syntax(line, "wrong number of loop variables"));
        }
        let quantifier = self.quantifier(quantifier, set_len, line)?;

        let base = self.variables.last().map_or(0, |(_, slot, _)| slot + 1);
        let mut slots = Vec::with_capacity(variables.len());
        for (i, name) in variables.iter().enumerate() {
            if self.variables.iter().any(|(var, ..)| var == name)
                || self.scope.externals.iter().any(|e| &e.name == name)
            {
                return Err(self.syntax(line, format!("duplicated loop variable \"{name}\"")));
            }
            let ty = item_types.get(i).copied().unwrap_or(Ty::Dynamic);
            self.variables.push((name.clone(), base + i, ty));
            slots.push(base + i);
        }
        self.max_slots = self.max_slots.max(base + variables.len());
        let body = self.lower(body);
        self.variables.truncate(self.variables.len() - variables.len());
        let (body, _) = body?;
        Ok((
            Expr::ForIn {
                quantifier,
                variables: slots,
                iterable,
                body: Box::new(body),
            },
            Ty::Bool,
        ))
    }
}

fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Arith {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// `(width, signed, big_endian)` for the built-in integer readers.
fn integer_reader(name: &str) -> Option<(u8, bool, bool)> {
    let (signed, rest) = match name.strip_prefix("uint") {
        Some(rest) => (false, rest),
        None => (true, name.strip_prefix("int")?),
    };
    let (bits, big_endian) = match rest.strip_suffix("be") {
        Some(bits) => (bits, true),
        None => (rest, false),
    };
    let width = match bits {
        "8" => 1,
        "16" => 2,
        "32" => 4,
        _ => return None,
    };
    Some((width, signed, big_endian))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::{parse_source, IncludeState};

    fn compile(condition: &str, patterns: &[&str]) -> Result<CompiledCondition> {
        let decls: String = patterns
            .iter()
            .map(|p| format!("{p} = \"xyz\" "))
            .collect();
        let strings = if decls.is_empty() {
            String::new()
        } else {
            format!("strings: {decls}")
        };
        let source = format!("import \"tests\" rule t {{ {strings} condition: {condition} }}");
        let mut includes = IncludeState::new(None, true, "default");
        let unit = parse_source(&source, None, &mut includes)?;
        let rule = &unit.rules[0];
        let ids: Vec<(String, PatternId)> = rule
            .patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let externals = vec![
            ExternalDecl {
                name: "ext_int".to_string(),
                default: ExternalValue::Integer(1),
            },
            ExternalDecl {
                name: "ext_str".to_string(),
                default: ExternalValue::from("s"),
            },
        ];
        let mut rules = HashMap::new();
        rules.insert("earlier".to_string(), 0);
        let scope = RuleScope {
            file: None,
            externals: &externals,
            rules: &rules,
            imports: &rule.imports,
            patterns: &ids,
        };
        let mut diagnostics = Diagnostics::default();
        compile_condition(scope, &rule.condition, &mut diagnostics)
    }

    #[test]
    fn test_integer_readers() {
        assert_eq!(integer_reader("uint16be"), Some((2, false, true)));
        assert_eq!(integer_reader("int32"), Some((4, true, false)));
        assert_eq!(integer_reader("uint64"), None);
        assert_eq!(integer_reader("intx"), None);
    }

    #[test]
    fn test_name_resolution() {
        let compiled = compile("earlier and ext_int > 0 and uint8(0) == 0x4d", &[]).unwrap();
        match compiled.expr {
            Expr::And(items) => {
                assert_eq!(items[0], Expr::Rule(0));
                assert_eq!(items.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(compile("nothing_here", &[]).is_err());
        assert!(compile("tests.integer_array[0] == 1", &[]).is_ok());
    }

    #[test]
    fn test_type_errors() {
        let err = compile("ext_str + 1 > 0", &[]).unwrap_err();
        assert!(matches!(err, YaraError::Type { .. }));
        assert!(compile("\"a\" contains 1", &[]).is_err());
        assert!(compile("1.5 % 2 == 0", &[]).is_err());
        assert!(compile("ext_int matches /a/", &[]).is_err());
        assert!(compile("ext_str matches /a(/", &[]).is_err());
        assert!(compile("true < false", &[]).is_err());
    }

    #[test]
    fn test_pattern_usage() {
        let compiled = compile("$a and #b == 1", &["$a", "$b", "$c"]).unwrap();
        assert_eq!(compiled.used_patterns, HashSet::from([0, 1]));
        let compiled = compile("any of ($c*)", &["$a", "$c1", "$c2"]).unwrap();
        assert_eq!(compiled.used_patterns, HashSet::from([1, 2]));
        assert!(compile("$x", &["$a"]).is_err());
        assert!(compile("any of them", &[]).is_err());
    }

    #[test]
    fn test_for_of_binding() {
        assert!(compile("for any of ($a) : ($ at 0)", &["$a"]).is_ok());
        assert!(compile("$ at 0", &["$a"]).is_err());
        assert!(compile("#", &["$a"]).is_err());
    }

    #[test]
    fn test_loop_variable_slots() {
        let compiled =
            compile("for all i in (1..2) : (for any j in (1, 2) : (i + j > 0))", &[]).unwrap();
        assert_eq!(compiled.variable_slots, 2);
        assert!(compile("for all i in (1..2) : (for any i in (1..2) : (true))", &[]).is_err());
        assert!(compile("for all i, j in (1..2) : (true)", &[]).is_err());
        assert!(compile("for any x in (1, \"a\") : (true)", &[]).is_err());
    }

    #[test]
    fn test_percent_bounds() {
        assert!(compile("101% of them", &["$a"]).is_err());
        assert!(compile("50% of them", &["$a"]).is_ok());
    }

    #[test]
    fn test_unsatisfiable_quantifier_warns() {
        let source = "rule t { strings: $a = \"xyz\" condition: 2 of ($a) }";
        let mut includes = IncludeState::new(None, true, "default");
        let unit = parse_source(source, None, &mut includes).unwrap();
        let rule = &unit.rules[0];
        let ids = vec![("a".to_string(), 0)];
        let rules = HashMap::new();
        let scope = RuleScope {
            file: None,
            externals: &[],
            rules: &rules,
            imports: &[],
            patterns: &ids,
        };
        let mut diagnostics = Diagnostics::default();
        compile_condition(scope, &rule.condition, &mut diagnostics).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.warnings()[0].kind,
            WarningKind::UnsatisfiableQuantifier
        );
    }
}
