//! Condition evaluation.
//!
//! A tree-walking interpreter over [`Expr`]. Values are dynamically tagged
//! but the compiler has already rejected ill-typed operands, so a tag
//! mismatch here can only come from module data and evaluates to undefined.
//!
//! Undefined propagates through arithmetic, comparisons and field access and
//! is false wherever a boolean is needed. `and`/`or` short-circuit left to
//! right. Integer arithmetic wraps; division or modulo by zero, negative
//! shift counts and out-of-bounds reads are undefined.

use crate::deadline::{Deadline, Interrupt};
use crate::ir::{
    Anchor, ArithOp, CmpOp, CompiledRule, Expr, ExternalValue, FieldBase, FieldStep, Iterable,
    PatternId, PatternRef, Quantifier, StrOp,
};
use crate::module::ModuleValue;
use crate::regex::{Budget, MatchAbort};
use crate::scanner::matches::MatchTable;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

const DEADLINE_CHECK_INTERVAL: u32 = 1024;

type Eval<T> = Result<T, Interrupt>;

#[derive(Debug, Clone)]
enum Value<'a> {
    Undefined,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Cow<'a, [u8]>),
    /// Array, dictionary, struct or function from module data.
    Object(Cow<'a, ModuleValue>),
}

impl Value<'_> {
    fn truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bytes(b) => !b.is_empty(),
            Value::Object(_) => true,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn to_module_value(&self) -> ModuleValue {
        match self {
            Value::Undefined => ModuleValue::Undefined,
            Value::Boolean(b) => ModuleValue::Integer(i64::from(*b)),
            Value::Integer(i) => ModuleValue::Integer(*i),
            Value::Float(f) => ModuleValue::Float(*f),
            Value::Bytes(b) => ModuleValue::String(b.to_vec()),
            Value::Object(o) => o.as_ref().clone(),
        }
    }
}

fn from_module<'a>(value: Cow<'a, ModuleValue>) -> Value<'a> {
    match value {
        Cow::Borrowed(v) => match v {
            ModuleValue::Integer(i) => Value::Integer(*i),
            ModuleValue::Float(f) => Value::Float(*f),
            ModuleValue::String(s) => Value::Bytes(Cow::Borrowed(s)),
            ModuleValue::Undefined => Value::Undefined,
            _ => Value::Object(Cow::Borrowed(v)),
        },
        Cow::Owned(v) => match v {
            ModuleValue::Integer(i) => Value::Integer(i),
            ModuleValue::Float(f) => Value::Float(f),
            ModuleValue::String(s) => Value::Bytes(Cow::Owned(s)),
            ModuleValue::Undefined => Value::Undefined,
            other => Value::Object(Cow::Owned(other)),
        },
    }
}

/// Applies a borrowing accessor to a possibly owned module value.
fn project<'a>(
    value: Cow<'a, ModuleValue>,
    f: impl FnOnce(&ModuleValue) -> Option<&ModuleValue>,
) -> Option<Cow<'a, ModuleValue>> {
    match value {
        Cow::Borrowed(v) => f(v).map(Cow::Borrowed),
        Cow::Owned(v) => f(&v).cloned().map(Cow::Owned),
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn numeric(value: &Value<'_>) -> Option<Num> {
    match value {
        Value::Integer(i) => Some(Num::Int(*i)),
        Value::Boolean(b) => Some(Num::Int(i64::from(*b))),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

/// Everything a condition can read during one scan.
pub(crate) struct ScanContext<'a> {
    pub data: &'a [u8],
    pub matches: &'a MatchTable,
    pub externals: &'a [ExternalValue],
    pub modules: &'a HashMap<String, ModuleValue>,
    pub entrypoint: Option<u64>,
    pub deadline: &'a Deadline,
    /// Step budget for each `matches` operation.
    pub regex_steps: u64,
}

/// Evaluates `rule`'s condition. `rule_results` holds the outcome of every
/// rule declared before it.
pub(crate) fn evaluate_rule<'a>(
    ctx: &'a ScanContext<'a>,
    rule_results: &'a [bool],
    rule: &'a CompiledRule,
) -> Eval<bool> {
    let mut evaluator = Evaluator {
        ctx,
        rule_results,
        variables: vec![Value::Undefined; rule.variable_slots],
        current: Vec::new(),
        ticks: 0,
    };
    Ok(evaluator.eval(&rule.condition)?.truthy())
}

struct Evaluator<'a> {
    ctx: &'a ScanContext<'a>,
    rule_results: &'a [bool],
    variables: Vec<Value<'a>>,
    /// Patterns bound by enclosing `for ... of` loops.
    current: Vec<PatternId>,
    ticks: u32,
}

impl<'a> Evaluator<'a> {
    fn tick(&mut self) -> Eval<()> {
        self.ticks += 1;
        if self.ticks >= DEADLINE_CHECK_INTERVAL {
            self.ticks = 0;
            self.ctx.deadline.check()?;
        }
        Ok(())
    }

    fn eval(&mut self, expr: &'a Expr) -> Eval<Value<'a>> {
        Ok(match expr {
            Expr::Boolean(b) => Value::Boolean(*b),
            Expr::Integer(i) => Value::Integer(*i),
            Expr::Float(f) => Value::Float(*f),
            Expr::Text(t) => Value::Bytes(Cow::Borrowed(t)),
            Expr::Filesize => Value::Integer(self.ctx.data.len() as i64),
            Expr::Entrypoint => self
                .ctx
                .entrypoint
                .map_or(Value::Undefined, |ep| Value::Integer(ep as i64)),
            Expr::Not(inner) => match self.eval(inner)? {
                Value::Undefined => Value::Undefined,
                value => Value::Boolean(!value.truthy()),
            },
            Expr::And(items) => {
                for item in items {
                    if !self.eval(item)?.truthy() {
                        return Ok(Value::Boolean(false));
                    }
                }
                Value::Boolean(true)
            }
            Expr::Or(items) => {
                for item in items {
                    if self.eval(item)?.truthy() {
                        return Ok(Value::Boolean(true));
                    }
                }
                Value::Boolean(false)
            }
            Expr::Defined(inner) => Value::Boolean(!matches!(self.eval(inner)?, Value::Undefined)),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                Value::Float(f) => Value::Float(-f),
                _ => Value::Undefined,
            },
            Expr::BitNot(inner) => match self.eval(inner)?.as_integer() {
                Some(i) => Value::Integer(!i),
                None => Value::Undefined,
            },
            Expr::Arith { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                arithmetic(*op, &lhs, &rhs)
            }
            Expr::Compare { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                match compare(&lhs, &rhs) {
                    Some(ordering) => Value::Boolean(match op {
                        CmpOp::Eq => ordering == Ordering::Equal,
                        CmpOp::Ne => ordering != Ordering::Equal,
                        CmpOp::Lt => ordering == Ordering::Less,
                        CmpOp::Le => ordering != Ordering::Greater,
                        CmpOp::Gt => ordering == Ordering::Greater,
                        CmpOp::Ge => ordering != Ordering::Less,
                    }),
                    None => Value::Undefined,
                }
            }
            Expr::StrOp { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                match (&lhs, &rhs) {
                    (Value::Bytes(l), Value::Bytes(r)) => Value::Boolean(string_op(*op, l, r)),
                    _ => Value::Undefined,
                }
            }
            Expr::Matches { lhs, regex } => match self.eval(lhs)? {
                Value::Bytes(subject) => {
                    let mut budget = Budget::new(self.ctx.regex_steps, Some(self.ctx.deadline));
                    match regex.find_with_budget(&subject, &mut budget) {
                        Ok(found) => Value::Boolean(found.is_some()),
                        Err(MatchAbort::StepLimit) => Value::Undefined,
                        Err(MatchAbort::Interrupted(interrupt)) => return Err(interrupt),
                    }
                }
                _ => Value::Undefined,
            },
            Expr::PatternFound { pattern, anchor } => {
                let hits = self.hits(*pattern);
                match anchor {
                    None => Value::Boolean(!hits.is_empty()),
                    Some(anchor) => match self.anchor_filter(anchor)? {
                        Some(filter) => Value::Boolean(hits.iter().any(|(o, _)| filter.accepts(*o))),
                        None => Value::Undefined,
                    },
                }
            }
            Expr::PatternCount { pattern, range } => {
                let hits = self.hits(*pattern);
                match range {
                    None => Value::Integer(hits.len() as i64),
                    Some((lo, hi)) => {
                        match (self.eval(lo)?.as_integer(), self.eval(hi)?.as_integer()) {
                            (Some(lo), Some(hi)) => Value::Integer(
                                hits.iter()
                                    .filter(|(o, _)| (lo..=hi).contains(&(*o as i64)))
                                    .count() as i64,
                            ),
                            _ => Value::Undefined,
                        }
                    }
                }
            }
            Expr::PatternOffset { pattern, index } | Expr::PatternLength { pattern, index } => {
                let hits = self.hits(*pattern);
                let Some(index) = self.eval(index)?.as_integer() else {
                    return Ok(Value::Undefined);
                };
                let hit = usize::try_from(index)
                    .ok()
                    .and_then(|i| i.checked_sub(1))
                    .and_then(|i| hits.get(i));
                match hit {
                    Some((offset, _)) if matches!(expr, Expr::PatternOffset { .. }) => {
                        Value::Integer(*offset as i64)
                    }
                    Some((_, length)) => Value::Integer(*length as i64),
                    None => Value::Undefined,
                }
            }
            Expr::ReadInteger {
                width,
                signed,
                big_endian,
                offset,
            } => match self.eval(offset)?.as_integer() {
                Some(offset) => read_integer(self.ctx.data, offset, *width, *signed, *big_endian),
                None => Value::Undefined,
            },
            Expr::External(index) => match self.ctx.externals.get(*index) {
                Some(ExternalValue::Integer(i)) => Value::Integer(*i),
                Some(ExternalValue::Float(f)) => Value::Float(*f),
                Some(ExternalValue::Boolean(b)) => Value::Boolean(*b),
                Some(ExternalValue::String(s)) => Value::Bytes(Cow::Borrowed(s)),
                None => Value::Undefined,
            },
            Expr::Rule(id) => Value::Boolean(self.rule_results.get(*id).copied().unwrap_or(false)),
            Expr::Variable(slot) => self.variables.get(*slot).cloned().unwrap_or(Value::Undefined),
            Expr::Field { base, path } => self.field(base, path)?,
            Expr::Of {
                quantifier,
                patterns,
                anchor,
            } => {
                let filter = match anchor {
                    None => None,
                    Some(anchor) => match self.anchor_filter(anchor)? {
                        Some(filter) => Some(filter),
                        None => return Ok(Value::Undefined),
                    },
                };
                let satisfied = patterns
                    .iter()
                    .filter(|id| {
                        let hits = self.ctx.matches.hits(**id);
                        match &filter {
                            None => !hits.is_empty(),
                            Some(filter) => hits.iter().any(|(o, _)| filter.accepts(*o)),
                        }
                    })
                    .count();
                self.quantify(quantifier, satisfied, patterns.len())?
            }
            Expr::ForOf {
                quantifier,
                patterns,
                body,
            } => {
                let mut satisfied = 0;
                for id in patterns {
                    self.tick()?;
                    self.current.push(*id);
                    let result = self.eval(body);
                    self.current.pop();
                    if result?.truthy() {
                        satisfied += 1;
                    }
                }
                self.quantify(quantifier, satisfied, patterns.len())?
            }
            Expr::ForIn {
                quantifier,
                variables,
                iterable,
                body,
            } => self.for_in(quantifier, variables, iterable, body)?,
        })
    }

    fn bind(&mut self, slot: usize, value: Value<'a>) {
        if let Some(variable) = self.variables.get_mut(slot) {
            *variable = value;
        }
    }

    fn hits(&self, pattern: PatternRef) -> &'a [(usize, usize)] {
        let matches: &'a MatchTable = self.ctx.matches;
        match pattern {
            PatternRef::Id(id) => matches.hits(id),
            PatternRef::Current => match self.current.last() {
                Some(id) => matches.hits(*id),
                None => &[],
            },
        }
    }

    fn anchor_filter(&mut self, anchor: &'a Anchor) -> Eval<Option<OffsetFilter>> {
        Ok(match anchor {
            Anchor::At(offset) => self.eval(offset)?.as_integer().map(OffsetFilter::At),
            Anchor::In(lo, hi) => {
                match (self.eval(lo)?.as_integer(), self.eval(hi)?.as_integer()) {
                    (Some(lo), Some(hi)) => Some(OffsetFilter::In(lo, hi)),
                    _ => None,
                }
            }
        })
    }

    fn quantify(&mut self, quantifier: &'a Quantifier, satisfied: usize, total: usize) -> Eval<Value<'a>> {
        let satisfied = satisfied as i64;
        let total = total as i64;
        Ok(Value::Boolean(match quantifier {
            Quantifier::All => satisfied == total,
            Quantifier::Any => satisfied >= 1,
            Quantifier::None => satisfied == 0,
            Quantifier::Count(n) => match self.eval(n)?.as_integer() {
                Some(n) => satisfied >= n,
                None => return Ok(Value::Undefined),
            },
            Quantifier::Percent(p) => match self.eval(p)?.as_integer() {
                Some(p) => satisfied.saturating_mul(100) >= p.saturating_mul(total),
                None => return Ok(Value::Undefined),
            },
        }))
    }

    fn field(&mut self, base: &'a FieldBase, path: &'a [FieldStep]) -> Eval<Value<'a>> {
        let mut current: Cow<'a, ModuleValue> = match base {
            FieldBase::Module(name) => match self.ctx.modules.get(name) {
                Some(module) => Cow::Borrowed(module),
                None => return Ok(Value::Undefined),
            },
            FieldBase::Variable(slot) => match self.variables.get(*slot) {
                Some(Value::Object(object)) => object.clone(),
                _ => return Ok(Value::Undefined),
            },
        };

        for step in path {
            let next = match step {
                FieldStep::Field(name) => project(current, |v| v.field(name)),
                FieldStep::Index(index) => match self.eval(index)? {
                    Value::Integer(i) => match usize::try_from(i) {
                        Ok(i) => project(current, |v| v.index(i)),
                        Err(_) => None,
                    },
                    Value::Bytes(key) => match std::str::from_utf8(&key) {
                        Ok(key) => project(current, |v| match v {
                            ModuleValue::Dictionary(map) => map.get(key),
                            _ => None,
                        }),
                        Err(_) => None,
                    },
                    _ => None,
                },
                FieldStep::Call(args) => {
                    let ModuleValue::Function(function) = &*current else {
                        return Ok(Value::Undefined);
                    };
                    let function = function.clone();
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg)?.to_module_value());
                    }
                    Some(Cow::Owned(function.call(&values)))
                }
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Undefined),
            }
        }
        Ok(from_module(current))
    }

    fn for_in(
        &mut self,
        quantifier: &'a Quantifier,
        variables: &'a [usize],
        iterable: &'a Iterable,
        body: &'a Expr,
    ) -> Eval<Value<'a>> {
        let items: Vec<Vec<Value<'a>>> = match iterable {
            Iterable::Range(lo, hi) => {
                let (Some(lo), Some(hi)) = (self.eval(lo)?.as_integer(), self.eval(hi)?.as_integer())
                else {
                    return Ok(Value::Undefined);
                };
                return self.for_range(quantifier, variables, lo, hi, body);
            }
            Iterable::List(list) => {
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    items.push(vec![self.eval(item)?]);
                }
                items
            }
            Iterable::Object(object) => match self.eval(object)? {
                Value::Object(object) => match object_rows(object, variables.len()) {
                    Some(rows) => rows,
                    None => return Ok(Value::Undefined),
                },
                _ => return Ok(Value::Undefined),
            },
        };

        let total = items.len();
        let mut satisfied = 0;
        for row in items {
            self.tick()?;
            for (slot, value) in variables.iter().zip(row) {
                self.bind(*slot, value);
            }
            if self.eval(body)?.truthy() {
                satisfied += 1;
            }
        }
        self.quantify(quantifier, satisfied, total)
    }

    fn for_range(
        &mut self,
        quantifier: &'a Quantifier,
        variables: &'a [usize],
        lo: i64,
        hi: i64,
        body: &'a Expr,
    ) -> Eval<Value<'a>> {
        let total = if hi < lo { 0 } else { (hi as i128 - lo as i128 + 1) as usize };
        let mut satisfied = 0;
        if hi >= lo {
            for i in lo..=hi {
                self.tick()?;
                if let Some(slot) = variables.first() {
                    self.bind(*slot, Value::Integer(i));
                }
                if self.eval(body)?.truthy() {
                    satisfied += 1;
                }
            }
        }
        self.quantify(quantifier, satisfied, total)
    }
}

/// Loop rows for `for v in array` and `for k, v in dictionary`; `None`
/// when the object and the number of loop variables disagree.
fn object_rows(object: Cow<'_, ModuleValue>, arity: usize) -> Option<Vec<Vec<Value<'_>>>> {
    match object {
        Cow::Borrowed(object) => match (object, arity) {
            (ModuleValue::Array(items), 1) => Some(
                items
                    .iter()
                    .map(|v| vec![from_module(Cow::Borrowed(v))])
                    .collect(),
            ),
            (ModuleValue::Dictionary(map), 2) => Some(
                map.iter()
                    .map(|(k, v)| {
                        vec![
                            Value::Bytes(Cow::Borrowed(k.as_bytes())),
                            from_module(Cow::Borrowed(v)),
                        ]
                    })
                    .collect(),
            ),
            _ => None,
        },
        Cow::Owned(object) => match (object, arity) {
            (ModuleValue::Array(items), 1) => Some(
                items
                    .into_iter()
                    .map(|v| vec![from_module(Cow::Owned(v))])
                    .collect(),
            ),
            (ModuleValue::Dictionary(map), 2) => Some(
                map.into_iter()
                    .map(|(k, v)| {
                        vec![
                            Value::Bytes(Cow::Owned(k.into_bytes())),
                            from_module(Cow::Owned(v)),
                        ]
                    })
                    .collect(),
            ),
            _ => None,
        },
    }
}

#[derive(Clone, Copy)]
enum OffsetFilter {
    At(i64),
    In(i64, i64),
}

impl OffsetFilter {
    fn accepts(self, offset: usize) -> bool {
        let offset = offset as i64;
        match self {
            OffsetFilter::At(at) => offset == at,
            OffsetFilter::In(lo, hi) => lo <= offset && offset <= hi,
        }
    }
}

fn arithmetic(op: ArithOp, lhs: &Value<'_>, rhs: &Value<'_>) -> Value<'static> {
    let (Some(l), Some(r)) = (numeric(lhs), numeric(rhs)) else {
        return Value::Undefined;
    };
    match (l, r) {
        (Num::Int(a), Num::Int(b)) => match op {
            ArithOp::Add => Value::Integer(a.wrapping_add(b)),
            ArithOp::Sub => Value::Integer(a.wrapping_sub(b)),
            ArithOp::Mul => Value::Integer(a.wrapping_mul(b)),
            ArithOp::Div if b == 0 => Value::Undefined,
            ArithOp::Div => Value::Integer(a.wrapping_div(b)),
            ArithOp::Mod if b == 0 => Value::Undefined,
            ArithOp::Mod => Value::Integer(a.wrapping_rem(b)),
            ArithOp::BitAnd => Value::Integer(a & b),
            ArithOp::BitOr => Value::Integer(a | b),
            ArithOp::BitXor => Value::Integer(a ^ b),
            ArithOp::Shl | ArithOp::Shr if b < 0 => Value::Undefined,
            ArithOp::Shl | ArithOp::Shr if b >= 64 => Value::Integer(0),
            ArithOp::Shl => Value::Integer(a.wrapping_shl(b as u32)),
            ArithOp::Shr => Value::Integer(a.wrapping_shr(b as u32)),
        },
        (l, r) => {
            let a = match l {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let b = match r {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            match op {
                ArithOp::Add => Value::Float(a + b),
                ArithOp::Sub => Value::Float(a - b),
                ArithOp::Mul => Value::Float(a * b),
                ArithOp::Div if b == 0.0 => Value::Undefined,
                ArithOp::Div => Value::Float(a / b),
                _ => Value::Undefined,
            }
        }
    }
}

fn compare(lhs: &Value<'_>, rhs: &Value<'_>) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.as_ref().cmp(b.as_ref())),
        _ => match (numeric(lhs)?, numeric(rhs)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (Num::Int(a), Num::Float(b)) => (a as f64).partial_cmp(&b),
            (Num::Float(a), Num::Int(b)) => a.partial_cmp(&(b as f64)),
            (Num::Float(a), Num::Float(b)) => a.partial_cmp(&b),
        },
    }
}

fn string_op(op: StrOp, haystack: &[u8], needle: &[u8]) -> bool {
    match op {
        StrOp::Contains => contains(haystack, needle),
        StrOp::IContains => contains(
            &haystack.to_ascii_lowercase(),
            &needle.to_ascii_lowercase(),
        ),
        StrOp::StartsWith => haystack.starts_with(needle),
        StrOp::IStartsWith => haystack.len() >= needle.len()
            && haystack[..needle.len()].eq_ignore_ascii_case(needle),
        StrOp::EndsWith => haystack.ends_with(needle),
        StrOp::IEndsWith => haystack.len() >= needle.len()
            && haystack[haystack.len() - needle.len()..].eq_ignore_ascii_case(needle),
        StrOp::IEquals => haystack.eq_ignore_ascii_case(needle),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn read_integer(data: &[u8], offset: i64, width: u8, signed: bool, big_endian: bool) -> Value<'static> {
    let Ok(start) = usize::try_from(offset) else {
        return Value::Undefined;
    };
    let Some(bytes) = start
        .checked_add(usize::from(width))
        .and_then(|end| data.get(start..end))
    else {
        return Value::Undefined;
    };
    let mut raw = 0u64;
    if big_endian {
        for byte in bytes {
            raw = (raw << 8) | u64::from(*byte);
        }
    } else {
        for byte in bytes.iter().rev() {
            raw = (raw << 8) | u64::from(*byte);
        }
    }
    let value = if signed {
        let shift = 64 - u32::from(width) * 8;
        ((raw << shift) as i64) >> shift
    } else {
        raw as i64
    };
    Value::Integer(value)
}
