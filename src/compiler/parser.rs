//! Rule source parsing.
//!
//! A recursive descent parser over the token stream from
//! [`lexer`](super::lexer). Include directives are expanded in place through
//! the configured [`IncludeResolver`]; a file that was already included is
//! skipped, which also breaks include cycles.

use super::ast::*;
use super::include::IncludeResolver;
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::{Result, SourceLocation, YaraError};
use crate::ir::MetaValue;
use std::collections::HashSet;
use tracing::debug;

const MAX_INCLUDE_DEPTH: usize = 16;
const MAX_EXPRESSION_DEPTH: usize = 512;

/// Shared state for one top-level source and everything it includes.
pub(crate) struct IncludeState<'r> {
    pub resolver: Option<&'r dyn IncludeResolver>,
    pub enabled: bool,
    pub namespace: String,
    seen: HashSet<String>,
    depth: usize,
}

impl<'r> IncludeState<'r> {
    pub fn new(resolver: Option<&'r dyn IncludeResolver>, enabled: bool, namespace: &str) -> Self {
        Self {
            resolver,
            enabled,
            namespace: namespace.to_string(),
            seen: HashSet::new(),
            depth: 0,
        }
    }
}

/// Parses one source text, expanding its includes.
pub(crate) fn parse_source(
    source: &str,
    file: Option<&str>,
    includes: &mut IncludeState<'_>,
) -> Result<SourceUnit> {
    if let Some(file) = file {
        includes.seen.insert(file.to_string());
    }
    let tokens = tokenize(source, file)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        file: file.map(str::to_string),
        imports: Vec::new(),
        depth: 0,
    };
    parser.parse_unit(includes)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    file: Option<String>,
    /// Modules imported so far in this file.
    imports: Vec<String>,
    depth: usize,
}

impl Parser {
    fn current_token(&self) -> &TokenKind {
        // The lexer always terminates the stream with Eof.
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn peek_token(&self, ahead: usize) -> &TokenKind {
        self.tokens
            .get(self.position + ahead)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.file.clone(), self.line())
    }

    fn advance(&mut self) -> TokenKind {
        let token = self.current_token().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> YaraError {
        YaraError::syntax(self.location(), message)
    }

    fn unexpected(&self) -> YaraError {
        self.error(format!("syntax error, unexpected {}", self.current_token()))
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        if *self.current_token() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "syntax error, unexpected {}, expecting {}",
                self.current_token(),
                kind
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current_token() {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!(
                "syntax error, unexpected {}, expecting identifier",
                self.current_token()
            ))),
        }
    }

    fn expect_text(&mut self) -> Result<Vec<u8>> {
        match self.current_token() {
            TokenKind::Text(text) => {
                let text = text.clone();
                self.advance();
                Ok(text)
            }
            _ => Err(self.error(format!(
                "syntax error, unexpected {}, expecting text string",
                self.current_token()
            ))),
        }
    }

    fn parse_unit(&mut self, includes: &mut IncludeState<'_>) -> Result<SourceUnit> {
        let mut unit = SourceUnit::default();
        loop {
            match self.current_token() {
                TokenKind::Eof => return Ok(unit),
                TokenKind::Import => {
                    self.advance();
                    let module = String::from_utf8_lossy(&self.expect_text()?).into_owned();
                    if !self.imports.contains(&module) {
                        self.imports.push(module.clone());
                    }
                    if !unit.imports.contains(&module) {
                        unit.imports.push(module);
                    }
                }
                TokenKind::Include => {
                    self.advance();
                    let requested = String::from_utf8_lossy(&self.expect_text()?).into_owned();
                    self.include(&requested, includes, &mut unit)?;
                }
                TokenKind::Rule | TokenKind::Global | TokenKind::Private => {
                    let rule = self.parse_rule()?;
                    unit.rules.push(rule);
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn include(
        &mut self,
        requested: &str,
        includes: &mut IncludeState<'_>,
        unit: &mut SourceUnit,
    ) -> Result<()> {
        let resolver = match includes.resolver {
            Some(resolver) if includes.enabled => resolver,
            _ => return Err(self.error("includes are disabled")),
        };
        let included = resolver
            .resolve(requested, self.file.as_deref(), &includes.namespace)
            .ok_or_else(|| self.error(format!("can't open include file: {requested}")))?;
        if !includes.seen.insert(included.name.clone()) {
            debug!(file = %included.name, "skipping already included file");
            return Ok(());
        }
        if includes.depth >= MAX_INCLUDE_DEPTH {
            return Err(self.error("too many levels of included rules"));
        }
        debug!(file = %included.name, "including file");

        let mut nested = Parser {
            tokens: tokenize(&included.source, Some(included.name.as_str()))?,
            position: 0,
            file: Some(included.name.clone()),
            imports: self.imports.clone(),
            depth: 0,
        };
        includes.depth += 1;
        let result = nested.parse_unit(includes);
        includes.depth -= 1;
        let nested_unit = result?;

        for module in nested_unit.imports {
            if !self.imports.contains(&module) {
                self.imports.push(module.clone());
            }
            if !unit.imports.contains(&module) {
                unit.imports.push(module);
            }
        }
        unit.rules.extend(nested_unit.rules);
        Ok(())
    }

    fn parse_rule(&mut self) -> Result<RuleDecl> {
        let mut is_global = false;
        let mut is_private = false;
        loop {
            match self.current_token() {
                TokenKind::Global if !is_global => is_global = true,
                TokenKind::Private if !is_private => is_private = true,
                TokenKind::Rule => break,
                _ => return Err(self.unexpected()),
            }
            self.advance();
        }
        self.advance();
        let location = self.location();
        let name = self.expect_identifier()?;

        let mut tags = Vec::new();
        if *self.current_token() == TokenKind::Colon {
            self.advance();
            while let TokenKind::Identifier(tag) = self.current_token() {
                if tags.contains(tag) {
                    return Err(self.error(format!("duplicated tag identifier \"{tag}\"")));
                }
                tags.push(tag.clone());
                self.advance();
            }
            if tags.is_empty() {
                return Err(self.unexpected());
            }
        }

        self.expect(TokenKind::LeftBrace)?;
        let metadata = if *self.current_token() == TokenKind::Meta {
            self.advance();
            self.expect(TokenKind::Colon)?;
            self.parse_metadata()?
        } else {
            Vec::new()
        };
        let patterns = if *self.current_token() == TokenKind::Strings {
            self.advance();
            self.expect(TokenKind::Colon)?;
            self.parse_patterns()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::Condition)?;
        self.expect(TokenKind::Colon)?;
        let condition = self.parse_or_expression()?;
        self.expect(TokenKind::RightBrace)?;

        Ok(RuleDecl {
            name,
            tags,
            is_global,
            is_private,
            metadata,
            patterns,
            condition,
            location,
            imports: self.imports.clone(),
        })
    }

    fn parse_metadata(&mut self) -> Result<Vec<(String, MetaValue)>> {
        let mut metadata = Vec::new();
        while let TokenKind::Identifier(key) = self.current_token() {
            let key = key.clone();
            self.advance();
            self.expect(TokenKind::Assign)?;
            let value = match self.advance() {
                TokenKind::Text(bytes) => MetaValue::String(meta_string(&bytes)),
                TokenKind::Integer(value) => MetaValue::Integer(value),
                TokenKind::Minus => match self.advance() {
                    TokenKind::Integer(value) => MetaValue::Integer(value.wrapping_neg()),
                    _ => return Err(self.error("syntax error, expecting integer")),
                },
                TokenKind::True => MetaValue::Boolean(true),
                TokenKind::False => MetaValue::Boolean(false),
                other => {
                    return Err(self.error(format!("syntax error, unexpected {other} in metadata")))
                }
            };
            metadata.push((key, value));
        }
        Ok(metadata)
    }

    fn parse_patterns(&mut self) -> Result<Vec<PatternDecl>> {
        let mut patterns: Vec<PatternDecl> = Vec::new();
        while let TokenKind::PatternIdent { name, wildcard } = self.current_token() {
            if *wildcard {
                return Err(self.unexpected());
            }
            let name = name.clone();
            let location = self.location();
            if !name.is_empty() && patterns.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicated string identifier \"${name}\"")));
            }
            self.advance();
            self.expect(TokenKind::Assign)?;
            let value = match self.advance() {
                TokenKind::Text(text) => PatternValue::Text(text),
                TokenKind::HexString(body) => PatternValue::Hex(body),
                TokenKind::Regex {
                    pattern,
                    nocase,
                    dotall,
                } => PatternValue::Regex {
                    pattern,
                    nocase,
                    dotall,
                },
                other => {
                    return Err(self.error(format!(
                        "syntax error, unexpected {other}, expecting string"
                    )))
                }
            };
            let modifiers = self.parse_modifiers()?;
            patterns.push(PatternDecl {
                name,
                value,
                modifiers,
                location,
            });
        }
        if patterns.is_empty() {
            return Err(self.unexpected());
        }
        Ok(patterns)
    }

    fn parse_modifiers(&mut self) -> Result<Modifiers> {
        let mut modifiers = Modifiers::default();
        let mut seen: Vec<TokenKind> = Vec::new();
        loop {
            let token = self.current_token().clone();
            let is_modifier = matches!(
                token,
                TokenKind::Nocase
                    | TokenKind::Wide
                    | TokenKind::Ascii
                    | TokenKind::Fullword
                    | TokenKind::Private
                    | TokenKind::Xor
                    | TokenKind::Base64
                    | TokenKind::Base64Wide
            );
            if !is_modifier {
                return Ok(modifiers);
            }
            if seen.contains(&token) {
                return Err(self.error(format!("duplicated modifier {token}")));
            }
            self.advance();
            match token {
                TokenKind::Nocase => modifiers.nocase = true,
                TokenKind::Wide => modifiers.wide = true,
                TokenKind::Ascii => modifiers.ascii = true,
                TokenKind::Fullword => modifiers.fullword = true,
                TokenKind::Private => modifiers.private = true,
                TokenKind::Xor => modifiers.xor = Some(self.parse_xor_range()?),
                TokenKind::Base64 => modifiers.base64 = Some(self.parse_base64_alphabet()?),
                _ => modifiers.base64wide = Some(self.parse_base64_alphabet()?),
            }
            seen.push(token);
        }
    }

    fn parse_xor_range(&mut self) -> Result<(u8, u8)> {
        if *self.current_token() != TokenKind::LeftParen {
            return Ok((0, 255));
        }
        self.advance();
        let key = |parser: &mut Parser| -> Result<u8> {
            match parser.advance() {
                TokenKind::Integer(value) => u8::try_from(value)
                    .map_err(|_| parser.error("invalid xor range: keys must be 0-255")),
                _ => Err(parser.error("syntax error, expecting integer")),
            }
        };
        let lo = key(self)?;
        let hi = if *self.current_token() == TokenKind::Minus {
            self.advance();
            key(self)?
        } else {
            lo
        };
        if lo > hi {
            return Err(self.error("invalid xor range: lower bound exceeds upper bound"));
        }
        self.expect(TokenKind::RightParen)?;
        Ok((lo, hi))
    }

    fn parse_base64_alphabet(&mut self) -> Result<Option<Vec<u8>>> {
        if *self.current_token() != TokenKind::LeftParen {
            return Ok(None);
        }
        self.advance();
        let alphabet = self.expect_text()?;
        if alphabet.len() != 64 {
            return Err(self.error("base64 alphabet must be 64 characters"));
        }
        self.expect(TokenKind::RightParen)?;
        Ok(Some(alphabet))
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        let line = lhs.line;
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            line,
        )
    }

    /// Parse OR expressions (lowest precedence).
    fn parse_or_expression(&mut self) -> Result<Expr> {
        self.nested(|p| {
            let mut left = p.parse_and_expression()?;
            while *p.current_token() == TokenKind::Or {
                p.advance();
                let right = p.parse_and_expression()?;
                left = Self::binary(BinaryOp::Or, left, right);
            }
            Ok(left)
        })
    }

    fn parse_and_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expression()?;
        while *self.current_token() == TokenKind::And {
            self.advance();
            let right = self.parse_not_expression()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not_expression(&mut self) -> Result<Expr> {
        let op = match self.current_token() {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Defined => UnaryOp::Defined,
            _ => return self.parse_equality(),
        };
        let line = self.line();
        self.advance();
        let operand = self.nested(Self::parse_not_expression)?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.current_token() {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                TokenKind::Contains => BinaryOp::Contains,
                TokenKind::IContains => BinaryOp::IContains,
                TokenKind::StartsWith => BinaryOp::StartsWith,
                TokenKind::IStartsWith => BinaryOp::IStartsWith,
                TokenKind::EndsWith => BinaryOp::EndsWith,
                TokenKind::IEndsWith => BinaryOp::IEndsWith,
                TokenKind::IEquals => BinaryOp::IEquals,
                TokenKind::Matches => BinaryOp::Matches,
                _ => return Ok(left),
            };
            self.advance();
            let right = if op == BinaryOp::Matches {
                let line = self.line();
                match self.advance() {
                    TokenKind::Regex {
                        pattern,
                        nocase,
                        dotall,
                    } => Expr::new(
                        ExprKind::Regex {
                            pattern,
                            nocase,
                            dotall,
                        },
                        line,
                    ),
                    other => {
                        return Err(self.error(format!(
                            "syntax error, unexpected {other}, expecting regular expression"
                        )))
                    }
                }
            } else {
                self.parse_relational()?
            };
            left = Self::binary(op, left, right);
        }
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut left = self.parse_bitor()?;
        loop {
            let op = match self.current_token() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_bitor()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_bitor(&mut self) -> Result<Expr> {
        let mut left = self.parse_bitxor()?;
        while *self.current_token() == TokenKind::Pipe {
            self.advance();
            let right = self.parse_bitxor()?;
            left = Self::binary(BinaryOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn parse_bitxor(&mut self) -> Result<Expr> {
        let mut left = self.parse_bitand()?;
        while *self.current_token() == TokenKind::Caret {
            self.advance();
            let right = self.parse_bitand()?;
            left = Self::binary(BinaryOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> Result<Expr> {
        let mut left = self.parse_shift()?;
        while *self.current_token() == TokenKind::Ampersand {
            self.advance();
            let right = self.parse_shift()?;
            left = Self::binary(BinaryOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current_token() {
                TokenKind::ShiftLeft => BinaryOp::Shl,
                TokenKind::ShiftRight => BinaryOp::Shr,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current_token() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current_token() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Backslash => BinaryOp::Div,
                TokenKind::Percent if *self.peek_token(1) != TokenKind::Of => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.current_token() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Tilde => UnaryOp::BitNot,
            _ => return self.parse_primary(),
        };
        let line = self.line();
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        if let (UnaryOp::Neg, ExprKind::Integer(value)) = (op, &operand.kind) {
            return Ok(Expr::new(ExprKind::Integer(value.wrapping_neg()), line));
        }
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    /// A primary expression, which may turn out to be the count of an
    /// `N of ...` or `N% of ...` quantifier.
    fn parse_primary(&mut self) -> Result<Expr> {
        let line = self.line();
        let quantifier = match self.current_token() {
            TokenKind::All => Some(Quantifier::All),
            TokenKind::Any => Some(Quantifier::Any),
            TokenKind::None => Some(Quantifier::None),
            _ => None,
        };
        if let Some(quantifier) = quantifier {
            self.advance();
            return self.parse_of_tail(quantifier, line);
        }

        let primary = self.parse_term()?;
        match (self.current_token(), self.peek_token(1)) {
            (TokenKind::Of, _) => self.parse_of_tail(Quantifier::Count(Box::new(primary)), line),
            (TokenKind::Percent, TokenKind::Of) => {
                self.advance();
                self.parse_of_tail(Quantifier::Percent(Box::new(primary)), line)
            }
            _ => Ok(primary),
        }
    }

    fn parse_of_tail(&mut self, quantifier: Quantifier, line: usize) -> Result<Expr> {
        self.expect(TokenKind::Of)?;
        let set = self.parse_pattern_set()?;
        let anchor = self.parse_anchor()?;
        Ok(Expr::new(
            ExprKind::Of {
                quantifier,
                set,
                anchor,
            },
            line,
        ))
    }

    fn parse_pattern_set(&mut self) -> Result<PatternSet> {
        if *self.current_token() == TokenKind::Them {
            self.advance();
            return Ok(PatternSet::Them);
        }
        self.expect(TokenKind::LeftParen)?;
        let mut items = Vec::new();
        loop {
            match self.advance() {
                TokenKind::PatternIdent { name, wildcard } => {
                    items.push(SetItem { name, wildcard })
                }
                other => {
                    return Err(self.error(format!(
                        "syntax error, unexpected {other}, expecting string identifier"
                    )))
                }
            }
            match self.advance() {
                TokenKind::Comma => continue,
                TokenKind::RightParen => return Ok(PatternSet::Items(items)),
                other => {
                    return Err(self.error(format!(
                        "syntax error, unexpected {other}, expecting \")\""
                    )))
                }
            }
        }
    }

    fn parse_anchor(&mut self) -> Result<Option<Anchor>> {
        match self.current_token() {
            TokenKind::At => {
                self.advance();
                Ok(Some(Anchor::At(Box::new(self.parse_bitor()?))))
            }
            TokenKind::In => {
                self.advance();
                let (lo, hi) = self.parse_range()?;
                Ok(Some(Anchor::In(lo, hi)))
            }
            _ => Ok(None),
        }
    }

    fn parse_range(&mut self) -> Result<(Box<Expr>, Box<Expr>)> {
        self.expect(TokenKind::LeftParen)?;
        let lo = self.parse_bitor()?;
        self.expect(TokenKind::DotDot)?;
        let hi = self.parse_bitor()?;
        self.expect(TokenKind::RightParen)?;
        Ok((Box::new(lo), Box::new(hi)))
    }

    fn parse_index(&mut self) -> Result<Option<Box<Expr>>> {
        if *self.current_token() != TokenKind::LeftBracket {
            return Ok(None);
        }
        self.advance();
        let index = self.parse_or_expression()?;
        self.expect(TokenKind::RightBracket)?;
        Ok(Some(Box::new(index)))
    }

    /// Terms that can never start a quantifier by themselves.
    fn parse_term(&mut self) -> Result<Expr> {
        let line = self.line();
        let kind = match self.advance() {
            TokenKind::True => ExprKind::Boolean(true),
            TokenKind::False => ExprKind::Boolean(false),
            TokenKind::Integer(value) => ExprKind::Integer(value),
            TokenKind::Float(value) => ExprKind::Float(value),
            TokenKind::Text(text) => ExprKind::Text(text),
            TokenKind::Filesize => ExprKind::Filesize,
            TokenKind::Entrypoint => ExprKind::Entrypoint,
            TokenKind::LeftParen => {
                let expr = self.parse_or_expression()?;
                self.expect(TokenKind::RightParen)?;
                return Ok(expr);
            }
            TokenKind::PatternIdent { name, wildcard } => {
                if wildcard {
                    self.position -= 1;
                    return Err(self.unexpected());
                }
                ExprKind::PatternMatch {
                    name,
                    anchor: self.parse_anchor()?,
                }
            }
            TokenKind::PatternCount(name) => {
                let range = if *self.current_token() == TokenKind::In {
                    self.advance();
                    Some(self.parse_range()?)
                } else {
                    None
                };
                ExprKind::PatternCount { name, range }
            }
            TokenKind::PatternOffset(name) => ExprKind::PatternOffset {
                name,
                index: self.parse_index()?,
            },
            TokenKind::PatternLength(name) => ExprKind::PatternLength {
                name,
                index: self.parse_index()?,
            },
            TokenKind::Identifier(name) => ExprKind::Identifier {
                name,
                accessors: self.parse_accessors()?,
            },
            TokenKind::For => return self.nested(|p| p.parse_for(line)),
            _ => {
                self.position -= 1;
                return Err(self.unexpected());
            }
        };
        Ok(Expr::new(kind, line))
    }

    fn parse_accessors(&mut self) -> Result<Vec<Accessor>> {
        let mut accessors = Vec::new();
        loop {
            match self.current_token() {
                TokenKind::Dot => {
                    self.advance();
                    accessors.push(Accessor::Field(self.expect_identifier()?));
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_or_expression()?;
                    self.expect(TokenKind::RightBracket)?;
                    accessors.push(Accessor::Index(index));
                }
                TokenKind::LeftParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if *self.current_token() != TokenKind::RightParen {
                        loop {
                            args.push(self.parse_or_expression()?);
                            if *self.current_token() != TokenKind::Comma {
                                break;
                            }
                            self.advance();
                        }
                    }
                    self.expect(TokenKind::RightParen)?;
                    accessors.push(Accessor::Call(args));
                }
                _ => return Ok(accessors),
            }
        }
    }

    fn parse_for(&mut self, line: usize) -> Result<Expr> {
        let quantifier = match self.current_token() {
            TokenKind::All => {
                self.advance();
                Quantifier::All
            }
            TokenKind::Any => {
                self.advance();
                Quantifier::Any
            }
            TokenKind::None => {
                self.advance();
                Quantifier::None
            }
            _ => {
                let count = self.parse_term()?;
                if *self.current_token() == TokenKind::Percent {
                    self.advance();
                    Quantifier::Percent(Box::new(count))
                } else {
                    Quantifier::Count(Box::new(count))
                }
            }
        };

        if *self.current_token() == TokenKind::Of {
            self.advance();
            let set = self.parse_pattern_set()?;
            let body = self.parse_for_body()?;
            return Ok(Expr::new(
                ExprKind::ForOf {
                    quantifier,
                    set,
                    body: Box::new(body),
                },
                line,
            ));
        }

        let mut variables = vec![self.expect_identifier()?];
        while *self.current_token() == TokenKind::Comma {
            self.advance();
            variables.push(self.expect_identifier()?);
        }
        self.expect(TokenKind::In)?;
        let iterable = self.parse_iterable()?;
        let body = self.parse_for_body()?;
        Ok(Expr::new(
            ExprKind::ForIn {
                quantifier,
                variables,
                iterable,
                body: Box::new(body),
            },
            line,
        ))
    }

    fn parse_for_body(&mut self) -> Result<Expr> {
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::LeftParen)?;
        let body = self.parse_or_expression()?;
        self.expect(TokenKind::RightParen)?;
        Ok(body)
    }

    fn parse_iterable(&mut self) -> Result<Iterable> {
        if *self.current_token() != TokenKind::LeftParen {
            return Ok(Iterable::Expr(Box::new(self.parse_term()?)));
        }
        self.advance();
        let first = self.parse_bitor()?;
        if *self.current_token() == TokenKind::DotDot {
            self.advance();
            let hi = self.parse_bitor()?;
            self.expect(TokenKind::RightParen)?;
            return Ok(Iterable::Range(Box::new(first), Box::new(hi)));
        }
        let mut items = vec![first];
        while *self.current_token() == TokenKind::Comma {
            self.advance();
            items.push(self.parse_bitor()?);
        }
        self.expect(TokenKind::RightParen)?;
        Ok(Iterable::List(items))
    }
}

/// Metadata strings end at the first NUL and keep only valid UTF-8.
fn meta_string(bytes: &[u8]) -> String {
    let bytes = bytes.split(|b| *b == 0).next().unwrap_or_default();
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let skip = err.error_len().unwrap_or(after.len());
                rest = &after[skip..];
            }
        }
    }
    out
}
