//! Tokenizer for rule source text.
//!
//! The lexer runs over the whole source up front. Two constructs are
//! context-sensitive: a `{` directly after `=` opens a hex string (the rule
//! body braces never follow `=`), and a `/` that does not start a comment
//! always opens a regular expression, since division is spelled `\`.

use crate::error::{Result, SourceLocation, YaraError};
use std::fmt;

const MAX_IDENTIFIER_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Identifier(String),
    /// `$name`, `$` (anonymous) or `$name*` when `wildcard` is set.
    PatternIdent { name: String, wildcard: bool },
    /// `#name` or `#`
    PatternCount(String),
    /// `@name` or `@`
    PatternOffset(String),
    /// `!name` or `!`
    PatternLength(String),
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
    Regex {
        pattern: Vec<u8>,
        nocase: bool,
        dotall: bool,
    },
    /// Raw hex string body without braces or comments.
    HexString(String),

    Rule,
    Global,
    Private,
    Meta,
    Strings,
    Condition,
    Import,
    Include,
    True,
    False,
    And,
    Or,
    Not,
    Defined,
    Any,
    All,
    None,
    Of,
    Them,
    For,
    In,
    At,
    Filesize,
    Entrypoint,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IEquals,
    Matches,
    Nocase,
    Wide,
    Ascii,
    Fullword,
    Xor,
    Base64,
    Base64Wide,

    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Colon,
    Comma,
    Dot,
    DotDot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Backslash,
    Percent,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Identifier(name) => return write!(f, "identifier \"{name}\""),
            TokenKind::PatternIdent { name, .. } => return write!(f, "\"${name}\""),
            TokenKind::PatternCount(name) => return write!(f, "\"#{name}\""),
            TokenKind::PatternOffset(name) => return write!(f, "\"@{name}\""),
            TokenKind::PatternLength(name) => return write!(f, "\"!{name}\""),
            TokenKind::Integer(value) => return write!(f, "integer {value}"),
            TokenKind::Float(value) => return write!(f, "float {value}"),
            TokenKind::Text(_) => "text string",
            TokenKind::Regex { .. } => "regular expression",
            TokenKind::HexString(_) => "hex string",
            TokenKind::Eof => "end of input",
            other => return write!(f, "\"{}\"", other.symbol()),
        };
        f.write_str(text)
    }
}

impl TokenKind {
    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Rule => "rule",
            TokenKind::Global => "global",
            TokenKind::Private => "private",
            TokenKind::Meta => "meta",
            TokenKind::Strings => "strings",
            TokenKind::Condition => "condition",
            TokenKind::Import => "import",
            TokenKind::Include => "include",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::Defined => "defined",
            TokenKind::Any => "any",
            TokenKind::All => "all",
            TokenKind::None => "none",
            TokenKind::Of => "of",
            TokenKind::Them => "them",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::At => "at",
            TokenKind::Filesize => "filesize",
            TokenKind::Entrypoint => "entrypoint",
            TokenKind::Contains => "contains",
            TokenKind::IContains => "icontains",
            TokenKind::StartsWith => "startswith",
            TokenKind::IStartsWith => "istartswith",
            TokenKind::EndsWith => "endswith",
            TokenKind::IEndsWith => "iendswith",
            TokenKind::IEquals => "iequals",
            TokenKind::Matches => "matches",
            TokenKind::Nocase => "nocase",
            TokenKind::Wide => "wide",
            TokenKind::Ascii => "ascii",
            TokenKind::Fullword => "fullword",
            TokenKind::Xor => "xor",
            TokenKind::Base64 => "base64",
            TokenKind::Base64Wide => "base64wide",
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::LeftBracket => "[",
            TokenKind::RightBracket => "]",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::Ne => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Backslash => "\\",
            TokenKind::Percent => "%",
            TokenKind::Ampersand => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::ShiftLeft => "<<",
            TokenKind::ShiftRight => ">>",
            _ => "?",
        }
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "rule" => TokenKind::Rule,
        "global" => TokenKind::Global,
        "private" => TokenKind::Private,
        "meta" => TokenKind::Meta,
        "strings" => TokenKind::Strings,
        "condition" => TokenKind::Condition,
        "import" => TokenKind::Import,
        "include" => TokenKind::Include,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "defined" => TokenKind::Defined,
        "any" => TokenKind::Any,
        "all" => TokenKind::All,
        "none" => TokenKind::None,
        "of" => TokenKind::Of,
        "them" => TokenKind::Them,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "at" => TokenKind::At,
        "filesize" => TokenKind::Filesize,
        "entrypoint" => TokenKind::Entrypoint,
        "contains" => TokenKind::Contains,
        "icontains" => TokenKind::IContains,
        "startswith" => TokenKind::StartsWith,
        "istartswith" => TokenKind::IStartsWith,
        "endswith" => TokenKind::EndsWith,
        "iendswith" => TokenKind::IEndsWith,
        "iequals" => TokenKind::IEquals,
        "matches" => TokenKind::Matches,
        "nocase" => TokenKind::Nocase,
        "wide" => TokenKind::Wide,
        "ascii" => TokenKind::Ascii,
        "fullword" => TokenKind::Fullword,
        "xor" => TokenKind::Xor,
        "base64" => TokenKind::Base64,
        "base64wide" => TokenKind::Base64Wide,
        _ => return None,
    };
    Some(kind)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

/// Tokenize a complete source text; the last token is always [`TokenKind::Eof`].
pub(crate) fn tokenize(source: &str, file: Option<&str>) -> Result<Vec<Token>> {
    let mut lexer = Lexer {
        src: source.as_bytes(),
        pos: 0,
        line: 1,
        file: file.map(str::to_string),
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    file: Option<String>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
        }
        Some(byte)
    }

    fn error(&self, message: impl Into<String>) -> YaraError {
        YaraError::syntax(SourceLocation::new(self.file.clone(), self.line), message)
    }

    fn push(&mut self, kind: TokenKind, line: usize) {
        self.tokens.push(Token { kind, line });
    }

    fn run(&mut self) -> Result<()> {
        loop {
            self.skip_trivia()?;
            let line = self.line;
            let Some(byte) = self.peek() else {
                self.push(TokenKind::Eof, line);
                return Ok(());
            };
            let kind = match byte {
                b'"' => TokenKind::Text(self.text()?),
                b'/' => self.regex()?,
                b'{' if self.tokens.last().map(|t| &t.kind) == Some(&TokenKind::Assign) => {
                    TokenKind::HexString(self.hex_string()?)
                }
                b'$' | b'#' | b'@' => self.pattern_reference(byte)?,
                b'!' if self.peek_at(1) == Some(b'=') => {
                    self.pos += 2;
                    TokenKind::Ne
                }
                b'!' => self.pattern_reference(byte)?,
                b'0'..=b'9' => self.number()?,
                b if b.is_ascii_alphabetic() || b == b'_' => self.word()?,
                _ => self.punctuation()?,
            };
            self.push(kind, line);
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(b), _) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                (Some(b'/'), Some(b'/')) => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                (Some(b'/'), Some(b'*')) => self.block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    /// Skips `/* ... */`; comments do not nest.
    fn block_comment(&mut self) -> Result<()> {
        self.pos += 2;
        loop {
            match self.bump() {
                Some(b'*') if self.peek() == Some(b'/') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(self.error("unterminated comment")),
            }
        }
    }

    fn text(&mut self) -> Result<Vec<u8>> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.error("unterminated string")),
                Some(b'"') => return Ok(bytes),
                Some(b'\\') => {
                    let escaped = match self.bump() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b'\\') => b'\\',
                        Some(b'"') => b'"',
                        Some(b'x') => {
                            let hi = self.bump().and_then(hex_digit);
                            let lo = self.bump().and_then(hex_digit);
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => hi << 4 | lo,
                                _ => return Err(self.error("invalid hex escape in string")),
                            }
                        }
                        _ => return Err(self.error("illegal escape sequence")),
                    };
                    bytes.push(escaped);
                }
                Some(other) => bytes.push(other),
            }
        }
    }

    fn regex(&mut self) -> Result<TokenKind> {
        self.pos += 1;
        let mut pattern = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.error("unterminated regular expression")),
                Some(b'/') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'/') => pattern.push(b'/'),
                    Some(b'\n') | None => {
                        return Err(self.error("unterminated regular expression"))
                    }
                    Some(other) => pattern.extend_from_slice(&[b'\\', other]),
                },
                Some(other) => pattern.push(other),
            }
        }
        if pattern.is_empty() {
            return Err(self.error("empty regular expression"));
        }
        let (mut nocase, mut dotall) = (false, false);
        while let Some(flag) = self.peek() {
            match flag {
                b'i' => nocase = true,
                b's' => dotall = true,
                _ => break,
            }
            self.pos += 1;
        }
        Ok(TokenKind::Regex {
            pattern,
            nocase,
            dotall,
        })
    }

    /// Reads a hex string body, dropping comments but keeping line count.
    fn hex_string(&mut self) -> Result<String> {
        self.pos += 1;
        let mut body = String::new();
        loop {
            match (self.peek(), self.peek_at(1)) {
                (None, _) => return Err(self.error("unterminated hex string")),
                (Some(b'}'), _) => {
                    self.pos += 1;
                    return Ok(body);
                }
                (Some(b'/'), Some(b'/')) => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    self.block_comment()?;
                    body.push(' ');
                }
                (Some(byte), _) => {
                    self.bump();
                    body.push(byte as char);
                }
            }
        }
    }

    fn pattern_reference(&mut self, sigil: u8) -> Result<TokenKind> {
        self.pos += 1;
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(self.error(format!("identifier \"{name}\" is too long")));
        }
        Ok(match sigil {
            b'$' => {
                let wildcard = self.peek() == Some(b'*');
                if wildcard {
                    self.pos += 1;
                }
                TokenKind::PatternIdent { name, wildcard }
            }
            b'#' => TokenKind::PatternCount(name),
            b'@' => TokenKind::PatternOffset(name),
            _ => TokenKind::PatternLength(name),
        })
    }

    fn number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some(b'0'), Some(b'x' | b'X')) => 16,
            (Some(b'0'), Some(b'o')) => 8,
            _ => 10,
        };
        if radix != 10 {
            self.pos += 2;
        }
        let digits_start = self.pos;
        while self.peek().map_or(false, |b| (b as char).is_digit(radix)) {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap_or_default();
        if digits.is_empty() {
            return Err(self.error("malformed number"));
        }
        if radix == 10
            && self.peek() == Some(b'.')
            && self.peek_at(1).map_or(false, |b| b.is_ascii_digit())
        {
            self.pos += 1;
            while self.peek().map_or(false, |b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
            return text
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error("malformed number"));
        }
        let mut value = i64::from_str_radix(digits, radix)
            .map_err(|_| self.error(format!("integer {digits} is too large")))?;
        let multiplier = match (self.peek(), self.peek_at(1)) {
            (Some(b'K'), Some(b'B')) => 1024,
            (Some(b'M'), Some(b'B')) => 1024 * 1024,
            _ => 1,
        };
        if multiplier != 1 {
            self.pos += 2;
            value = value
                .checked_mul(multiplier)
                .ok_or_else(|| self.error("integer is too large"))?;
        }
        if self
            .peek()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(self.error("malformed number"));
        }
        Ok(TokenKind::Integer(value))
    }

    fn word(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let word = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if word.len() > MAX_IDENTIFIER_LENGTH {
            return Err(self.error(format!("identifier \"{word}\" is too long")));
        }
        Ok(keyword(&word).unwrap_or(TokenKind::Identifier(word)))
    }

    fn punctuation(&mut self) -> Result<TokenKind> {
        let two = (self.peek(), self.peek_at(1));
        let (kind, width) = match two {
            (Some(b'.'), Some(b'.')) => (TokenKind::DotDot, 2),
            (Some(b'='), Some(b'=')) => (TokenKind::Eq, 2),
            (Some(b'<'), Some(b'=')) => (TokenKind::Le, 2),
            (Some(b'>'), Some(b'=')) => (TokenKind::Ge, 2),
            (Some(b'<'), Some(b'<')) => (TokenKind::ShiftLeft, 2),
            (Some(b'>'), Some(b'>')) => (TokenKind::ShiftRight, 2),
            (Some(b'{'), _) => (TokenKind::LeftBrace, 1),
            (Some(b'}'), _) => (TokenKind::RightBrace, 1),
            (Some(b'('), _) => (TokenKind::LeftParen, 1),
            (Some(b')'), _) => (TokenKind::RightParen, 1),
            (Some(b'['), _) => (TokenKind::LeftBracket, 1),
            (Some(b']'), _) => (TokenKind::RightBracket, 1),
            (Some(b':'), _) => (TokenKind::Colon, 1),
            (Some(b','), _) => (TokenKind::Comma, 1),
            (Some(b'.'), _) => (TokenKind::Dot, 1),
            (Some(b'='), _) => (TokenKind::Assign, 1),
            (Some(b'<'), _) => (TokenKind::Lt, 1),
            (Some(b'>'), _) => (TokenKind::Gt, 1),
            (Some(b'+'), _) => (TokenKind::Plus, 1),
            (Some(b'-'), _) => (TokenKind::Minus, 1),
            (Some(b'*'), _) => (TokenKind::Star, 1),
            (Some(b'\\'), _) => (TokenKind::Backslash, 1),
            (Some(b'%'), _) => (TokenKind::Percent, 1),
            (Some(b'&'), _) => (TokenKind::Ampersand, 1),
            (Some(b'|'), _) => (TokenKind::Pipe, 1),
            (Some(b'^'), _) => (TokenKind::Caret, 1),
            (Some(b'~'), _) => (TokenKind::Tilde, 1),
            (Some(other), _) => {
                let shown = char::from(other).escape_default().to_string();
                return Err(self.error(format!("unexpected character '{shown}'")));
            }
            (None, _) => return Err(self.error("unexpected end of input")),
        };
        self.pos += width;
        Ok(kind)
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}
