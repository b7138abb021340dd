//! Lexer for shoal scripts.
//!
//! Converts source text into a stream of [`Lexeme`]s using the logos lexer
//! generator. Words are context sensitive: quotes, escapes and bracket groups
//! inside a word (`${a[0]}`, `$(cmd)`, `%(1+2)`) are consumed by the word
//! callback, and heredoc bodies are read by the newline that ends the line
//! mentioning them.
//!
//! ```text
//!   Token (view) ──▶ Lexeme::lexer_with_extras(text, Scan)
//!                       │
//!                       ├── lex_word       (quotes, escapes, in-word groups)
//!                       ├── lex_heredoc    (`<<EOF` queues a delimiter)
//!                       ├── lex_newline    (reads queued heredoc bodies)
//!                       └── assemble       (joins touching fragments, splits `name=`)
//!                                │
//!                                ▼
//!                       Vec<Spanned<Lexeme>>  ──▶ parser
//! ```
//!
//! Every word is an immutable [`Token`] view `(source, start, len)` with the
//! line and column of its first character. Nested programs re-scan the same
//! buffer so positions stay relative to the original script.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::Arc;

use logos::Logos;

use crate::ast::RedirectKind;

/// A malformed or incomplete script.
///
/// `eof` is set when the input ended while a quote, bracket or heredoc was
/// still open; an interactive caller can ask for another line instead of
/// reporting the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub eof: bool,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            eof: false,
        }
    }

    pub fn eof(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            eof: true,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for SyntaxError {}

// ═══════════════════════════════════════════════════════════════════════════
// Token
// ═══════════════════════════════════════════════════════════════════════════

/// An immutable view into a script buffer.
///
/// Equality, hashing and `Display` use the viewed text only, so a token
/// compares equal to any other token (or `&str`) with the same characters.
#[derive(Clone)]
pub struct Token {
    source: Arc<str>,
    start: usize,
    len: usize,
    line: usize,
    column: usize,
}

impl Token {
    /// A token that owns its own buffer, positioned at 1.1.
    pub fn detached(text: &str) -> Self {
        Self {
            source: Arc::from(text),
            start: 0,
            len: text.len(),
            line: 1,
            column: 1,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source[self.start..self.start + self.len]
    }

    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    /// Byte offset of the first character in the source buffer.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Byte offset just past the last character.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// The view covering `self` through `last` (inclusive) in the same buffer.
    pub fn span_to(&self, last: &Token) -> Token {
        if !Arc::ptr_eq(&self.source, &last.source) || last.end() < self.start {
            return self.clone();
        }
        Token {
            source: self.source.clone(),
            start: self.start,
            len: last.end() - self.start,
            line: self.line,
            column: self.column,
        }
    }

    /// The view strictly between `self` and `next` in the same buffer.
    pub fn span_between(&self, next: &Token) -> Token {
        let (line, column) = advance_position(self.line, self.column, self.as_str());
        let len = if Arc::ptr_eq(&self.source, &next.source) {
            next.start.saturating_sub(self.end())
        } else {
            0
        };
        Token {
            source: self.source.clone(),
            start: self.end(),
            len,
            line,
            column,
        }
    }

    /// A view of `self[from..to]` (byte offsets relative to this token).
    pub fn slice(&self, from: usize, to: usize) -> Token {
        let to = to.min(self.len);
        let from = from.min(to);
        let (line, column) = advance_position(self.line, self.column, &self.as_str()[..from]);
        Token {
            source: self.source.clone(),
            start: self.start + from,
            len: to - from,
            line,
            column,
        }
    }
}

fn advance_position(mut line: usize, mut column: usize, text: &str) -> (usize, usize) {
    for ch in text.chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Token {}

impl PartialEq<str> for Token {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:?} @{}.{})", self.as_str(), self.line, self.column)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lexemes
// ═══════════════════════════════════════════════════════════════════════════

/// A lexeme with its byte range in the lexed text.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub token: T,
    pub span: Range<usize>,
}

impl<T> Spanned<T> {
    pub fn new(token: T, span: Range<usize>) -> Self {
        Self { token, span }
    }
}

/// A redirection operator as lexed.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectOp {
    /// The operator itself, e.g. `2>>` or `<<-`.
    pub op: Token,
    /// The operator plus its heredoc delimiter, if any.
    pub extent: Token,
    pub kind: RedirectKind,
    /// Heredoc body, attached once the following lines are read.
    pub body: Option<Token>,
}

impl RedirectOp {
    /// Whether a target word must follow the operator.
    pub fn needs_target(&self) -> bool {
        !matches!(self.kind, RedirectKind::Duplicate { .. } | RedirectKind::HereDoc { .. })
    }
}

/// Lexer error with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LexError {
    pub message: String,
    pub eof: bool,
    pub at: Option<usize>,
}

impl LexError {
    fn hard(at: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            eof: false,
            at: Some(at),
        }
    }

    fn eof(at: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            eof: true,
            at: Some(at),
        }
    }
}

/// Tokens produced by the shoal lexer.
///
/// Words carry a [`Token`] view. Brackets carry one too so the parser can
/// build block tokens spanning open to close.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexError)]
#[logos(extras = Scan)]
#[logos(skip r"[ \t\r]+")]
pub enum Lexeme {
    /// Text up to the next blank, operator or closing bracket.
    #[regex(r"[^ \t\r\n;|&<>(){}\[\]=#]", lex_word)]
    Word(Token),

    #[token("=", lex_view)]
    Eq(Token),

    // ═══════════════════════════════════════════════════════════════════
    // Brackets
    // ═══════════════════════════════════════════════════════════════════
    #[token("{", lex_view)]
    LBrace(Token),

    #[token("}", lex_view)]
    RBrace(Token),

    #[token("(", lex_view)]
    LParen(Token),

    #[token(")", lex_view)]
    RParen(Token),

    #[token("[", lex_view)]
    LBracket(Token),

    #[token("]", lex_view)]
    RBracket(Token),

    // ═══════════════════════════════════════════════════════════════════
    // Operators
    // ═══════════════════════════════════════════════════════════════════
    #[token(";")]
    Semi,

    /// Ends a statement; also reads any heredoc bodies queued on its line.
    #[regex(r"\r?\n", lex_newline)]
    Newline,

    #[token("&&")]
    And,

    #[token("||")]
    Or,

    #[token("|")]
    Pipe,

    #[token("|&")]
    PipeAll,

    #[token("&")]
    Amp,

    #[regex(r"[0-9]?>>?", lex_output)]
    #[regex(r"&>>?", lex_output_both)]
    #[regex(r"[0-9]?>&[0-9]", lex_duplicate)]
    #[regex(r"[0-9]?>&", lex_missing_descriptor)]
    #[regex(r"[0-9]?<>?", lex_input)]
    #[token("<<<", lex_here_string)]
    #[regex(r"<<-?", lex_heredoc)]
    Redirect(RedirectOp),

    // ═══════════════════════════════════════════════════════════════════
    // Trivia (filtered by tokenize)
    // ═══════════════════════════════════════════════════════════════════
    #[regex(r"#[^\n]*", allow_greedy = true)]
    Comment,

    #[regex(r"\\[ \t]*\r?\n")]
    LineContinuation,
}

impl fmt::Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lexeme::Word(t)
            | Lexeme::Eq(t)
            | Lexeme::LBrace(t)
            | Lexeme::RBrace(t)
            | Lexeme::LParen(t)
            | Lexeme::RParen(t)
            | Lexeme::LBracket(t)
            | Lexeme::RBracket(t) => write!(f, "{t}"),
            Lexeme::Redirect(r) => write!(f, "{}", r.op),
            Lexeme::Semi => write!(f, ";"),
            Lexeme::Newline => write!(f, "\\n"),
            Lexeme::And => write!(f, "&&"),
            Lexeme::Or => write!(f, "||"),
            Lexeme::Pipe => write!(f, "|"),
            Lexeme::PipeAll => write!(f, "|&"),
            Lexeme::Amp => write!(f, "&"),
            Lexeme::Comment => write!(f, "#"),
            Lexeme::LineContinuation => write!(f, "\\"),
        }
    }
}

/// What a lexeme means to word assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Text,
    Eq,
    Open(char),
    Close(char),
    Redirect { needs_target: bool },
    /// `&&`, `||`, `|`, `|&`: a command must follow.
    Operand,
    /// `;`, newline, `&`: ends a statement.
    Break,
}

impl Lexeme {
    fn class(&self) -> Class {
        match self {
            Lexeme::Word(_) | Lexeme::Comment | Lexeme::LineContinuation => Class::Text,
            Lexeme::Eq(_) => Class::Eq,
            Lexeme::LBrace(_) => Class::Open('{'),
            Lexeme::LParen(_) => Class::Open('('),
            Lexeme::LBracket(_) => Class::Open('['),
            Lexeme::RBrace(_) => Class::Close('}'),
            Lexeme::RParen(_) => Class::Close(')'),
            Lexeme::RBracket(_) => Class::Close(']'),
            Lexeme::Redirect(r) => Class::Redirect {
                needs_target: r.needs_target(),
            },
            Lexeme::And | Lexeme::Or | Lexeme::Pipe | Lexeme::PipeAll => Class::Operand,
            Lexeme::Semi | Lexeme::Newline | Lexeme::Amp => Class::Break,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scan state
// ═══════════════════════════════════════════════════════════════════════════

/// Lexer extras: where the lexed text sits in its buffer, and heredocs
/// waiting for the end of their line.
pub struct Scan {
    source: Arc<str>,
    base: usize,
    len: usize,
    line: usize,
    column: usize,
    /// Offsets (relative to the lexed text) where lines 2.. begin.
    line_starts: Vec<usize>,
    pending: Vec<(String, bool)>,
    bodies: Vec<Token>,
}

impl Default for Scan {
    fn default() -> Self {
        Self::new(&Token::detached(""))
    }
}

impl Scan {
    fn new(token: &Token) -> Self {
        let line_starts = token.as_str().match_indices('\n').map(|(i, _)| i + 1).collect();
        Self {
            source: token.source.clone(),
            base: token.start,
            len: token.len,
            line: token.line,
            column: token.column,
            line_starts,
            pending: Vec::new(),
            bodies: Vec::new(),
        }
    }

    fn text(&self) -> &str {
        &self.source[self.base..self.base + self.len]
    }

    /// The token viewing `start..end` of the lexed text.
    fn view(&self, start: usize, end: usize) -> Token {
        let text = self.text();
        let lines = self.line_starts.partition_point(|&s| s <= start);
        let (line, column) = match lines.checked_sub(1).and_then(|i| self.line_starts.get(i)) {
            Some(&line_start) => (self.line + lines, 1 + text[line_start..start].chars().count()),
            None => (self.line, self.column + text[..start].chars().count()),
        };
        Token {
            source: self.source.clone(),
            start: self.base + start,
            len: end.saturating_sub(start),
            line,
            column,
        }
    }

    fn syntax_error(&self, error: LexError) -> SyntaxError {
        let at = error.at.unwrap_or(0).min(self.len);
        let position = self.view(at, at);
        if error.eof {
            SyntaxError::eof(position.line, position.column, error.message)
        } else {
            SyntaxError::new(position.line, position.column, error.message)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Callbacks
// ═══════════════════════════════════════════════════════════════════════════

fn lex_view(lex: &mut logos::Lexer<Lexeme>) -> Token {
    let span = lex.span();
    lex.extras.view(span.start, span.end)
}

fn lex_word(lex: &mut logos::Lexer<Lexeme>) -> Result<Token, LexError> {
    let span = lex.span();
    let end = scan_word(lex.source(), span.start)?;
    lex.bump(end - span.end);
    Ok(lex.extras.view(span.start, end))
}

fn redirect(lex: &logos::Lexer<Lexeme>, kind: RedirectKind) -> RedirectOp {
    let span = lex.span();
    let op = lex.extras.view(span.start, span.end);
    RedirectOp {
        extent: op.clone(),
        op,
        kind,
        body: None,
    }
}

/// The leading descriptor digit of an operator, or `default`.
fn descriptor(op: &str, default: u8) -> u8 {
    match op.as_bytes().first() {
        Some(d) if d.is_ascii_digit() => d - b'0',
        _ => default,
    }
}

fn lex_output(lex: &mut logos::Lexer<Lexeme>) -> RedirectOp {
    let op = lex.slice();
    let kind = RedirectKind::Output {
        fd: descriptor(op, 1),
        both: false,
        append: op.ends_with(">>"),
    };
    redirect(lex, kind)
}

fn lex_output_both(lex: &mut logos::Lexer<Lexeme>) -> RedirectOp {
    let kind = RedirectKind::Output {
        fd: 1,
        both: true,
        append: lex.slice().ends_with(">>"),
    };
    redirect(lex, kind)
}

fn lex_duplicate(lex: &mut logos::Lexer<Lexeme>) -> RedirectOp {
    let op = lex.slice();
    let target = op.as_bytes().last().map_or(1, |d| d - b'0');
    let kind = RedirectKind::Duplicate {
        fd: descriptor(op, 1),
        target,
    };
    redirect(lex, kind)
}

fn lex_missing_descriptor(lex: &mut logos::Lexer<Lexeme>) -> Result<RedirectOp, LexError> {
    Err(LexError::hard(lex.span().end, "expected a descriptor number after '>&'"))
}

fn lex_input(lex: &mut logos::Lexer<Lexeme>) -> RedirectOp {
    let op = lex.slice();
    let kind = RedirectKind::Input {
        fd: descriptor(op, 0),
        write: op.ends_with("<>"),
    };
    redirect(lex, kind)
}

fn lex_here_string(lex: &mut logos::Lexer<Lexeme>) -> RedirectOp {
    redirect(lex, RedirectKind::HereString)
}

/// `<<WORD` / `<<-WORD`: read the delimiter and queue it for the next newline.
fn lex_heredoc(lex: &mut logos::Lexer<Lexeme>) -> Result<RedirectOp, LexError> {
    let text = lex.source();
    let span = lex.span();
    let strip_tabs = lex.slice().ends_with('-');
    let start = span.end + (text[span.end..].len() - text[span.end..].trim_start_matches([' ', '\t']).len());
    let end = match text[start..].chars().next() {
        Some(c) if !ends_word(c) => scan_word(text, start)?,
        _ => start,
    };
    if end == start {
        return Err(LexError::hard(
            start,
            format!("expected heredoc delimiter after '{}'", lex.slice()),
        ));
    }

    let delimiter = strip_quotes(&text[start..end]);
    tracing::trace!(delimiter = %delimiter, strip_tabs, "queued heredoc");
    lex.extras.pending.push((delimiter, strip_tabs));
    lex.bump(end - span.end);
    Ok(RedirectOp {
        op: lex.extras.view(span.start, span.end),
        extent: lex.extras.view(span.start, end),
        kind: RedirectKind::HereDoc { strip_tabs },
        body: None,
    })
}

/// Read the bodies of heredocs queued on the line this newline ends, and
/// continue lexing after the last terminator line.
fn lex_newline(lex: &mut logos::Lexer<Lexeme>) -> Result<(), LexError> {
    if lex.extras.pending.is_empty() {
        return Ok(());
    }
    let text = lex.source();
    let after = lex.span().end;
    let mut cursor = after;
    for (delimiter, strip_tabs) in std::mem::take(&mut lex.extras.pending) {
        let body_start = cursor;
        loop {
            if cursor >= text.len() {
                return Err(LexError::eof(
                    text.len(),
                    format!("unexpected EOT looking for heredoc terminator {delimiter}"),
                ));
            }
            let rest = &text[cursor..];
            let (line, next) = match rest.find('\n') {
                Some(i) => (&rest[..i], cursor + i + 1),
                None => (rest, text.len()),
            };
            let candidate = if strip_tabs { line.trim_start_matches('\t') } else { line };
            if candidate.trim_end_matches('\r') == delimiter {
                let body = lex.extras.view(body_start, cursor);
                lex.extras.bodies.push(body);
                cursor = next;
                break;
            }
            cursor = next;
        }
    }
    lex.bump(cursor - after);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Scanners
// ═══════════════════════════════════════════════════════════════════════════

/// Characters that end a word at the top level of that word.
fn ends_word(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t' | '\r' | '\n' | ';' | '|' | '&' | '<' | '>' | '=' | ')' | '}' | ']'
    )
}

fn closer_for(open: char) -> Option<char> {
    match open {
        '(' => Some(')'),
        '{' => Some('}'),
        '[' => Some(']'),
        _ => None,
    }
}

/// Consume the escaped character after the `\` at `at`.
fn scan_escape(text: &str, at: usize) -> Result<usize, LexError> {
    match text[at + 1..].chars().next() {
        Some(c) => Ok(at + 1 + c.len_utf8()),
        None => Err(LexError::eof(text.len(), "unexpected EOT after '\\'")),
    }
}

/// End offset of the word starting at `start`.
fn scan_word(text: &str, start: usize) -> Result<usize, LexError> {
    let mut at = start;
    while let Some(c) = text[at..].chars().next() {
        at = match c {
            c if ends_word(c) => break,
            '\'' | '"' => scan_quoted(text, at)?,
            '\\' => scan_escape(text, at)?,
            '(' | '{' | '[' => scan_group(text, at)?,
            c => at + c.len_utf8(),
        };
    }
    Ok(at)
}

/// Offset just past the quote closing the one at `start`.
fn scan_quoted(text: &str, start: usize) -> Result<usize, LexError> {
    let Some(quote) = text[start..].chars().next() else {
        return Err(LexError::eof(start, "unexpected EOT"));
    };
    let mut at = start + quote.len_utf8();
    loop {
        let Some(c) = text[at..].chars().next() else {
            return Err(LexError::eof(
                text.len(),
                format!("unexpected EOT looking for matching {quote}"),
            ));
        };
        at = match c {
            c if c == quote => return Ok(at + c.len_utf8()),
            '\\' if quote == '"' => scan_escape(text, at)?,
            '$' | '%' if quote == '"' && matches!(text[at + 1..].chars().next(), Some('(' | '{')) => {
                scan_group(text, at + 1)?
            }
            c => at + c.len_utf8(),
        };
    }
}

/// Whether a `#` at `at` starts a comment: it must begin a word.
fn starts_comment(text: &str, at: usize) -> bool {
    match text[..at].chars().next_back() {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, ';' | '|' | '&'),
    }
}

/// Offset just past the bracket closing the group that opens at `start`.
///
/// Quotes, escapes and comments inside the group are honored so that a
/// closing bracket inside them does not end the group.
fn scan_group(text: &str, start: usize) -> Result<usize, LexError> {
    let mut expected: Vec<char> = Vec::new();
    match text[start..].chars().next() {
        Some(open) => match closer_for(open) {
            Some(close) => expected.push(close),
            None => return Err(LexError::hard(start, format!("expected a group but found '{open}'"))),
        },
        None => return Err(LexError::eof(start, "unexpected EOT")),
    }
    let mut at = start + 1;
    while let Some(&close) = expected.last() {
        let Some(c) = text[at..].chars().next() else {
            return Err(LexError::eof(
                text.len(),
                format!("unexpected EOT looking for matching '{close}'"),
            ));
        };
        at = match c {
            '\'' | '"' => scan_quoted(text, at)?,
            '\\' => scan_escape(text, at)?,
            '#' if starts_comment(text, at) => at + text[at..].find('\n').unwrap_or(text.len() - at),
            c => {
                if let Some(nested) = closer_for(c) {
                    expected.push(nested);
                } else if c == close {
                    expected.pop();
                } else if matches!(c, ')' | '}' | ']') {
                    return Err(LexError::hard(at, format!("unexpected '{c}', expected '{close}'")));
                }
                at + c.len_utf8()
            }
        };
    }
    Ok(at)
}

/// Find the byte offset of the bracket closing the group that opens at
/// `open` in `text`.
pub fn matching_close(text: &str, open: usize) -> Result<usize, SyntaxError> {
    scan_group(text, open).map(|end| end - 1).map_err(|error| {
        let at = error.at.unwrap_or(open).min(text.len());
        let (line, column) = advance_position(1, 1, &text[..at]);
        SyntaxError {
            line,
            column,
            message: error.message,
            eof: error.eof,
        }
    })
}

/// Whether `text` can be the target of a `name=value` assignment.
pub fn is_assignable(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn strip_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {}
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Tokenize
// ═══════════════════════════════════════════════════════════════════════════

/// Tokenize the text viewed by `token`.
///
/// Comments and line continuations are dropped, heredoc bodies are attached
/// to their operators, and touching fragments are joined into words. Spans
/// are byte ranges relative to the start of `token`.
pub fn tokenize(token: &Token) -> Result<Vec<Spanned<Lexeme>>, SyntaxError> {
    let mut lex = Lexeme::lexer_with_extras(token.as_str(), Scan::new(token));
    let mut raw = Vec::new();
    while let Some(result) = lex.next() {
        let span = lex.span();
        match result {
            Ok(Lexeme::Comment | Lexeme::LineContinuation) => {}
            Ok(lexeme) => raw.push(Spanned::new(lexeme, span)),
            Err(mut error) => {
                error.at.get_or_insert(span.start);
                if error.message.is_empty() {
                    error.message = format!("unexpected '{}'", lex.slice());
                }
                return Err(lex.extras.syntax_error(error));
            }
        }
    }

    let scan = std::mem::take(&mut lex.extras);
    if let Some((delimiter, _)) = scan.pending.first() {
        return Err(scan.syntax_error(LexError::eof(
            scan.len,
            format!("unexpected EOT looking for heredoc terminator {delimiter}"),
        )));
    }

    let mut bodies = scan.bodies.iter().cloned();
    for spanned in &mut raw {
        if let Lexeme::Redirect(r) = &mut spanned.token {
            if matches!(r.kind, RedirectKind::HereDoc { .. }) {
                r.body = bodies.next();
            }
        }
    }

    assemble(&raw, &scan)
}

// ═══════════════════════════════════════════════════════════════════════════
// Word assembly
// ═══════════════════════════════════════════════════════════════════════════

/// One open bracket while assembling.
struct Frame {
    close: Option<char>,
    open: usize,
    array: bool,
    /// Words so far in the current statement.
    words: usize,
    /// The next word is a redirection target.
    target: bool,
}

impl Frame {
    fn new(close: Option<char>, open: usize) -> Self {
        Self {
            close,
            open,
            array: close == Some(']'),
            words: 0,
            target: false,
        }
    }

    fn at_statement_start(&self) -> bool {
        self.words == 0 && !self.array && !self.target
    }
}

/// A word being joined from touching fragments. `literal` marks a closed
/// bracket literal, which nothing may touch.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    start: usize,
    end: usize,
    literal: bool,
}

struct Assembler<'a> {
    scan: &'a Scan,
    frames: Vec<Frame>,
    word: Option<Fragment>,
    out: Vec<Spanned<Lexeme>>,
}

impl Assembler<'_> {
    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    fn count_word(&mut self) {
        let frame = self.frame();
        if frame.target {
            frame.target = false;
        } else {
            frame.words += 1;
        }
    }

    fn flush(&mut self) {
        if let Some(word) = self.word.take() {
            if !word.literal {
                let token = self.scan.view(word.start, word.end);
                self.out.push(Spanned::new(Lexeme::Word(token), word.start..word.end));
                self.count_word();
            }
        }
    }

    fn end_statement(&mut self) {
        let frame = self.frame();
        frame.words = 0;
        frame.target = false;
    }

    fn after_literal(&self, literal: Fragment, at: usize) -> SyntaxError {
        let text = self.scan.text();
        let next = text[at..].chars().next().unwrap_or(' ');
        self.scan.syntax_error(LexError::hard(
            at,
            format!("unexpected '{next}' after '{}'", &text[literal.start..literal.end]),
        ))
    }

    /// Append `span` to the touching word, or start a new one.
    fn join(&mut self, touching: Option<Fragment>, span: &Range<usize>) -> Result<(), SyntaxError> {
        match touching {
            Some(word) if word.literal => Err(self.after_literal(word, span.start)),
            Some(word) => {
                self.word = Some(Fragment { end: span.end, ..word });
                Ok(())
            }
            None => {
                self.flush();
                self.word = Some(Fragment {
                    start: span.start,
                    end: span.end,
                    literal: false,
                });
                Ok(())
            }
        }
    }
}

/// Join touching fragments into words and split a leading `name=`.
///
/// A bracket opens a block only at the start of a word; one that touches
/// text is an ordinary group inside that word. A closing bracket that does
/// not close the innermost block is text.
fn assemble(raw: &[Spanned<Lexeme>], scan: &Scan) -> Result<Vec<Spanned<Lexeme>>, SyntaxError> {
    let text = scan.text();
    let mut asm = Assembler {
        scan,
        frames: vec![Frame::new(None, 0)],
        word: None,
        out: Vec::with_capacity(raw.len()),
    };
    let mut skip_to = 0;

    for (i, Spanned { token, span }) in raw.iter().enumerate() {
        if span.start < skip_to {
            continue;
        }
        let touching = asm.word.filter(|w| w.end == span.start);

        match token.class() {
            Class::Text => asm.join(touching, span)?,
            Class::Eq => {
                let at_start = asm.top().at_statement_start();
                let split = touching.is_some_and(|w| !w.literal && at_start && is_assignable(&text[w.start..w.end]));
                if asm.top().array || split {
                    asm.flush();
                    asm.out.push(Spanned::new(token.clone(), span.clone()));
                } else {
                    asm.join(touching, span)?;
                }
            }
            Class::Open(open) => match touching {
                Some(word) if word.literal => return Err(asm.after_literal(word, span.start)),
                Some(word) => {
                    let end = scan_group(text, span.start).map_err(|e| scan.syntax_error(e))?;
                    asm.word = Some(Fragment { end, ..word });
                    skip_to = end;
                }
                None => {
                    asm.flush();
                    asm.count_word();
                    asm.out.push(Spanned::new(token.clone(), span.clone()));
                    asm.frames.push(Frame::new(closer_for(open), span.start));
                }
            },
            Class::Close(close) if asm.frames.len() > 1 && asm.top().close == Some(close) => {
                asm.flush();
                let open = asm.top().open;
                asm.frames.pop();
                asm.out.push(Spanned::new(token.clone(), span.clone()));
                asm.word = Some(Fragment {
                    start: open,
                    end: span.end,
                    literal: true,
                });
            }
            Class::Close(_) => {
                if touching.is_none() {
                    asm.flush();
                }
                if touching.is_none() && asm.top().at_statement_start() {
                    asm.out.push(Spanned::new(token.clone(), span.clone()));
                } else {
                    asm.join(touching, span)?;
                }
            }
            Class::Redirect { needs_target } => {
                asm.flush();
                if needs_target && i + 1 == raw.len() {
                    return Err(scan.syntax_error(LexError::eof(text.len(), format!("unexpected EOT after '{token}'"))));
                }
                asm.out.push(Spanned::new(token.clone(), span.clone()));
                asm.frame().target = needs_target;
            }
            Class::Operand => {
                asm.flush();
                let close = asm.top().close;
                match raw[i + 1..].iter().find(|t| t.token != Lexeme::Newline) {
                    None => {
                        return Err(scan.syntax_error(LexError::eof(text.len(), format!("unexpected EOT after '{token}'"))));
                    }
                    Some(next) if close.is_some_and(|c| next.token.class() == Class::Close(c)) => {
                        return Err(scan.syntax_error(LexError::hard(
                            next.span.start,
                            format!("expected a command after '{token}'"),
                        )));
                    }
                    Some(_) => {}
                }
                asm.out.push(Spanned::new(token.clone(), span.clone()));
                asm.end_statement();
            }
            Class::Break => {
                asm.flush();
                asm.out.push(Spanned::new(token.clone(), span.clone()));
                asm.end_statement();
            }
        }
    }

    asm.flush();
    if let Some(close) = asm.frames.last().and_then(|f| f.close) {
        return Err(scan.syntax_error(LexError::eof(
            text.len(),
            format!("unexpected EOT looking for '{close}'"),
        )));
    }
    Ok(asm.out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexemes(source: &str) -> Vec<String> {
        tokenize(&Token::detached(source))
            .unwrap()
            .into_iter()
            .map(|s| s.token.to_string())
            .collect()
    }

    fn error(source: &str) -> SyntaxError {
        tokenize(&Token::detached(source)).unwrap_err()
    }

    fn word(spanned: &Spanned<Lexeme>) -> &Token {
        match &spanned.token {
            Lexeme::Word(t) => t,
            other => panic!("expected word, got {other:?}"),
        }
    }

    #[test]
    fn token_equality_is_textual() {
        let tokens = tokenize(&Token::detached("echo echo")).unwrap();
        let (first, second) = (word(&tokens[0]), word(&tokens[1]));
        assert_eq!(first, second);
        assert_eq!(second.column(), 6);
        assert_eq!(first, "echo");
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = tokenize(&Token::detached("a\n  bc")).unwrap();
        let bc = word(&tokens[2]);
        assert_eq!((bc.line(), bc.column()), (2, 3));
    }

    #[test]
    fn views_keep_the_outer_position() {
        let outer = Token::detached("run {\n  echo x\n}");
        let inner = outer.slice(5, 15);
        let tokens = tokenize(&inner).unwrap();
        let echo = word(&tokens[1]);
        assert_eq!(echo, "echo");
        assert_eq!((echo.line(), echo.column()), (2, 3));
    }

    #[test]
    fn operators_and_redirections() {
        assert_eq!(
            lexemes("a | b |& c && d || e; f & 2>&1 &>> g <<< h"),
            vec!["a", "|", "b", "|&", "c", "&&", "d", "||", "e", ";", "f", "&", "2>&1", "&>>", "g", "<<<", "h"]
        );
    }

    #[test]
    fn groups_stay_inside_words() {
        assert_eq!(
            lexemes("echo ${a[0]} $(ls | wc) %(1 + 2)x 'a b' \"c $(d)\""),
            vec!["echo", "${a[0]}", "$(ls | wc)", "%(1 + 2)x", "'a b'", "\"c $(d)\""]
        );
    }

    #[test]
    fn leading_assignment_is_split() {
        assert_eq!(lexemes("x=1"), vec!["x", "=", "1"]);
        assert_eq!(lexemes("x==1"), vec!["x", "=", "=1"]);
        assert_eq!(lexemes("echo a=b x=1"), vec!["echo", "a=b", "x=1"]);
        assert_eq!(lexemes("echo a=(b c)"), vec!["echo", "a=(b c)"]);
        assert_eq!(lexemes("> f x=1"), vec![">", "f", "x", "=", "1"]);
    }

    #[test]
    fn equals_separates_inside_arrays() {
        assert_eq!(lexemes("[a=1 b = [2]]"), vec!["[", "a", "=", "1", "b", "=", "[", "2", "]", "]"]);
    }

    #[test]
    fn stray_closers_are_text() {
        assert_eq!(lexemes("echo a) }"), vec!["echo", "a)", "}"]);
        assert_eq!(lexemes("{ echo a) }"), vec!["{", "echo", "a)", "}"]);
    }

    #[test]
    fn comments_start_words_only() {
        assert_eq!(lexemes("# leading\necho b#c # trailing"), vec!["\\n", "echo", "b#c"]);
        assert_eq!(lexemes("a \\\n b"), vec!["a", "b"]);
    }

    #[test]
    fn heredoc_bodies_are_attached() {
        let tokens = tokenize(&Token::detached("cat <<EOF rest\nhello\nEOF\nnext")).unwrap();
        let Lexeme::Redirect(op) = &tokens[1].token else {
            panic!("expected redirect");
        };
        assert_eq!(op.op, "<<");
        assert_eq!(op.extent, "<<EOF");
        assert_eq!(op.body.as_ref().unwrap(), "hello\n");
        let next = word(&tokens[4]);
        assert_eq!(next, "next");
        assert_eq!(next.line(), 4);
    }

    #[test]
    fn two_heredocs_on_one_line() {
        let tokens = tokenize(&Token::detached("a <<A <<-'B'\none\nA\n\ttwo\n\tB\n")).unwrap();
        let bodies: Vec<String> = tokens
            .iter()
            .filter_map(|s| match &s.token {
                Lexeme::Redirect(r) => r.body.as_ref().map(|b| b.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["one\n", "\ttwo\n"]);
    }

    #[test]
    fn incomplete_input_is_eof() {
        for source in [
            "{ a",
            "'abc",
            "a &&",
            "a |\n",
            "echo $(ls",
            "a >",
            "cat <<EOF\nhello\n",
            "cat <<EOF",
            "a \\",
        ] {
            assert!(error(source).eof, "{source}");
        }
    }

    #[test]
    fn malformed_input_is_hard() {
        for source in ["echo a(b}", "{a}b", "{ a && }", "a >&x", "cat <<", "[x]{y}"] {
            let err = error(source);
            assert!(!err.eof, "{source}: {err}");
        }
        assert_eq!(error("{a}b").message, "unexpected 'b' after '{a}'");
        assert_eq!(error("{ a && }").message, "expected a command after '&&'");
    }

    #[test]
    fn error_positions() {
        let err = error("echo ok\necho a(b}");
        assert_eq!((err.line, err.column), (2, 9));
    }

    #[test]
    fn skips_nested_groups() {
        let text = "{ a { b } 'x}' \"}\" } tail";
        assert_eq!(scan_group(text, 0).unwrap(), text.len() - " tail".len());
    }

    #[test]
    fn group_with_comment() {
        let text = "{ a # } not closed\n } tail";
        assert_eq!(scan_group(text, 0).unwrap(), text.len() - " tail".len());
    }

    #[test]
    fn group_errors() {
        assert!(scan_group("( a ( b )", 0).unwrap_err().eof);
        assert!(!scan_group("( a }", 0).unwrap_err().eof);
        assert!(scan_quoted("'abc", 0).unwrap_err().eof);
    }

    #[test]
    fn matching_close_finds_offset() {
        assert_eq!(matching_close("${a[1]}x", 1).unwrap(), 6);
        assert_eq!(matching_close("%(1+(2*3))", 1).unwrap(), 9);
    }

    #[test]
    fn slice_keeps_positions() {
        let token = Token::detached("ab\ncd");
        let tail = token.slice(3, 5);
        assert_eq!(tail, "cd");
        assert_eq!((tail.line(), tail.column()), (2, 1));
    }

    #[test]
    fn span_between_brackets() {
        let token = Token::detached("{ a }");
        let body = token.slice(0, 1).span_between(&token.slice(4, 5));
        assert_eq!(body, " a ");
        assert_eq!(body.column(), 2);
    }
}
