//! Word expansion.
//!
//! A word's text is scanned left to right. Quoting decides how the pieces
//! are glued back together:
//!
//! ```text
//!   $x          ──▶ x's value, untouched (a list stays a list)
//!   "$x"        ──▶ string; lists joined with single spaces
//!   pre$x.txt   ──▶ string
//!   ${(@)x}     ──▶ Args: spliced into the surrounding argument list
//!   '$x'        ──▶ the literal text $x
//! ```
//!
//! | form                      | meaning                                     |
//! |---------------------------|---------------------------------------------|
//! | `$name` `${name}`         | variable, `null` when unset                 |
//! | `$(program)`              | run program, substitute its result          |
//! | `%(expr)`                 | arithmetic / boolean expression             |
//! | `$'text'`                 | ANSI-C escapes                              |
//! | `${x:-w}` `${x-w}`        | default when unset (`:` also when empty)    |
//! | `${x:=w}` `${x=w}`        | assign default when unset                   |
//! | `${x::=w}`                | always assign                               |
//! | `${x:+w}` `${x+w}`        | alternate when set                          |
//! | `${x:?w}` `${x?w}`        | fail when unset                             |
//! | `${#x}` `${+x}` `${=x}`   | length, is-set, split on whitespace         |
//! | `${x#p}` `${x##p}`        | trim shortest / longest prefix              |
//! | `${x%p}` `${x%%p}`        | trim shortest / longest suffix              |
//! | `${x/p/r}` `${x//p/r}`    | replace first / all                         |
//! | `${x[i]}` `${x[lo,hi]}`   | index or inclusive slice, negative from end |
//! | `${(flags)x}`             | see [`Flags`]                               |

use std::cmp::Ordering;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::ast::Program;
use crate::error::ShellError;
use crate::glob::{unquote_glob, GlobPattern};
use crate::interpreter::Value;
use crate::lexer::{matching_close, Token};
use crate::parser::parse_token;

/// What expansion needs from the running program.
pub trait Evaluate: Send + Sync {
    /// Variable or positional parameter; `Null` when unset.
    fn get(&self, name: &str) -> Value;

    fn put(&self, name: &str, value: Value);

    /// Run a `$(...)` program and return its result or captured output.
    fn substitute(&self, program: Program) -> BoxFuture<'_, Result<Value, ShellError>>;

    /// Evaluate a `%(...)` expression.
    fn expr(&self, expression: &str) -> Result<Value, ShellError>;
}

/// Whether expanding `text` could change it.
pub fn needs_expansion(text: &str) -> bool {
    text.contains(['$', '\\', '\'', '"']) || text.contains("%(")
}

/// Expand one word.
pub fn expand<'a>(eval: &'a dyn Evaluate, token: &'a Token) -> BoxFuture<'a, Result<Value, ShellError>> {
    async move { Expander::new(eval, token, Mode::Word).run().await }.boxed()
}

/// Expand `token` as if it were wrapped in double quotes.
pub fn expand_quoted<'a>(eval: &'a dyn Evaluate, token: &'a Token) -> BoxFuture<'a, Result<Value, ShellError>> {
    async move { Expander::new(eval, token, Mode::Quoted).run().await }.boxed()
}

/// String form of a value inside a larger word.
pub fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::List(items) | Value::Args(items) => items.iter().map(text_of).collect::<Vec<_>>().join(" "),
        other => other.to_string(),
    }
}

fn bad_substitution(text: &str) -> ShellError {
    ShellError::expansion(format!("bad substitution: {text}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// A normal word.
    Word,
    /// The whole word sits inside double quotes.
    Quoted,
    /// Expand `$` forms, keep quotes and escapes for the glob translator.
    Raw,
}

#[derive(Debug)]
enum Part {
    Text(String),
    Value(Value),
    Explode(Vec<Value>),
}

struct Expander<'a> {
    eval: &'a dyn Evaluate,
    token: &'a Token,
    text: &'a str,
    pos: usize,
    mode: Mode,
}

impl<'a> Expander<'a> {
    fn new(eval: &'a dyn Evaluate, token: &'a Token, mode: Mode) -> Self {
        Self {
            eval,
            token,
            text: token.as_str(),
            pos: 0,
            mode,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.text.get(self.pos + offset..).and_then(|s| s.chars().next())
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Recursively expand `text[from..to]` of this word.
    fn sub<'b>(&'b self, from: usize, to: usize, mode: Mode) -> BoxFuture<'b, Result<Value, ShellError>> {
        let token = self.token.slice(from, to);
        let eval = self.eval;
        async move { Expander::new(eval, &token, mode).run().await }.boxed()
    }

    async fn run(mut self) -> Result<Value, ShellError> {
        let mut parts: Vec<Part> = Vec::new();
        let mut literal = String::new();
        let mut in_dq = self.mode == Mode::Quoted;
        let mut quoted = in_dq;
        let raw = self.mode == Mode::Raw;

        while let Some(c) = self.peek() {
            match c {
                '\'' if !in_dq => {
                    quoted = true;
                    let start = self.pos;
                    self.bump();
                    let close = self.text[self.pos..]
                        .find('\'')
                        .map(|i| self.pos + i)
                        .ok_or_else(|| ShellError::expansion("unterminated quote"))?;
                    if raw {
                        literal.push_str(&self.text[start..=close]);
                    } else {
                        literal.push_str(&self.text[self.pos..close]);
                    }
                    self.pos = close + 1;
                }
                '"' => {
                    quoted = true;
                    in_dq = !in_dq;
                    self.bump();
                    if raw {
                        literal.push('"');
                    }
                }
                '\\' => {
                    self.bump();
                    let Some(next) = self.bump() else {
                        literal.push('\\');
                        break;
                    };
                    quoted = true;
                    if raw {
                        literal.push('\\');
                        literal.push(next);
                    } else if in_dq && !matches!(next, '$' | '"' | '\\' | '`' | '\n') {
                        literal.push('\\');
                        literal.push(next);
                    } else if next != '\n' {
                        literal.push(next);
                    }
                }
                '$' if !in_dq && self.peek_at(1) == Some('\'') => {
                    quoted = true;
                    let decoded = self.ansi_c()?;
                    literal.push_str(&decoded);
                }
                '$' => match self.dollar().await? {
                    Some(part) => {
                        if !literal.is_empty() {
                            parts.push(Part::Text(std::mem::take(&mut literal)));
                        }
                        parts.push(match part {
                            Part::Value(v) if in_dq || raw => Part::Text(text_of(&v)),
                            other => other,
                        });
                    }
                    None => {
                        self.bump();
                        literal.push('$');
                    }
                },
                '%' if self.peek_at(1) == Some('(') => {
                    let value = self.expression().await?;
                    if !literal.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut literal)));
                    }
                    parts.push(if in_dq || raw {
                        Part::Text(text_of(&value))
                    } else {
                        Part::Value(value)
                    });
                }
                _ => {
                    self.bump();
                    literal.push(c);
                }
            }
        }

        if in_dq && self.mode != Mode::Quoted {
            return Err(ShellError::expansion("unterminated quote"));
        }
        if !literal.is_empty() {
            parts.push(Part::Text(literal));
        }
        Ok(assemble(parts, quoted))
    }

    /// `$'...'` with C escapes.
    fn ansi_c(&mut self) -> Result<String, ShellError> {
        self.bump();
        self.bump();
        let mut out = String::new();
        loop {
            let c = self.bump().ok_or_else(|| ShellError::expansion("unterminated quote"))?;
            match c {
                '\'' => return Ok(out),
                '\\' => {
                    let e = self.bump().ok_or_else(|| ShellError::expansion("unterminated quote"))?;
                    match e {
                        'a' => out.push('\x07'),
                        'b' => out.push('\x08'),
                        'e' | 'E' => out.push('\x1b'),
                        'f' => out.push('\x0c'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        'v' => out.push('\x0b'),
                        '0'..='7' => {
                            let mut code = e.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|c| c.to_digit(8)) {
                                    Some(d) => {
                                        code = code * 8 + d;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            out.extend(char::from_u32(code));
                        }
                        'x' => out.extend(self.hex_escape(2)),
                        'u' => out.extend(self.hex_escape(4)),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn hex_escape(&mut self, max: usize) -> Option<char> {
        let mut code = 0u32;
        let mut seen = 0;
        while seen < max {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    code = code * 16 + d;
                    self.bump();
                    seen += 1;
                }
                None => break,
            }
        }
        if seen == 0 {
            return None;
        }
        char::from_u32(code)
    }

    /// Expand the `$` form at the cursor. `None` when the `$` is literal.
    async fn dollar(&mut self) -> Result<Option<Part>, ShellError> {
        let start = self.pos;
        match self.peek_at(1) {
            Some('{') => {
                let close = matching_close(self.text, start + 1)?;
                let part = self.parameter(start + 2, close).await?;
                self.pos = close + 1;
                Ok(Some(part))
            }
            Some('(') => {
                let close = matching_close(self.text, start + 1)?;
                let body = self.token.slice(start + 2, close);
                let program = parse_token(&body)?;
                self.pos = close + 1;
                let value = self.eval.substitute(program).await?;
                Ok(Some(Part::Value(value)))
            }
            Some(d) if d.is_ascii_digit() => {
                self.pos = start + 2;
                Ok(Some(Part::Value(self.eval.get(&d.to_string()))))
            }
            Some(c) if is_name_start(c) => {
                let name_start = start + 1;
                let mut end = name_start;
                for (i, ch) in self.text[name_start..].char_indices() {
                    if !is_name_char(ch) {
                        break;
                    }
                    end = name_start + i + ch.len_utf8();
                }
                // A trailing dot ends the sentence, not the name.
                while end > name_start + 1 && self.text[..end].ends_with('.') {
                    end -= 1;
                }
                let name = &self.text[name_start..end];
                self.pos = end;
                Ok(Some(Part::Value(self.eval.get(name))))
            }
            _ => Ok(None),
        }
    }

    /// `%(...)`: expand `$` forms inside, then evaluate.
    async fn expression(&mut self) -> Result<Value, ShellError> {
        let open = self.pos + 1;
        let close = matching_close(self.text, open)?;
        let inner = self.sub(open + 1, close, Mode::Raw).await?;
        self.pos = close + 1;
        self.eval.expr(&text_of(&inner))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ${...}
    // ═══════════════════════════════════════════════════════════════════════

    /// Expand the parameter expression in `text[from..to]`.
    async fn parameter(&self, from: usize, to: usize) -> Result<Part, ShellError> {
        let body = &self.text[from..to];
        let whole = &self.text[from.saturating_sub(2)..(to + 1).min(self.text.len())];
        let mut i = 0;

        let mut flags = Flags::default();
        if body.starts_with('(') {
            let close = body[1..].find(')').map(|c| c + 1).ok_or_else(|| bad_substitution(whole))?;
            flags = Flags::parse(&body[1..close])?;
            i = close + 1;
        }

        let rest = &body[i..];
        let prefix = match rest.chars().next() {
            Some(p @ ('#' | '+' | '=')) if rest.len() > 1 => {
                i += 1;
                Some(p)
            }
            _ => None,
        };

        // Base: a nested expansion or a name.
        let mut name: Option<&str> = None;
        let mut value = if body[i..].starts_with("${") || body[i..].starts_with("$(") {
            let close = matching_close(body, i + 1)?;
            let nested = self.sub(from + i, from + close + 1, Mode::Word).await?;
            i = close + 1;
            nested
        } else {
            let len = body[i..]
                .char_indices()
                .find(|(j, c)| !(is_name_char(*c) || (*j == 0 && *c == '@')))
                .map(|(j, _)| j)
                .unwrap_or(body.len() - i);
            if len == 0 {
                return Err(bad_substitution(whole));
            }
            let n = &body[i..i + len];
            i += len;
            name = Some(n);
            self.eval.get(n)
        };

        if prefix == Some('+') && i == body.len() {
            return Ok(Part::Value(Value::Int(!value.is_null() as i64)));
        }

        if flags.indirect {
            let target = text_of(&value);
            value = self.eval.get(&target);
        }

        // Subscripts.
        let mut explode = flags.explode;
        while body[i..].starts_with('[') {
            let close = matching_close(body, i)?;
            let index = self.sub(from + i + 1, from + close, Mode::Word).await?;
            i = close + 1;
            let index = text_of(&index);
            if index == "@" {
                explode = true;
            } else {
                value = subscript(value, &index)?;
            }
        }

        value = self.operator(value, name, from + i, to, whole).await?;

        value = flags.apply(value);

        if prefix == Some('#') {
            return Ok(Part::Value(Value::Int(value.len() as i64)));
        }
        if prefix == Some('=') {
            let words = text_of(&value)
                .split_whitespace()
                .map(|w| Value::String(w.to_string()))
                .collect();
            return Ok(Part::Explode(words));
        }
        if explode {
            return Ok(Part::Explode(value.into_items()));
        }
        Ok(Part::Value(value))
    }

    /// Apply the operator in `text[from..to]` (possibly empty) to `value`.
    async fn operator(
        &self,
        value: Value,
        name: Option<&str>,
        from: usize,
        to: usize,
        whole: &str,
    ) -> Result<Value, ShellError> {
        let op_text = &self.text[from..to];
        if op_text.is_empty() {
            return Ok(value);
        }

        let (colon, rest_at) = if op_text.starts_with(':') { (true, 1) } else { (false, 0) };
        let rest = &op_text[rest_at..];
        let unset = value.is_null() || (colon && value.is_empty());

        let word_from = |len: usize| from + rest_at + len;
        match rest.chars().next() {
            Some('-') => {
                if unset {
                    return self.sub(word_from(1), to, Mode::Word).await;
                }
                Ok(value)
            }
            Some(':') if colon => {
                // `::=` assigns unconditionally.
                if !rest.starts_with(":=") {
                    return Err(bad_substitution(whole));
                }
                let assigned = self.sub(word_from(2), to, Mode::Word).await?;
                self.assign(name, assigned, whole)
            }
            Some('=') => {
                if unset {
                    let assigned = self.sub(word_from(1), to, Mode::Word).await?;
                    return self.assign(name, assigned, whole);
                }
                Ok(value)
            }
            Some('+') => {
                if unset {
                    return Ok(Value::Null);
                }
                self.sub(word_from(1), to, Mode::Word).await
            }
            Some('?') => {
                if unset {
                    let message = self.sub(word_from(1), to, Mode::Word).await?;
                    let message = match text_of(&message) {
                        m if m.is_empty() => "parameter not set".to_string(),
                        m => m,
                    };
                    return Err(ShellError::expansion(format!("{}: {message}", name.unwrap_or(whole))));
                }
                Ok(value)
            }
            Some('#') if !colon => {
                let longest = rest.starts_with("##");
                let pattern = self.pattern(word_from(if longest { 2 } else { 1 }), to).await?;
                Ok(map_text(value, |s| pattern.trim_prefix(s, longest).to_string()))
            }
            Some('%') if !colon => {
                let longest = rest.starts_with("%%");
                let pattern = self.pattern(word_from(if longest { 2 } else { 1 }), to).await?;
                Ok(map_text(value, |s| pattern.trim_suffix(s, longest).to_string()))
            }
            Some('/') if !colon => {
                let all = rest.starts_with("//");
                let pat_from = word_from(if all { 2 } else { 1 });
                let split = find_unescaped(&self.text[pat_from..to], '/').map(|j| pat_from + j);
                let (pat_to, repl) = match split {
                    Some(slash) => (slash, text_of(&self.sub(slash + 1, to, Mode::Word).await?)),
                    None => (to, String::new()),
                };
                let pattern = self.pattern(pat_from, pat_to).await?;
                Ok(map_text(value, |s| pattern.replace(s, &repl, all)))
            }
            _ => Err(bad_substitution(whole)),
        }
    }

    async fn pattern(&self, from: usize, to: usize) -> Result<GlobPattern, ShellError> {
        let raw = self.sub(from, to, Mode::Raw).await?;
        Ok(GlobPattern::new(&unquote_glob(&text_of(&raw)), false)?)
    }

    fn assign(&self, name: Option<&str>, value: Value, whole: &str) -> Result<Value, ShellError> {
        match name {
            Some(n) if !n.is_empty() && !n.starts_with(|c: char| c.is_ascii_digit()) => {
                self.eval.put(n, value.clone());
                Ok(value)
            }
            _ => Err(ShellError::expansion(format!("{whole}: not an identifier"))),
        }
    }
}

fn assemble(mut parts: Vec<Part>, quoted: bool) -> Value {
    if parts.len() == 1 {
        match parts.remove(0) {
            Part::Explode(items) => return Value::Args(items),
            Part::Value(v) if !quoted => return v,
            Part::Value(v) => return Value::String(text_of(&v)),
            Part::Text(s) => return Value::String(s),
        }
    }
    let mut out = String::new();
    for part in &parts {
        match part {
            Part::Text(s) => out.push_str(s),
            Part::Value(v) => out.push_str(&text_of(v)),
            Part::Explode(items) => out.push_str(&text_of(&Value::List(items.clone()))),
        }
    }
    Value::String(out)
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '.'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn find_unescaped(text: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (escaped, quote, c) {
            (true, _, _) => escaped = false,
            (false, _, '\\') => escaped = true,
            (false, None, '\'' | '"') => quote = Some(c),
            (false, Some(q), _) if c == q => quote = None,
            (false, None, _) if c == target => return Some(i),
            _ => {}
        }
    }
    None
}

/// Apply `f` to a string, or to each element of a list.
fn map_text(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::List(items) => Value::List(items.iter().map(|v| Value::String(f(&text_of(v)))).collect()),
        Value::Args(items) => Value::Args(items.iter().map(|v| Value::String(f(&text_of(v)))).collect()),
        other => Value::String(f(&text_of(&other))),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { len + index } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn parse_index(text: &str) -> Result<i64, ShellError> {
    text.trim()
        .parse()
        .map_err(|_| ShellError::expansion(format!("invalid subscript: {text}")))
}

/// `x[i]`, `x[lo,hi]` (inclusive) and `map[key]`.
fn subscript(value: Value, index: &str) -> Result<Value, ShellError> {
    if let Value::Map(map) = &value {
        return Ok(map.get(index).cloned().unwrap_or(Value::Null));
    }

    if let Some((lo, hi)) = index.split_once(',') {
        let (lo, hi) = (parse_index(lo)?, parse_index(hi)?);
        let slice = |len: usize| -> (usize, usize) {
            let clamp = |i: i64| -> i64 {
                let i = if i < 0 { len as i64 + i } else { i };
                i.clamp(0, len as i64)
            };
            let start = clamp(lo) as usize;
            let end = (clamp(hi) + 1).min(len as i64) as usize;
            (start, end.max(start))
        };
        return Ok(match value {
            Value::Null => Value::Null,
            Value::List(items) | Value::Args(items) => {
                let (s, e) = slice(items.len());
                Value::List(items[s..e].to_vec())
            }
            other => {
                let chars: Vec<char> = text_of(&other).chars().collect();
                let (s, e) = slice(chars.len());
                Value::String(chars[s..e].iter().collect())
            }
        });
    }

    let i = parse_index(index)?;
    Ok(match value {
        Value::Null => Value::Null,
        Value::List(items) | Value::Args(items) => resolve_index(i, items.len())
            .and_then(|i| items.into_iter().nth(i))
            .unwrap_or(Value::Null),
        other => {
            let chars: Vec<char> = text_of(&other).chars().collect();
            resolve_index(i, chars.len())
                .map(|i| Value::String(chars[i].to_string()))
                .unwrap_or(Value::Null)
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Flags
// ═══════════════════════════════════════════════════════════════════════════

/// Flags of `${(flags)name}`.
///
/// | flag      | effect                                            |
/// |-----------|---------------------------------------------------|
/// | `P`       | use the value as the name of another variable     |
/// | `k` `v`   | map keys, map values (both: interleaved)          |
/// | `@`       | splice the result into the argument list          |
/// | `C` `L` `U` | capitalize, lowercase, uppercase each element   |
/// | `j:s:`    | join with `s`; `F` joins with newlines            |
/// | `s:s:`    | split on `s`; `f` splits on newlines              |
/// | `o` `O`   | sort ascending, descending                        |
/// | `i` `n`   | sort case-insensitively, numerically              |
/// | `a`       | keep element order (reversed with `O`)            |
/// | `u`       | drop repeated elements                            |
/// | `#`       | treat elements as character codes                 |
/// | `G`       | with `/`: replace every match                     |
#[derive(Debug, Default, Clone)]
struct Flags {
    indirect: bool,
    keys: bool,
    values: bool,
    explode: bool,
    capitalize: bool,
    lower: bool,
    upper: bool,
    join: Option<String>,
    split: Option<String>,
    sort_asc: bool,
    sort_desc: bool,
    ignore_case: bool,
    numeric: bool,
    keep_order: bool,
    unique: bool,
    char_codes: bool,
}

impl Flags {
    fn parse(text: &str) -> Result<Self, ShellError> {
        let mut flags = Flags::default();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            match c {
                'P' => flags.indirect = true,
                'k' => flags.keys = true,
                'v' => flags.values = true,
                '@' => flags.explode = true,
                'C' => flags.capitalize = true,
                'L' => flags.lower = true,
                'U' => flags.upper = true,
                'F' => flags.join = Some("\n".to_string()),
                'f' => flags.split = Some("\n".to_string()),
                'j' | 's' => {
                    let delim = chars
                        .next()
                        .ok_or_else(|| ShellError::expansion(format!("missing separator for flag: {c}")))?;
                    let mut sep = String::new();
                    loop {
                        match chars.next() {
                            Some(d) if d == delim => break,
                            Some(other) => sep.push(other),
                            None => return Err(ShellError::expansion(format!("unterminated separator for flag: {c}"))),
                        }
                    }
                    if c == 'j' {
                        flags.join = Some(sep);
                    } else {
                        flags.split = Some(sep);
                    }
                }
                'o' => flags.sort_asc = true,
                'O' => flags.sort_desc = true,
                'i' => flags.ignore_case = true,
                'n' => flags.numeric = true,
                'a' => flags.keep_order = true,
                'u' => flags.unique = true,
                '#' => flags.char_codes = true,
                // Global replacement is what `//` does; accepted for zsh scripts.
                'G' => {}
                other => return Err(ShellError::expansion(format!("unsupported flag: {other}"))),
            }
        }
        Ok(flags)
    }

    fn apply(&self, value: Value) -> Value {
        let mut value = value;

        if let Value::Map(map) = &value {
            value = match (self.keys, self.values) {
                (true, true) => Value::List(
                    map.iter()
                        .flat_map(|(k, v)| [Value::String(k.clone()), v.clone()])
                        .collect(),
                ),
                (true, false) => Value::List(map.keys().cloned().map(Value::String).collect()),
                (false, true) => Value::List(map.values().cloned().collect()),
                (false, false) => value,
            };
        }

        if let Some(sep) = &self.split {
            if !matches!(value, Value::List(_) | Value::Args(_) | Value::Null) {
                let text = text_of(&value);
                value = Value::List(
                    text.split(sep.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                );
            }
        }

        if let Value::List(items) | Value::Args(items) = &mut value {
            if self.sort_asc || (self.sort_desc && !self.keep_order) {
                let ignore_case = self.ignore_case;
                let numeric = self.numeric;
                items.sort_by(|a, b| compare(a, b, ignore_case, numeric));
            }
            if self.sort_desc {
                items.reverse();
            }
            if self.unique {
                let mut seen: Vec<String> = Vec::new();
                items.retain(|v| {
                    let t = text_of(v);
                    if seen.contains(&t) {
                        false
                    } else {
                        seen.push(t);
                        true
                    }
                });
            }
        }

        if self.char_codes {
            value = map_scalars(value, |v| match v.to_i64().and_then(|c| u32::try_from(c).ok()).and_then(char::from_u32) {
                Some(c) => Value::String(c.to_string()),
                None => v,
            });
        }

        if self.capitalize || self.lower || self.upper {
            value = map_scalars(value, |v| {
                let text = text_of(&v);
                Value::String(if self.upper {
                    text.to_uppercase()
                } else if self.lower {
                    text.to_lowercase()
                } else {
                    capitalize(&text)
                })
            });
        }

        if let Some(sep) = &self.join {
            if let Value::List(items) | Value::Args(items) = &value {
                value = Value::String(items.iter().map(text_of).collect::<Vec<_>>().join(sep));
            }
        }

        value
    }
}

fn map_scalars(value: Value, f: impl Fn(Value) -> Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::List(items) => Value::List(items.into_iter().map(&f).collect()),
        Value::Args(items) => Value::Args(items.into_iter().map(&f).collect()),
        other => f(other),
    }
}

fn compare(a: &Value, b: &Value, ignore_case: bool, numeric: bool) -> Ordering {
    if numeric {
        if let (Some(x), Some(y)) = (a.to_decimal(), b.to_decimal()) {
            return x.cmp(&y);
        }
    }
    let (x, y) = (text_of(a), text_of(b));
    if ignore_case {
        x.to_lowercase().cmp(&y.to_lowercase())
    } else {
        x.cmp(&y)
    }
}

/// Uppercase the first letter of every word, lowercase the rest.
fn capitalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut start = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            start = false;
        } else {
            out.push(c);
            start = true;
        }
    }
    out
}
