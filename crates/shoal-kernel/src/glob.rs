//! Glob patterns for parameter expansion.
//!
//! Trims (`${x#pat}`, `${x%%pat}`) and replacements (`${x/pat/repl}`) take
//! shell-style patterns which are translated to regular expressions:
//!
//! - `*` matches zero or more characters (lazy when `shortest` is set)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]` match one character of a set; `[!abc]`/`[^abc]` negate
//! - `{a,b,c}` matches any of the alternatives (no nesting)
//! - `\c` matches `c` literally
//!
//! Nothing here touches the filesystem.

use regex::Regex;
use thiserror::Error;

/// A malformed glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Invalid range '{range}' at position {position} in pattern: {pattern}")]
    InvalidRange {
        range: String,
        position: usize,
        pattern: String,
    },
    #[error("Missing ']' in pattern: {0}")]
    MissingBracket(String),
    #[error("Missing '}}' in pattern: {0}")]
    MissingBrace(String),
    #[error("Cannot nest groups at position {position} in pattern: {pattern}")]
    NestedGroup { position: usize, pattern: String },
    #[error("No character to escape at end of pattern: {0}")]
    TrailingEscape(String),
    #[error("invalid pattern {pattern}: {message}")]
    Regex { pattern: String, message: String },
}

/// Translate a glob pattern into regular expression source (unanchored).
pub fn to_regex(pattern: &str, shortest: bool) -> Result<String, PatternError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut in_group = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => out.push_str(if shortest { ".*?" } else { ".*" }),
            '?' => out.push('.'),
            '[' => {
                i = translate_class(&chars, i, pattern, &mut out)?;
            }
            '{' => {
                if in_group {
                    return Err(PatternError::NestedGroup {
                        position: i,
                        pattern: pattern.to_string(),
                    });
                }
                in_group = true;
                out.push_str("(?:(?:");
            }
            ',' if in_group => out.push_str(")|(?:"),
            '}' if in_group => {
                in_group = false;
                out.push_str("))");
            }
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some(next) => push_literal(&mut out, *next),
                    None => return Err(PatternError::TrailingEscape(pattern.to_string())),
                }
            }
            other => push_literal(&mut out, other),
        }
        i += 1;
    }

    if in_group {
        return Err(PatternError::MissingBrace(pattern.to_string()));
    }
    Ok(out)
}

/// Translate the bracket class starting at `chars[start] == '['`.
/// Returns the index of the closing `]`.
fn translate_class(chars: &[char], start: usize, pattern: &str, out: &mut String) -> Result<usize, PatternError> {
    let mut i = start + 1;
    let negate = matches!(chars.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }

    // A `]` right after the opening bracket is a member, not the end.
    let mut members: Vec<char> = Vec::new();
    if chars.get(i) == Some(&']') {
        members.push(']');
        i += 1;
    }
    loop {
        match chars.get(i) {
            None => return Err(PatternError::MissingBracket(pattern.to_string())),
            Some(']') => break,
            Some('\\') => {
                i += 1;
                match chars.get(i) {
                    Some(c) => members.push(*c),
                    None => return Err(PatternError::TrailingEscape(pattern.to_string())),
                }
            }
            Some(c) => members.push(*c),
        }
        i += 1;
    }

    out.push('[');
    if negate {
        out.push('^');
    }
    let mut m = 0;
    while m < members.len() {
        let lo = members[m];
        if m + 2 < members.len() && members[m + 1] == '-' {
            let hi = members[m + 2];
            if lo > hi {
                return Err(PatternError::InvalidRange {
                    range: format!("{lo}-{hi}"),
                    position: start,
                    pattern: pattern.to_string(),
                });
            }
            push_literal(out, lo);
            out.push('-');
            push_literal(out, hi);
            m += 3;
        } else {
            push_literal(out, lo);
            m += 1;
        }
    }
    out.push(']');
    Ok(i)
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn compile(source: &str, pattern: &str) -> Result<Regex, PatternError> {
    Regex::new(source).map_err(|e| PatternError::Regex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    whole: Regex,
    search: Regex,
}

impl GlobPattern {
    /// Compile `pattern`. `shortest` makes `*` lazy when searching.
    pub fn new(pattern: &str, shortest: bool) -> Result<Self, PatternError> {
        let source = to_regex(pattern, shortest)?;
        Ok(Self {
            whole: compile(&format!("(?s)^(?:{source})$"), pattern)?,
            search: compile(&format!("(?s){source}"), pattern)?,
        })
    }

    /// Whether the pattern matches all of `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.whole.is_match(text)
    }

    /// Remove the shortest or longest matching prefix.
    pub fn trim_prefix<'a>(&self, text: &'a str, longest: bool) -> &'a str {
        let mut cuts: Vec<usize> = char_boundaries(text);
        if longest {
            cuts.reverse();
        }
        for cut in cuts {
            if self.matches(&text[..cut]) {
                return &text[cut..];
            }
        }
        text
    }

    /// Remove the shortest or longest matching suffix.
    pub fn trim_suffix<'a>(&self, text: &'a str, longest: bool) -> &'a str {
        let mut cuts: Vec<usize> = char_boundaries(text);
        if !longest {
            cuts.reverse();
        }
        for cut in cuts {
            if self.matches(&text[cut..]) {
                return &text[..cut];
            }
        }
        text
    }

    /// Replace the first (or every) match with `replacement`, taken literally.
    pub fn replace(&self, text: &str, replacement: &str, all: bool) -> String {
        let replacement = regex::NoExpand(replacement);
        if all {
            self.search.replace_all(text, replacement).into_owned()
        } else {
            self.search.replace(text, replacement).into_owned()
        }
    }
}

fn char_boundaries(text: &str) -> Vec<usize> {
    text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len())).collect()
}

/// Whether `text` matches the glob `pattern` in full.
pub fn glob_match(pattern: &str, text: &str) -> Result<bool, PatternError> {
    Ok(GlobPattern::new(pattern, false)?.matches(text))
}

/// Turn shell quoting into glob escapes: characters inside `'...'` or
/// `"..."` become literal, backslash escapes are kept.
pub fn unquote_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                out.push('\\');
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            (Some(_), _) => {
                if is_glob_meta(c) {
                    out.push('\\');
                }
                out.push(c);
            }
            (None, _) => out.push(c),
        }
    }
    out
}

fn is_glob_meta(c: char) -> bool {
    matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | ',' | '\\' | '!' | '^')
}
