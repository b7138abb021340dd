//! AST type definitions.

use std::fmt;
use std::sync::Arc;

use crate::lexer::Token;

/// A sequence of executables joined by `;`, newlines, `&&` and `||`.
///
/// Operators interleave executables: every element but the last carries the
/// operator that follows it, the last one carries `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Source text of the whole program (the body, for nested blocks).
    pub token: Token,
    pub items: Vec<(Executable, Option<Operator>)>,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Control operator between two executables of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `;` or newline: run the next one unconditionally.
    Sequence,
    /// `&&`: run the next one only if this one succeeded.
    And,
    /// `||`: run the next one only if this one failed.
    Or,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Sequence => write!(f, ";"),
            Operator::And => write!(f, "&&"),
            Operator::Or => write!(f, "||"),
        }
    }
}

/// One element of a program.
#[derive(Debug, Clone, PartialEq)]
pub enum Executable {
    /// A pipeline of two or more stages, or any `&`-terminated pipeline.
    Pipeline(Pipeline),
    /// A lone foreground statement.
    Statement(Arc<Statement>),
}

impl Executable {
    pub fn token(&self) -> &Token {
        match self {
            Executable::Pipeline(p) => &p.token,
            Executable::Statement(s) => &s.token,
        }
    }
}

/// Statements connected by `|` or `|&`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Text of the whole pipeline, used as the job's command.
    pub token: Token,
    pub stages: Vec<(Arc<Statement>, Option<PipeOperator>)>,
    /// Terminated by `&`.
    pub background: bool,
}

/// Operator between two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOperator {
    /// `|`: upstream output feeds downstream input.
    Pipe,
    /// `|&`: upstream output and error both feed downstream input.
    PipeAll,
}

impl fmt::Display for PipeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeOperator::Pipe => write!(f, "|"),
            PipeOperator::PipeAll => write!(f, "|&"),
        }
    }
}

/// Words of one command plus its redirections.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub token: Token,
    pub words: Vec<Word>,
    pub redirections: Vec<Redirection>,
}

impl Statement {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// A word of a statement or array literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Word {
    /// Plain text, expanded at run time.
    Text(Token),
    /// `{ ... }`: a deferred, reusable program.
    Closure(Block),
    /// `( ... )`: a program run in place, its result substituted.
    Sequence(Block),
    /// `[a b c]` or `[k=v ...]`.
    Array(ArrayLiteral),
}

impl Word {
    /// The source text covering the whole word.
    pub fn token(&self) -> &Token {
        match self {
            Word::Text(t) => t,
            Word::Closure(b) | Word::Sequence(b) => &b.token,
            Word::Array(a) => &a.token,
        }
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// A bracketed nested program.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// The literal including its brackets.
    pub token: Token,
    pub program: Arc<Program>,
}

/// A bracketed list or map literal.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLiteral {
    pub token: Token,
    pub items: ArrayItems,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayItems {
    List(Vec<Word>),
    Map(Vec<(Word, Word)>),
}

/// One redirection directive of a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Redirection {
    /// The operator as written, e.g. `2>>` or `<<-`.
    pub op: Token,
    pub kind: RedirectKind,
    /// File target, heredoc body or here-string word. `None` for `N>&M`.
    pub target: Option<Word>,
}

/// What a redirection does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `>`, `>>`, `N>`, `&>`, `&>>`. `both` redirects fd 1 and fd 2.
    Output { fd: u8, both: bool, append: bool },
    /// `N>&M`: make `fd` refer to the channel currently at `target`.
    Duplicate { fd: u8, target: u8 },
    /// `<`, `N<`, `<>`. `write` also opens the target for writing.
    Input { fd: u8, write: bool },
    /// `<<` and `<<-` (tabs stripped).
    HereDoc { strip_tabs: bool },
    /// `<<<`
    HereString,
}

impl fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectKind::Output { fd, both, append } => {
                if *both {
                    write!(f, "&")?;
                } else if *fd != 1 {
                    write!(f, "{fd}")?;
                }
                write!(f, "{}", if *append { ">>" } else { ">" })
            }
            RedirectKind::Duplicate { fd, target } => write!(f, "{fd}>&{target}"),
            RedirectKind::Input { fd, write } => {
                if *fd != 0 {
                    write!(f, "{fd}")?;
                }
                write!(f, "{}", if *write { "<>" } else { "<" })
            }
            RedirectKind::HereDoc { strip_tabs } => write!(f, "{}", if *strip_tabs { "<<-" } else { "<<" }),
            RedirectKind::HereString => write!(f, "<<<"),
        }
    }
}
