//! Error type shared by every layer of the engine.
//!
//! ```text
//!   parser ──▶ SyntaxError ─┐
//!   glob   ──▶ PatternError ┤
//!   %(...) ──▶ ExpressionError ──▶ ShellError ──▶ Located { "script:3.7", .. }
//!   host   ──▶ anyhow::Error ┘                         (first tag wins)
//! ```
//!
//! `ShellError` is `Clone` so one failure can sit in a stage result, in the
//! `pipe-exception` variable and in the error returned to the embedder at
//! the same time.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::arithmetic::ExpressionError;
use crate::glob::PatternError;
use crate::lexer::SyntaxError;

#[derive(Debug, Clone, Error)]
pub enum ShellError {
    /// Malformed script. `SyntaxError::eof` marks input that ended early.
    #[error("{0}")]
    Syntax(#[from] SyntaxError),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// Misuse of an object in its current state, e.g. a finished job.
    #[error("{0}")]
    IllegalState(String),

    #[error("{0}")]
    IllegalArgument(String),

    /// `bad substitution`, `parameter not set` and friends.
    #[error("{0}")]
    Expansion(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Failure raised by a host callable.
    #[error("{0:#}")]
    Command(Arc<anyhow::Error>),

    #[error("{0}")]
    Runtime(String),

    /// Failures of the stages before the last one in a pipeline.
    #[error("Exception caught during pipe execution: {}", join_messages(.0))]
    PipeFailure(Vec<ShellError>),

    #[error("interrupted")]
    Interrupted,

    /// An error tagged with the `script:line.column` it was raised at.
    #[error("{error}")]
    Located { location: String, error: Box<ShellError> },
}

fn join_messages(errors: &[ShellError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl From<anyhow::Error> for ShellError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ShellError>() {
            Ok(shell) => shell,
            Err(other) => ShellError::Command(Arc::new(other)),
        }
    }
}

impl ShellError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ShellError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn expansion(message: impl Into<String>) -> Self {
        ShellError::Expansion(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ShellError::Runtime(message.into())
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        ShellError::IllegalState(message.into())
    }

    /// The error without its location tag.
    pub fn inner(&self) -> &ShellError {
        match self {
            ShellError::Located { error, .. } => error.inner(),
            other => other,
        }
    }

    /// Where the error was raised, if it has been tagged.
    pub fn location(&self) -> Option<&str> {
        match self {
            ShellError::Located { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Tag with `location` unless already tagged.
    pub fn located(self, location: impl FnOnce() -> String) -> Self {
        match self {
            located @ ShellError::Located { .. } => located,
            error => ShellError::Located {
                location: location(),
                error: Box::new(error),
            },
        }
    }

    /// Whether the script ended inside an open quote, group or heredoc, so
    /// an interactive caller can ask for more input.
    pub fn is_eof(&self) -> bool {
        matches!(self.inner(), ShellError::Syntax(e) if e.eof)
    }

    /// Short kind name used in stage diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self.inner() {
            ShellError::Syntax(e) if e.eof => "EOFError",
            ShellError::Syntax(_) => "SyntaxError",
            ShellError::CommandNotFound(_) => "CommandNotFoundError",
            ShellError::IllegalState(_) => "IllegalStateError",
            ShellError::IllegalArgument(_) => "IllegalArgumentError",
            ShellError::Expansion(_) => "ExpansionError",
            ShellError::Pattern(_) => "PatternError",
            ShellError::Expression(_) => "ExpressionError",
            ShellError::Io { .. } => "IOError",
            ShellError::Command(_) => "CommandError",
            ShellError::Runtime(_) => "RuntimeError",
            ShellError::PipeFailure(_) => "PipeFailure",
            ShellError::Interrupted => "Interrupted",
            ShellError::Located { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_location_wins() {
        let err = ShellError::CommandNotFound("foo".into())
            .located(|| "script:1.1".into())
            .located(|| "script:9.9".into());
        assert_eq!(err.location(), Some("script:1.1"));
        assert_eq!(err.to_string(), "Command not found: foo");
        assert_eq!(err.kind_name(), "CommandNotFoundError");
    }

    #[test]
    fn eof_looks_through_location() {
        let err = ShellError::from(SyntaxError::eof(1, 6, "unexpected EOT looking for '}'"));
        assert!(err.is_eof());
        assert!(err.located(|| "1.6".into()).is_eof());
        assert!(!ShellError::from(SyntaxError::new(1, 1, "unexpected '|'")).is_eof());
    }

    #[test]
    fn anyhow_round_trips_shell_errors() {
        let err: ShellError = anyhow::Error::new(ShellError::Interrupted).into();
        assert!(matches!(err, ShellError::Interrupted));

        let err: ShellError = anyhow::anyhow!("host failure").into();
        assert_eq!(err.kind_name(), "CommandError");
        assert_eq!(err.to_string(), "host failure");
    }

    #[test]
    fn pipe_failure_lists_causes() {
        let err = ShellError::PipeFailure(vec![
            ShellError::runtime("first"),
            ShellError::CommandNotFound("x".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "Exception caught during pipe execution: first; Command not found: x"
        );
    }
}
