//! shoal-kernel: an embeddable shell-like command engine.
//!
//! This crate provides:
//!
//! - **Lexer / Parser**: programs, pipelines, statements, words, redirections
//! - **AST**: type definitions for parsed programs
//! - **Arithmetic**: `%(...)` expressions over arbitrary-precision decimals
//! - **Glob**: shell patterns for `${x#pat}`-style trimming and replacement
//! - **Interpreter**: values, word expansion and the closure executor
//! - **Scheduler**: conduits, channels, pipeline stages and job control
//! - **Tools**: callable traits and the command registry
//! - **Session**: variables, standard streams and the live job table
//!
//! ```no_run
//! use shoal_kernel::{Session, SessionConfig, Value};
//!
//! # async fn demo() -> Result<(), shoal_kernel::ShellError> {
//! let session = Session::new(SessionConfig::default());
//! let value = session.execute("x = %(1 + 2); $x").await?;
//! assert_eq!(value, Value::Int(3));
//! # Ok(())
//! # }
//! ```

pub mod arithmetic;
pub mod ast;
pub mod error;
pub mod glob;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod tools;

pub use error::ShellError;
pub use interpreter::{Closure, FormatLevel, Value};
pub use session::{Session, SessionBuilder, SessionConfig, WeakSession};
pub use tools::{CallContext, CommandRegistry, CommandTable, Function, HostObject};

// ═══════════════════════════════════════════════════════════════════════════
// Embedding Conveniences
// ═══════════════════════════════════════════════════════════════════════════

// Job control (for embedders rendering job tables or wiring fg/bg)
pub use scheduler::{Channel, Job, JobListener, MemoryBuffer, StageResult, PIPE_EXCEPTION};
pub use shoal_types::{JobId, JobInfo, JobStatus};
