//! The interpreter: values, word expansion and program execution.
//!
//! # Architecture
//!
//! - **Value**: what words expand to and commands return
//! - **Expander**: `$name`, `${...}`, `$(...)`, `%(...)` and quote removal
//! - **Closure executor**: runs programs, builds jobs for pipelines and
//!   dispatches statements to commands and methods
//! - **Format**: rendering values for the terminal
//!
//! Expansion needs to run programs (`$(...)`) and programs need expansion,
//! so the expander only sees the narrow [`Evaluate`] trait and the executor
//! implements it.

mod closure;
mod expand;
mod format;
mod methods;
mod value;

pub use closure::{Activation, Closure, DEFAULT_LOCK, LOCATION};
pub use expand::{expand, expand_quoted, needs_expansion, text_of, Evaluate};
pub use format::{format_value, FormatLevel};
pub use methods::invoke;
pub use value::Value;
