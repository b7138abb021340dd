//! Abstract syntax tree for shoal scripts.
//!
//! Every node keeps the [`Token`](crate::lexer::Token) it was parsed from, so
//! the executor can report `line.column` locations and rebuild command text
//! for job listings. Nested programs (closures and sequences) are shared
//! behind `Arc` so cloning a statement never deep-copies a block body.

mod types;

pub use types::*;
