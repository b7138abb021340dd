//! Pure data types for shoal: job identity and lifecycle.
//!
//! This crate is a leaf dependency with no async runtime, no parser, no I/O,
//! so front-ends can render job tables without pulling in the kernel.

pub mod job;

pub use job::*;
