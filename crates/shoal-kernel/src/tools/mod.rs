//! Callables and the registry that resolves command names.
//!
//! ```text
//! statement "grep foo"
//!    │ bareword
//!    ▼
//! session variable "grep"?  ──▶ Function
//!    │ no
//!    ▼
//! CommandRegistry::resolve("*:grep", SCOPE) ──▶ Function
//!    │ no
//!    ▼
//! "default" / "*:default" handler, called with "grep" prepended
//! ```

mod context;
mod registry;
mod traits;

pub use context::CallContext;
pub use registry::{CommandTable, FnCommand};
pub use traits::{CommandRegistry, Function, HostObject};
