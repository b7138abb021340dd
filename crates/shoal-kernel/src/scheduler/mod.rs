//! Pipelines and job control.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Job  (Created → Foreground/Background/Suspended → Done)          │
//! │  ┌─────────┐  conduit  ┌─────────┐  conduit  ┌─────────┐         │
//! │  │ Stage 1 │──────────▶│ Stage 2 │──────────▶│ Stage 3 │──▶ fd 1 │
//! │  │ (task)  │  |  |&    │ (task)  │           │ (task)  │         │
//! │  └─────────┘           └─────────┘           └─────────┘         │
//! │       controller task: await all, pipe-exception, result, Done   │
//! └──────────────────────────────────────────────────────────────────┘
//!   every task runs on the session's WorkerPool under the job's
//!   cancellation token; Job::current() names the job of the running stage
//! ```

mod channel;
mod conduit;
mod job;
mod pipe;
mod pool;

pub use channel::{Channel, MemoryBuffer};
pub use conduit::{conduit, ConduitReader, ConduitWriter, DEFAULT_CAPACITY};
pub use job::{Job, JobListener, StageResult, PIPE_EXCEPTION};
pub use pipe::StageFrame;
pub use pool::WorkerPool;

pub(crate) use pipe::Stage;

/// Descriptor slots per stage.
pub const MAX_FD: usize = 10;
