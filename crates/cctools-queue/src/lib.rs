#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Master-side distributed task dispatch: the `Task`/`Queue` pair that a
//! driver program submits work through, and the wire-level plumbing
//! (`Transport`, `Catalog`, `WorkerSession`) that implement it.

pub mod cache;
pub mod queue;
pub mod task;
pub mod transport;
pub mod worker_session;

pub use cache::{Catalog, ContentId};
pub use queue::{Queue, QueueConfig, QueueError, QueueStats};
pub use task::{
    CachePolicy, FileDirection, FileSource, FileSpec, Task, TaskId, TaskResultKind, TaskTiming,
    MAX_COMMAND_LINE_BYTES,
};
pub use transport::{Transport, TransportError};
pub use worker_session::{SessionId, WorkerInfo};
