#![deny(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared primitives used by every piece of the task execution substrate:
//! error types, XDG-style path helpers, the sequence compression codec, and
//! the append-only checkpoint log format driver programs use to skip
//! already-completed work on restart.

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod paths;

pub use error::CoreError;
