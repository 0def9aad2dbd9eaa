//! Error taxonomy shared by the queue, worker, and drivers.

/// Errors that originate from core primitives (paths, codec, checkpoint log).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An XDG environment variable was set but empty, or `HOME` is unset.
    #[error("{0}")]
    BadEnv(String),

    /// A checkpoint or output log line did not parse.
    #[error("malformed log line: {0:?}")]
    MalformedLogLine(String),

    /// A compressed-sequence record did not parse.
    #[error("malformed sequence record: {0}")]
    MalformedSequence(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
