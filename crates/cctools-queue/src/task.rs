//! The Task object: an immutable command/file-spec pair that accumulates a
//! mutable result as the queue dispatches and completes it.

use std::path::PathBuf;
use std::time::Duration;

/// Opaque task identity, assigned by the queue on submit.
pub type TaskId = u64;

/// The longest a `command_line` may be; longer commands are rejected at
/// submit without transferring anything (testable property 10).
pub const MAX_COMMAND_LINE_BYTES: usize = 4096;

/// Where a file spec's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Bytes are read from a local filesystem path.
    Path(PathBuf),
    /// Bytes are supplied in-memory (e.g. a generated command script).
    Buffer(Vec<u8>),
}

/// Direction of a file relative to the remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDirection {
    /// Staged onto the worker before the command runs.
    In,
    /// Collected from the worker after the command completes.
    Out,
}

/// Whether a file's content should be remembered in the worker's cache
/// catalog for reuse by later tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Reuse the resident copy if the catalog already has a matching entry.
    Cache,
    /// Always transfer; never record in the catalog.
    NoCache,
}

/// One file dependency or output of a task.
#[derive(Debug, Clone)]
pub struct FileSpec {
    /// Source of the bytes (for `In`) or destination path (for `Out`).
    pub local_source: FileSource,
    /// Name the worker presents the file under to the command.
    pub remote_name: String,
    /// Input or output.
    pub direction: FileDirection,
    /// Caching behavior for this file.
    pub cache_policy: CachePolicy,
}

/// Terminal classification of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResultKind {
    /// The remote command ran and a result was returned.
    Success,
    /// A locally-supplied input could not be read; never retried.
    InputMissing,
    /// The remote command exited non-zero.
    ExecFailed,
    /// An expected output file was absent after the command ran.
    OutputMissing,
    /// Fast-abort or explicit kill reclassified the task.
    Aborted,
}

/// Timing triple recorded for a completed attempt, in microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskTiming {
    /// Time the task was submitted to the queue.
    pub submit_micros: u64,
    /// Time dispatch to a worker began.
    pub start_micros: u64,
    /// Time the task reached a terminal state.
    pub finish_micros: u64,
    /// Total time spent transferring files for this attempt.
    pub total_transfer: Duration,
}

/// A task: immutable command/file specification, plus the mutable result
/// filled in once the queue has run it to completion.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    command_line: String,
    tag: String,
    files: Vec<FileSpec>,
    attempts: u32,
    return_status: Option<i32>,
    result: Option<TaskResultKind>,
    output: Vec<u8>,
    timing: TaskTiming,
}

impl Task {
    /// Create a new, unsubmitted task for `command_line`.
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            id: 0,
            command_line: command_line.into(),
            tag: String::new(),
            files: Vec::new(),
            attempts: 0,
            return_status: None,
            result: None,
            output: Vec::new(),
            timing: TaskTiming::default(),
        }
    }

    /// Attach a caller-chosen correlation tag (need not be unique).
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Declare a local file as a staged input.
    pub fn specify_input_file(
        &mut self,
        local_path: impl Into<PathBuf>,
        remote_name: impl Into<String>,
        cache_policy: CachePolicy,
    ) {
        self.files.push(FileSpec {
            local_source: FileSource::Path(local_path.into()),
            remote_name: remote_name.into(),
            direction: FileDirection::In,
            cache_policy,
        });
    }

    /// Declare an in-memory buffer as a staged input.
    pub fn specify_input_buffer(
        &mut self,
        bytes: Vec<u8>,
        remote_name: impl Into<String>,
        cache_policy: CachePolicy,
    ) {
        self.files.push(FileSpec {
            local_source: FileSource::Buffer(bytes),
            remote_name: remote_name.into(),
            direction: FileDirection::In,
            cache_policy,
        });
    }

    /// Declare a named output the worker must produce, collected to
    /// `local_path` on completion.
    pub fn specify_output_file(
        &mut self,
        local_path: impl Into<PathBuf>,
        remote_name: impl Into<String>,
    ) {
        self.files.push(FileSpec {
            local_source: FileSource::Path(local_path.into()),
            remote_name: remote_name.into(),
            direction: FileDirection::Out,
            cache_policy: CachePolicy::NoCache,
        });
    }

    /// Task identity, `0` until the queue assigns one on submit.
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    /// The command line that will run verbatim on the worker.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Caller-chosen correlation tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// File specs in the order they were declared.
    pub fn files(&self) -> &[FileSpec] {
        &self.files
    }

    /// Number of attempts made so far (starts at 0 before the first
    /// dispatch).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Exit code of the remote command; valid only in a terminal state.
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// Terminal classification of this attempt.
    pub fn result(&self) -> Option<TaskResultKind> {
        self.result
    }

    /// Merged standard output captured from the remote command.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Timing triple for the attempt that produced the current result.
    pub fn timing(&self) -> TaskTiming {
        self.timing
    }

    pub(crate) fn complete(
        &mut self,
        result: TaskResultKind,
        return_status: Option<i32>,
        output: Vec<u8>,
        timing: TaskTiming,
    ) {
        self.result = Some(result);
        self.return_status = return_status;
        self.output = output;
        self.timing = timing;
    }
}
