//! Lifecycle events reduced into per-operation state.

use tokio::sync::oneshot;

use super::record::ProcessRecord;

/// A boxed error that can be sent across threads.
///
/// This is the standard error type used throughout async Rust ecosystems
/// (tokio, tower, axum, etc.). Any error implementing `std::error::Error`
/// can be automatically converted to this type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Sending half of an operation's completion handle.
///
/// Bound to a builder via [`LifecycleEvent::AttachHandle`] and resolved with
/// the frozen [`ProcessRecord`] on the terminal transition.
pub type CompletionSender = oneshot::Sender<ProcessRecord>;

/// Receiving half of an operation's completion handle, returned to the
/// caller that triggered the operation.
pub type CompletionHandle = oneshot::Receiver<ProcessRecord>;

/// One event in the lifecycle of an external operation.
///
/// Events are produced by the command runner (spawn, output, exit), by the
/// trigger path (`Start`, `AttachHandle`), by callers requesting termination
/// (`Stop`, `Kill`), and by the callback path once the authoritative business
/// result lands (`ResultDelivered`). The reducer in
/// [`crate::process::machine`] folds them into an immutable record.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// A new operation was submitted with the given command tokens.
    ///
    /// Against an id that is already active this never mutates the original
    /// operation; it is recorded on its rejected list instead.
    Start { command: Vec<String> },
    /// One line of standard output produced by the external process.
    StdOut(String),
    /// One line of standard error produced by the external process.
    StdErr(String),
    /// Graceful termination was requested. Intent only; the outcome is
    /// confirmed by a later `Finish` or `Failed`.
    Stop,
    /// Forceful termination was requested. Intent only, as with `Stop`.
    Kill,
    /// The external process exited with the given code.
    Finish(i32),
    /// The operation failed before or outside normal process exit
    /// (typically a spawn failure).
    Failed,
    /// The authoritative business result arrived via the callback path.
    ///
    /// Closes the awaiting-callback sub-state for operations whose process
    /// already exited successfully.
    ResultDelivered,
    /// Binds the externally visible completion handle to the operation,
    /// decoupling who asked from who reports.
    AttachHandle(CompletionSender),
}

impl LifecycleEvent {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            LifecycleEvent::Start { .. } => "start",
            LifecycleEvent::StdOut(_) => "stdout",
            LifecycleEvent::StdErr(_) => "stderr",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::Kill => "kill",
            LifecycleEvent::Finish(_) => "finish",
            LifecycleEvent::Failed => "failed",
            LifecycleEvent::ResultDelivered => "result_delivered",
            LifecycleEvent::AttachHandle(_) => "attach_handle",
        }
    }
}
