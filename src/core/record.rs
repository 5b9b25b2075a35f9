//! Immutable operation records and their status vocabulary.

use chrono::{DateTime, Utc};

use super::request::RequestId;

/// Status of a tracked external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Submitted, not yet picked up by a worker.
    Pending,
    /// The external process is running.
    Running,
    /// The process exited successfully but the authoritative business result
    /// is still pending via the callback path.
    AwaitingCallback,
    /// The operation completed successfully.
    Completed,
    /// The operation failed (spawn failure, non-zero exit, or delivery
    /// failure reported by the callback path).
    Failed,
    /// The operation's deadline passed without a terminal event.
    TimedOut,
}

impl ProcessStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "PENDING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::AwaitingCallback => "AWAITING_CALLBACK",
            ProcessStatus::Completed => "COMPLETED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::TimedOut => "TIMED_OUT",
        }
    }

    /// Returns true if no further lifecycle events can change this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::TimedOut
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ProcessStatus::Pending),
            "RUNNING" => Ok(ProcessStatus::Running),
            "AWAITING_CALLBACK" => Ok(ProcessStatus::AwaitingCallback),
            "COMPLETED" => Ok(ProcessStatus::Completed),
            "FAILED" => Ok(ProcessStatus::Failed),
            "TIMED_OUT" => Ok(ProcessStatus::TimedOut),
            _ => Err(format!("unknown process status: {}", s)),
        }
    }
}

/// A duplicate submission observed while the original operation was active.
///
/// Kept on the active operation's record as observability data; the original
/// operation itself is never mutated by a duplicate.
#[derive(Debug, Clone)]
pub struct RejectedStart {
    /// Command tokens of the rejected submission.
    pub command: Vec<String>,
    /// When the duplicate arrived.
    pub at: DateTime<Utc>,
}

/// Immutable snapshot of one external operation.
///
/// Produced by the reducer on terminal transitions, or on demand as a
/// partial snapshot while the operation is still running (progress polling).
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    id: RequestId,
    status: ProcessStatus,
    command: Vec<String>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    rejected: Vec<RejectedStart>,
}

impl ProcessRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: RequestId,
        status: ProcessStatus,
        command: Vec<String>,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        rejected: Vec<RejectedStart>,
    ) -> Self {
        Self {
            id,
            status,
            command,
            stdout,
            stderr,
            exit_code,
            pid,
            started_at,
            updated_at,
            rejected,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// The command tokens as submitted (unredacted).
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Accumulated standard output, one streamed line per row.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Accumulated standard error.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// OS process id, once the spawn succeeded.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Duplicate submissions rejected while this operation was active.
    pub fn rejected(&self) -> &[RejectedStart] {
        &self.rejected
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProcessStatus::Pending,
            ProcessStatus::Running,
            ProcessStatus::AwaitingCallback,
            ProcessStatus::Completed,
            ProcessStatus::Failed,
            ProcessStatus::TimedOut,
        ] {
            let parsed: ProcessStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }

        assert!("BOGUS".parse::<ProcessStatus>().is_err());
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(!ProcessStatus::AwaitingCallback.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::TimedOut.is_terminal());
    }
}
