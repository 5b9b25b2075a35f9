//! Spawns external provisioning processes and streams their lifecycle into
//! the state machine.
//!
//! The runner submits execution to the [`ConcurrencyLimiter`] under the
//! owning tenant, so backpressure applies before anything is spawned. Output
//! is streamed line by line into the table as it is produced, not buffered
//! until exit. `Stop`/`Kill` are advisory: they record intent in the state
//! machine, then `Stop` delivers SIGTERM and escalates to SIGKILL after a
//! grace period, while `Kill` goes straight to SIGKILL. Either way the
//! outcome is only confirmed by the subsequent `Finish`/`Failed` event.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{LifecycleEvent, RequestId};
use crate::limiter::{ConcurrencyLimiter, LimiterError};

use super::machine::ProcessTable;

const REDACTION_MASK: &str = "********";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The command token vector was empty.
    #[error("empty command")]
    EmptyCommand,

    /// The limiter refused the submission.
    #[error("pool submission failed")]
    Pool(#[from] LimiterError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Per-operation termination signals: graceful and forceful are separate
/// tokens so a stop can escalate to a kill.
struct Termination {
    stop: CancellationToken,
    kill: CancellationToken,
}

/// Executes external commands on limiter-bound workers.
pub struct CommandRunner {
    limiter: Arc<ConcurrencyLimiter>,
    table: Arc<ProcessTable>,
    terminations: Arc<DashMap<RequestId, Termination>>,
    grace_period: Duration,
}

impl CommandRunner {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, table: Arc<ProcessTable>) -> Self {
        Self {
            limiter,
            table,
            terminations: Arc::new(DashMap::new()),
            grace_period: Duration::from_secs(10),
        }
    }

    /// Sets how long a stopped process gets to exit on SIGTERM before it is
    /// killed.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Submits the command for execution under the owning tenant.
    ///
    /// Blocks until the tenant's pool has a free slot (backpressure), then
    /// spawns the process on a worker. The caller must already have applied
    /// `Start` for this id; this method only drives the process itself.
    pub async fn run(&self, id: RequestId, command: Vec<String>) -> Result<()> {
        if command.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        let termination = Termination {
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
        };
        let stop = termination.stop.clone();
        let kill = termination.kill.clone();
        self.terminations.insert(id.clone(), termination);

        let table = Arc::clone(&self.table);
        let terminations = Arc::clone(&self.terminations);
        let grace_period = self.grace_period;
        let task_id = id.clone();

        self.limiter
            .submit(id.tenant(), async move {
                execute(&task_id, command, table, stop, kill, grace_period).await;
                terminations.remove(&task_id);
            })
            .await?;

        Ok(())
    }

    /// Records a graceful termination request. The process receives SIGTERM
    /// and is killed only if it outlives the grace period.
    pub fn stop(&self, id: &RequestId) {
        self.table.apply(id, LifecycleEvent::Stop);
        if let Some(termination) = self.terminations.get(id) {
            termination.stop.cancel();
        } else {
            debug!(id = %id, "stop requested for operation with no running process");
        }
    }

    /// Records a forceful termination request and kills the process
    /// immediately.
    pub fn kill(&self, id: &RequestId) {
        self.table.apply(id, LifecycleEvent::Kill);
        if let Some(termination) = self.terminations.get(id) {
            termination.kill.cancel();
        } else {
            debug!(id = %id, "kill requested for operation with no running process");
        }
    }
}

/// Drives one external process from spawn to terminal event.
async fn execute(
    id: &RequestId,
    command: Vec<String>,
    table: Arc<ProcessTable>,
    stop: CancellationToken,
    kill: CancellationToken,
    grace_period: Duration,
) {
    info!(id = %id, command = %redact_command(&command).join(" "), "spawning external process");

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(id = %id, error = %err, "failed to spawn external process");
            table.apply(id, LifecycleEvent::Failed);
            return;
        }
    };

    if let Some(pid) = child.id() {
        debug!(id = %id, pid, "external process spawned");
        table.set_pid(id, pid);
    }

    // Stream output as it is produced, in parallel with waiting for exit.
    let stdout_task = child.stdout.take().map(|out| {
        tokio::spawn(stream_lines(
            out,
            Arc::clone(&table),
            id.clone(),
            LifecycleEvent::StdOut as fn(String) -> LifecycleEvent,
        ))
    });
    let stderr_task = child.stderr.take().map(|err| {
        tokio::spawn(stream_lines(
            err,
            Arc::clone(&table),
            id.clone(),
            LifecycleEvent::StdErr as fn(String) -> LifecycleEvent,
        ))
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            info!(id = %id, "kill requested, killing external process");
            if let Err(err) = child.start_kill() {
                warn!(id = %id, error = %err, "failed to kill external process");
            }
            child.wait().await
        }
        _ = stop.cancelled() => {
            info!(id = %id, grace = ?grace_period, "stop requested, terminating external process");
            if let Err(err) = terminate(&mut child) {
                warn!(id = %id, error = %err, "failed to signal external process");
            }
            tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    info!(id = %id, "stop escalated to kill");
                    let _ = child.start_kill();
                    child.wait().await
                }
                _ = tokio::time::sleep(grace_period) => {
                    warn!(id = %id, "grace period elapsed, killing external process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    // Drain the output streams before emitting the terminal event so the
    // frozen record carries everything the process wrote.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            debug!(id = %id, code, "external process exited");
            table.apply(id, LifecycleEvent::Finish(code));
        }
        Err(err) => {
            warn!(id = %id, error = %err, "failed to collect external process exit");
            table.apply(id, LifecycleEvent::Failed);
        }
    }
}

/// Asks the process to exit: SIGTERM on unix, an outright kill elsewhere.
fn terminate(child: &mut tokio::process::Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

async fn stream_lines<R>(
    reader: R,
    table: Arc<ProcessTable>,
    id: RequestId,
    event: fn(String) -> LifecycleEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                table.apply(&id, event(line));
            }
            Ok(None) => break,
            Err(err) => {
                warn!(id = %id, error = %err, "output stream closed with error");
                break;
            }
        }
    }
}

/// Masks password-like material in a command line before logging.
///
/// Best-effort hygiene, not a security boundary: values of `key=value`
/// tokens whose key mentions a password or secret are masked, as is the
/// token following a password flag.
pub fn redact_command(command: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(command.len());
    let mut mask_next = false;

    for token in command {
        if mask_next {
            out.push(REDACTION_MASK.to_string());
            mask_next = false;
            continue;
        }

        let lower = token.to_ascii_lowercase();
        if let Some(eq) = token.find('=') {
            let key = &lower[..eq];
            if key.contains("password") || key.contains("secret") {
                out.push(format!("{}={}", &token[..eq], REDACTION_MASK));
                continue;
            }
        }
        if lower == "-p" || lower.trim_start_matches('-').contains("password") {
            mask_next = lower.starts_with('-');
        }
        out.push(token.clone());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProcessStatus;
    use std::time::Duration;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn harness() -> (CommandRunner, Arc<ProcessTable>) {
        let limiter = Arc::new(ConcurrencyLimiter::new(6, 5));
        let table = Arc::new(ProcessTable::new(Duration::from_secs(60)));
        (
            CommandRunner::new(limiter, Arc::clone(&table)),
            table,
        )
    }

    async fn wait_terminal(
        table: &ProcessTable,
        id: &RequestId,
    ) -> crate::core::ProcessRecord {
        for _ in 0..200 {
            if let Some(record) = table.snapshot(id) {
                if record.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operation never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_command_streams_output_and_completes() {
        let (runner, table) = harness();
        let command = cmd(&["/bin/sh", "-c", "echo one; echo two; echo warn >&2"]);
        let rid = RequestId::new("alice", &command);

        assert!(table.start(&rid, command.clone()));
        runner.run(rid.clone(), command).await.unwrap();

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Completed);
        assert_eq!(record.exit_code(), Some(0));
        assert_eq!(record.stdout(), "one\ntwo\n");
        assert_eq!(record.stderr(), "warn\n");
        assert!(record.pid().is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_captured_output() {
        let (runner, table) = harness();
        let command = cmd(&["/bin/sh", "-c", "echo broken >&2; exit 3"]);
        let rid = RequestId::new("alice", &command);

        table.start(&rid, command.clone());
        runner.run(rid.clone(), command).await.unwrap();

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Failed);
        assert_eq!(record.exit_code(), Some(3));
        assert_eq!(record.stderr(), "broken\n");
    }

    #[tokio::test]
    async fn spawn_failure_emits_failed() {
        let (runner, table) = harness();
        let command = cmd(&["/no/such/binary-operon-test"]);
        let rid = RequestId::new("alice", &command);

        table.start(&rid, command.clone());
        runner.run(rid.clone(), command).await.unwrap();

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Failed);
        assert_eq!(record.exit_code(), None);
    }

    #[tokio::test]
    async fn stop_delivers_sigterm_for_a_clean_exit() {
        let (runner, table) = harness();
        // The child honors SIGTERM and exits cleanly.
        let command = cmd(&["/bin/sh", "-c", "trap 'exit 0' TERM; sleep 5 & wait $!"]);
        let rid = RequestId::new("alice", &command);

        table.start(&rid, command.clone());
        runner.run(rid.clone(), command).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop(&rid);

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Completed);
        assert_eq!(record.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_the_grace_period() {
        let limiter = Arc::new(ConcurrencyLimiter::new(6, 5));
        let table = Arc::new(ProcessTable::new(Duration::from_secs(60)));
        let runner = CommandRunner::new(limiter, Arc::clone(&table))
            .with_grace_period(Duration::from_millis(200));

        // The child ignores SIGTERM; only the escalation ends it.
        let command = cmd(&["/bin/sh", "-c", "trap '' TERM; sleep 5 & wait $!"]);
        let rid = RequestId::new("alice", &command);

        table.start(&rid, command.clone());
        runner.run(rid.clone(), command).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop(&rid);

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Failed);
        // Signal death carries no exit code; the runner records -1.
        assert_eq!(record.exit_code(), Some(-1));
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_process() {
        let (runner, table) = harness();
        let command = cmd(&["/bin/sh", "-c", "sleep 30"]);
        let rid = RequestId::new("alice", &command);

        table.start(&rid, command.clone());
        runner.run(rid.clone(), command).await.unwrap();

        // Give the process time to spawn, then kill it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.kill(&rid);

        let record = wait_terminal(&table, &rid).await;
        assert_eq!(record.status(), ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let (runner, _table) = harness();
        let rid = RequestId::new("alice", &[]);
        assert!(matches!(
            runner.run(rid, Vec::new()).await,
            Err(RunnerError::EmptyCommand)
        ));
    }

    #[test]
    fn redaction_masks_password_material() {
        let command = cmd(&[
            "occi",
            "create",
            "--user",
            "admin",
            "--password",
            "hunter2",
            "endpoint.password=hunter2",
            "api_secret=abc",
            "--size",
            "m1",
        ]);

        let redacted = redact_command(&command);
        let line = redacted.join(" ");
        assert!(!line.contains("hunter2"));
        assert!(!line.contains("api_secret=abc"));
        assert!(line.contains("--user admin"));
        assert!(line.contains("--size m1"));
        assert!(line.contains("endpoint.password=********"));
    }

    #[test]
    fn redaction_leaves_plain_commands_untouched() {
        let command = cmd(&["occi", "describe", "vm-1"]);
        assert_eq!(redact_command(&command), command);
    }
}
