//! Per-operation state machine: a pure reducer plus a sharded table.
//!
//! The reducer [`reduce`] is a pure function `(prior state, event, now) ->
//! new state`, which keeps the transition logic unit-testable without any
//! concurrency harness. The [`ProcessTable`] applies it per [`RequestId`]
//! through a `DashMap`, so each key has a single active writer (the shard
//! entry is held for the whole reduction) while independent keys reduce
//! fully in parallel.
//!
//! Builders that pass their deadline without a terminal event are
//! force-completed as `TimedOut` and evicted, bounding retained state even
//! if the spawned process never reports back. Eviction happens both lazily
//! on access and actively via [`crate::process::DeadlineSweeper`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::core::{
    CompletionSender, LifecycleEvent, ProcessRecord, ProcessStatus, RejectedStart, RequestId,
};

/// Mutable accumulator for one active operation.
///
/// Owned by the table; frozen into an immutable [`ProcessRecord`] on the
/// terminal transition.
#[derive(Debug)]
pub struct Builder {
    id: RequestId,
    status: ProcessStatus,
    command: Vec<String>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    rejected: Vec<RejectedStart>,
    handle: Option<CompletionSender>,
    callback_armed: bool,
    stop_requested: bool,
    kill_requested: bool,
}

impl Builder {
    fn new(id: RequestId, command: Vec<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id,
            status: ProcessStatus::Pending,
            command,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            pid: None,
            started_at: now,
            updated_at: now,
            deadline: deadline_after(now, ttl),
            rejected: Vec::new(),
            handle: None,
            callback_armed: false,
            stop_requested: false,
            kill_requested: false,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True if a `Stop` or `Kill` intent has been recorded.
    pub fn termination_requested(&self) -> bool {
        self.stop_requested || self.kill_requested
    }

    /// Partial snapshot of the current state, readable before termination.
    pub fn snapshot(&self) -> ProcessRecord {
        ProcessRecord::new(
            self.id.clone(),
            self.status,
            self.command.clone(),
            self.stdout.clone(),
            self.stderr.clone(),
            self.exit_code,
            self.pid,
            self.started_at,
            self.updated_at,
            self.rejected.clone(),
        )
    }

    /// Consumes the builder into a terminal record plus the handle to
    /// resolve, if one was attached.
    fn freeze(
        mut self,
        status: ProcessStatus,
        now: DateTime<Utc>,
    ) -> (ProcessRecord, Option<CompletionSender>) {
        self.status = status;
        self.updated_at = now;
        let handle = self.handle.take();
        (self.snapshot(), handle)
    }
}

fn deadline_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Outcome of one reduction step.
#[derive(Debug)]
pub struct Reduction {
    /// The surviving builder state, if the operation is still active.
    pub next: Option<Builder>,
    /// The immutable record frozen by a terminal transition.
    pub frozen: Option<ProcessRecord>,
    /// The completion handle to resolve with `frozen`, if one was attached.
    pub resolve: Option<CompletionSender>,
    /// True if the event was a duplicate `Start` against an active builder.
    pub rejected: bool,
}

impl Reduction {
    fn active(builder: Builder) -> Self {
        Self {
            next: Some(builder),
            frozen: None,
            resolve: None,
            rejected: false,
        }
    }

    fn terminal(record: ProcessRecord, resolve: Option<CompletionSender>) -> Self {
        Self {
            next: None,
            frozen: Some(record),
            resolve,
            rejected: false,
        }
    }

    fn empty() -> Self {
        Self {
            next: None,
            frozen: None,
            resolve: None,
            rejected: false,
        }
    }
}

/// Pure per-key reducer.
///
/// Folds one [`LifecycleEvent`] into the prior builder state for `id` and
/// returns the new state together with any terminal record produced.
/// Resolving the completion handle is returned as data (`resolve`) rather
/// than performed here, so the function stays free of side effects.
pub fn reduce(
    id: &RequestId,
    prior: Option<Builder>,
    event: LifecycleEvent,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Reduction {
    match (prior, event) {
        // First Start for this key creates the builder.
        (None, LifecycleEvent::Start { command }) => {
            Reduction::active(Builder::new(id.clone(), command, now, ttl))
        }
        // Duplicate Start: never mutates the original beyond its rejected
        // list, never creates new state.
        (Some(mut builder), LifecycleEvent::Start { command }) => {
            builder.rejected.push(RejectedStart { command, at: now });
            Reduction {
                next: Some(builder),
                frozen: None,
                resolve: None,
                rejected: true,
            }
        }
        (Some(mut builder), LifecycleEvent::StdOut(chunk)) => {
            builder.stdout.push_str(&chunk);
            builder.stdout.push('\n');
            builder.updated_at = now;
            Reduction::active(builder)
        }
        (Some(mut builder), LifecycleEvent::StdErr(chunk)) => {
            builder.stderr.push_str(&chunk);
            builder.stderr.push('\n');
            builder.updated_at = now;
            Reduction::active(builder)
        }
        (Some(mut builder), LifecycleEvent::Stop) => {
            builder.stop_requested = true;
            builder.updated_at = now;
            Reduction::active(builder)
        }
        (Some(mut builder), LifecycleEvent::Kill) => {
            builder.kill_requested = true;
            builder.updated_at = now;
            Reduction::active(builder)
        }
        (Some(mut builder), LifecycleEvent::AttachHandle(sender)) => {
            builder.handle = Some(sender);
            Reduction::active(builder)
        }
        (Some(mut builder), LifecycleEvent::Finish(code)) => {
            // A callback-armed operation that exited cleanly is not done yet:
            // the authoritative result still has to arrive as a file.
            if code == 0 && builder.callback_armed {
                builder.status = ProcessStatus::AwaitingCallback;
                builder.exit_code = Some(code);
                builder.updated_at = now;
                return Reduction::active(builder);
            }
            builder.exit_code = Some(code);
            let status = if code == 0 {
                ProcessStatus::Completed
            } else {
                ProcessStatus::Failed
            };
            let (record, resolve) = builder.freeze(status, now);
            Reduction::terminal(record, resolve)
        }
        (Some(builder), LifecycleEvent::Failed) => {
            let (record, resolve) = builder.freeze(ProcessStatus::Failed, now);
            Reduction::terminal(record, resolve)
        }
        (Some(builder), LifecycleEvent::ResultDelivered) => {
            let (record, resolve) = builder.freeze(ProcessStatus::Completed, now);
            Reduction::terminal(record, resolve)
        }
        // Events against a key with no active builder are dropped; the
        // operation either never started or already reached a terminal state.
        (None, event) => {
            debug!(event = event.tag(), "event against inactive key dropped");
            Reduction::empty()
        }
    }
}

/// Concurrent table of active builders plus finished records.
///
/// Delivery is serialized per key: `apply` holds the shard entry for the
/// whole reduction, so there is exactly one active writer per [`RequestId`].
pub struct ProcessTable {
    active: DashMap<RequestId, Option<Builder>>,
    finished: DashMap<RequestId, ProcessRecord>,
    ttl: Duration,
}

impl ProcessTable {
    /// Creates a table whose builders expire `ttl` after their `Start`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            active: DashMap::new(),
            finished: DashMap::new(),
            ttl,
        }
    }

    /// Applies `Start` for a new operation.
    ///
    /// Returns true if the start was accepted and a builder created; false if
    /// an active builder already exists for this id, in which case the
    /// duplicate is recorded on it and the original is untouched.
    pub fn start(&self, id: &RequestId, command: Vec<String>) -> bool {
        let now = Utc::now();
        self.evict_if_overdue(id, now);

        let mut slot = self.active.entry(id.clone()).or_default();
        let reduction = reduce(
            id,
            slot.take(),
            LifecycleEvent::Start { command },
            now,
            self.ttl,
        );
        *slot = reduction.next;
        if reduction.rejected {
            warn!(id = %id, "duplicate submission rejected");
        } else {
            info!(id = %id, "operation started");
        }
        !reduction.rejected
    }

    /// Applies one lifecycle event to the operation's builder.
    ///
    /// Returns the frozen record if the event was terminal. Events against
    /// unknown or already-finished ids are dropped.
    pub fn apply(&self, id: &RequestId, event: LifecycleEvent) -> Option<ProcessRecord> {
        let now = Utc::now();
        self.evict_if_overdue(id, now);

        let (frozen, resolve) = if matches!(event, LifecycleEvent::Start { .. }) {
            // Only Start may create a slot.
            let mut slot = self.active.entry(id.clone()).or_default();
            let reduction = reduce(id, slot.take(), event, now, self.ttl);
            *slot = reduction.next;
            (reduction.frozen, reduction.resolve)
        } else {
            match self.active.get_mut(id) {
                Some(mut slot) => {
                    let reduction = reduce(id, slot.take(), event, now, self.ttl);
                    *slot = reduction.next;
                    (reduction.frozen, reduction.resolve)
                }
                // Unknown key: reduce for the drop logging, allocate nothing.
                None => {
                    let reduction = reduce(id, None, event, now, self.ttl);
                    (reduction.frozen, reduction.resolve)
                }
            }
        };

        if frozen.is_some() {
            // A terminal event leaves an empty slot behind; drop it now
            // rather than waiting for the next sweep.
            self.active.remove_if(id, |_, slot| slot.is_none());
        }

        self.settle(id, frozen, resolve)
    }

    /// Marks the operation as expecting an asynchronous business result,
    /// so a clean process exit parks it in `AwaitingCallback` instead of
    /// completing it.
    pub fn arm_callback(&self, id: &RequestId) {
        if let Some(mut slot) = self.active.get_mut(id) {
            if let Some(builder) = slot.as_mut() {
                builder.callback_armed = true;
            }
        }
    }

    /// Records the OS process id once the spawn succeeded, promoting the
    /// operation from `Pending` to `Running`.
    pub fn set_pid(&self, id: &RequestId, pid: u32) {
        if let Some(mut slot) = self.active.get_mut(id) {
            if let Some(builder) = slot.as_mut() {
                builder.pid = Some(pid);
                if builder.status == ProcessStatus::Pending {
                    builder.status = ProcessStatus::Running;
                }
                builder.updated_at = Utc::now();
            }
        }
    }

    /// Snapshot of the operation: partial while running, terminal afterward.
    ///
    /// Overdue builders are evicted on access, so a timed-out operation is
    /// never observable as `Running` here.
    pub fn snapshot(&self, id: &RequestId) -> Option<ProcessRecord> {
        let now = Utc::now();
        self.evict_if_overdue(id, now);

        if let Some(slot) = self.active.get(id) {
            if let Some(builder) = slot.as_ref() {
                return Some(builder.snapshot());
            }
        }
        self.finished.get(id).map(|entry| entry.value().clone())
    }

    /// True if an active (non-terminal, non-expired) builder exists.
    pub fn is_active(&self, id: &RequestId) -> bool {
        self.evict_if_overdue(id, Utc::now());
        self.active
            .get(id)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Force-completes the operation as `TimedOut` regardless of deadline.
    ///
    /// Used by the callback path when the correlated result file never
    /// arrived within the watcher's timeout.
    pub fn force_timeout(&self, id: &RequestId) -> Option<ProcessRecord> {
        let now = Utc::now();
        let taken = self
            .active
            .get_mut(id)
            .and_then(|mut slot| slot.take());
        let builder = taken?;
        self.active.remove_if(id, |_, slot| slot.is_none());
        let (record, resolve) = builder.freeze(ProcessStatus::TimedOut, now);
        self.settle(id, Some(record), resolve)
    }

    /// Evicts every builder whose deadline has passed, freezing each as
    /// `TimedOut`. Returns the evicted records.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ProcessRecord> {
        let mut expired = Vec::new();
        for mut entry in self.active.iter_mut() {
            let overdue = entry
                .value()
                .as_ref()
                .map(|b| b.deadline <= now)
                .unwrap_or(false);
            if overdue {
                if let Some(builder) = entry.value_mut().take() {
                    expired.push(builder);
                }
            }
        }
        // Drop the empty slots left behind by evictions and terminal events.
        self.active.retain(|_, slot| slot.is_some());

        let mut records = Vec::with_capacity(expired.len());
        for builder in expired {
            let id = builder.id.clone();
            warn!(id = %id, "operation deadline passed, evicting as timed out");
            let (record, resolve) = builder.freeze(ProcessStatus::TimedOut, now);
            if let Some(record) = self.settle(&id, Some(record), resolve) {
                records.push(record);
            }
        }
        records
    }

    /// Number of currently active builders.
    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| entry.value().is_some())
            .count()
    }

    /// Removes finished records older than `older_than`. Returns the count.
    pub fn cleanup_finished(&self, older_than: Duration) -> u64 {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut deleted = 0u64;
        self.finished.retain(|_, record| {
            if record.updated_at() < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        deleted
    }

    fn evict_if_overdue(&self, id: &RequestId, now: DateTime<Utc>) {
        let taken = match self.active.get_mut(id) {
            Some(mut slot) => {
                let overdue = slot
                    .as_ref()
                    .map(|b| b.deadline <= now)
                    .unwrap_or(false);
                if overdue {
                    slot.take()
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(builder) = taken {
            warn!(id = %id, "operation deadline passed, evicting as timed out");
            self.active.remove_if(id, |_, slot| slot.is_none());
            let (record, resolve) = builder.freeze(ProcessStatus::TimedOut, now);
            self.settle(id, Some(record), resolve);
        }
    }

    /// Stores a frozen record and resolves the attached handle with it.
    fn settle(
        &self,
        id: &RequestId,
        frozen: Option<ProcessRecord>,
        resolve: Option<CompletionSender>,
    ) -> Option<ProcessRecord> {
        let record = frozen?;
        info!(id = %id, status = %record.status(), "operation reached terminal state");
        self.finished.insert(id.clone(), record.clone());
        if let Some(sender) = resolve {
            // The receiver may have been dropped; that only means nobody is
            // waiting on the handle anymore.
            let _ = sender.send(record.clone());
        }
        Some(record)
    }
}
