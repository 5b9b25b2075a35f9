//! Operon: Asynchronous Infrastructure-Operation Engine
//!
//! `operon` drives long-running external provisioning processes (VM
//! creation, teardown, image registration) and tracks each one from
//! submission to a terminal state. External processes rarely carry the
//! authoritative business result; that result arrives later as a file
//! written by an out-of-band script, correlated back by a token embedded in
//! its name.
//!
//! # Features
//!
//! - **Bounded concurrency**: Per-tenant and global pools with backpressure
//!   at submission, resizable at runtime
//! - **Event-sourced lifecycle**: A pure reducer folds process events into
//!   immutable records, serialized per operation key
//! - **Asynchronous result correlation**: Watchers poll for correlated
//!   result files, with write-stability detection before reading
//! - **Durable watchers**: Every armed watcher is mirrored to disk and
//!   restored after a restart with its remaining timeout
//! - **Self-bounding state**: Operations that never report back are evicted
//!   as timed out by deadline, lazily and by background sweep
//!
//! # Quick Start
//!
//! ```no_run
//! use operon::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default());
//!
//!     let trigger = engine
//!         .trigger(
//!             "alice",
//!             vec!["occi".into(), "create".into(), "--size".into(), "m1".into()],
//!             None,
//!         )
//!         .await?;
//!
//!     let record = trigger.handle.await?;
//!     println!("{} finished: {}", trigger.request_id, record.status());
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: Operation identity, lifecycle events, immutable records
//! - [`limiter`]: Two-level semaphore pools (hides admission strategy)
//! - [`process`]: Reducer, table, sweeper, and the command runner
//! - [`callback`]: Result-file watchers, durable records, restoration
//! - [`config`]: Engine tunables
//! - [`engine`]: The service object wiring it all together

pub mod callback;
pub mod config;
pub mod core;
pub mod engine;
pub mod limiter;
pub mod process;

pub use callback::{
    CallbackHandler, CallbackRecord, CallbackRegistry, HandlerFactory, RestoreCoordinator,
};
pub use config::EngineConfig;
pub use core::{
    CompletionHandle, CorrelationId, LifecycleEvent, ProcessRecord, ProcessStatus, RequestId,
};
pub use engine::{CallbackSpec, Engine, EngineError, Trigger};
pub use limiter::{ConcurrencyLimiter, PoolScope};
pub use process::ProcessTable;
