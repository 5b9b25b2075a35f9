//! Foundation types for the operation engine.
//!
//! This module hides the representation of operation identity, lifecycle
//! events, and the immutable records the reducer produces. Everything here is
//! plain data; the concurrency machinery lives in [`crate::process`] and
//! [`crate::callback`].

mod error;
mod event;
mod record;
mod request;

pub use error::{Error, Result};
pub use event::{BoxError, CompletionHandle, CompletionSender, LifecycleEvent};
pub use record::{ProcessRecord, ProcessStatus, RejectedStart};
pub use request::{CorrelationId, RequestId};
