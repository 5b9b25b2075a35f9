//! Operation lifecycle: reducer, sharded table, deadline sweeper, and the
//! command runner that drives external processes.

pub mod machine;
mod runner;
mod sweeper;

pub use machine::{reduce, Builder, ProcessTable, Reduction};
pub use runner::{redact_command, CommandRunner, RunnerError};
pub use sweeper::{DeadlineSweeper, DeadlineSweeperHandle};
