//! `workers` crate: the `Worker` trait and built-in worker implementations.
//!
//! Every backend that executes a target's command must implement [`Worker`].
//! The engine crate dispatches builds through this trait object.

pub mod error;
pub mod traits;
pub mod shell;
pub mod mock;

pub use error::WorkerError;
pub use shell::ShellWorker;
pub use traits::{Job, JobKind, Worker, WorkerOutput};
