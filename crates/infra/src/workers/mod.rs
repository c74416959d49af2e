//! Background worker runtime.
//!
//! ## Design
//!
//! - Each worker is one tokio task owning its interval
//! - A tick error stops the run and is returned, never swallowed
//! - `Supervisor` restarts stopped workers with `RetryPolicy` backoff and
//!   hands the error back once the budget is spent
//! - Shutdown is cooperative and checked between ticks

pub mod error;
pub mod periodic;
pub mod supervisor;

pub use error::WorkerError;
pub use periodic::{PeriodicTask, WorkerHandle, WorkerStats};
pub use supervisor::Supervisor;
