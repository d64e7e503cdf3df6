//! Core domain types for retrypool.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the workspace: the pool, the
//! configuration loader and the binary all speak in these types.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod backoff;
mod error;
mod ids;
mod policy;

pub use backoff::Backoff;
pub use error::{PolicyError, TaskError};
pub use ids::TaskId;
pub use policy::{ExecutionPolicy, RetryBudget, TaskTimeout};
