// src/core/mod.rs

//! The central module containing the worker pool and its collaborators.

pub mod errors;
pub mod metrics;
pub mod pool;
pub mod resolver;
pub mod status;
pub mod tasks;
pub mod userdb;

pub use errors::{PoolError, TeardownError, UserDbError};
pub use pool::{Assignment, DetachOutcome, ThreadPool, Worker};
