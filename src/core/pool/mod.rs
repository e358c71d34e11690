// src/core/pool/mod.rs

//! The worker thread pool: scheduling, per-worker registries and lifecycle.

pub(crate) mod registry;
mod scheduling;
mod thread_pool;
pub(crate) mod worker;

pub use registry::DeferReason;
pub use scheduling::least_loaded;
pub use thread_pool::{Assignment, ThreadPool, ThreadStartHook};
pub use worker::{DetachOutcome, Worker};
