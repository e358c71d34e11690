// src/core/errors.rs

//! Defines the error types surfaced by the worker pool and its collaborators.

use std::io;
use thiserror::Error;

/// Failures that abort `ThreadPool::run`. Every variant names the worker slot
/// whose resource could not be set up, so the operator can tell which
/// allocation failed.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("failed to create event loop for worker {worker}: {source}")]
    EventLoop {
        worker: usize,
        #[source]
        source: io::Error,
    },

    #[error("user authentication is enabled but no user database was supplied")]
    MissingUserDb,

    #[error("failed to prepare user lookup for worker {worker}: {source}")]
    UserQuery {
        worker: usize,
        #[source]
        source: UserDbError,
    },

    #[error("failed to spawn thread for worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker {worker} exited before it started dispatching events")]
    NotReady { worker: usize },
}

/// Errors from the user-credentials store.
#[derive(Error, Debug)]
pub enum UserDbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no user lookup is prepared for this worker")]
    NotConfigured,
}

/// A failure while releasing the resources held by a single connection.
/// These are logged and counted, never propagated past the pool.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}
