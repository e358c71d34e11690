// src/core/tasks/mod.rs

//! Periodic work run from each worker's event loop.

pub mod expiration;
