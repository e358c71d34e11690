// src/connection/mod.rs

//! The per-connection side of the pool: the shared session record, the
//! teardown seam the protocol logic plugs into, and an RAII detach guard.

// Declare the private sub-modules of the `connection` module.
mod guard;
mod record;
mod teardown;

// Publicly re-export the primary types from the sub-modules.
pub use guard::ConnectionGuard;
pub use record::{ConnId, ConnectionRecord, Descriptors, EofFlags};
pub use teardown::{CloseDescriptors, ReleaseReport, Teardown};

pub(crate) use teardown::release_all;
