// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard that detaches a connection from
//! its worker when the protocol handler's scope is exited.

use super::record::ConnectionRecord;
use crate::core::pool::{DetachOutcome, Worker};
use std::sync::Arc;
use tracing::debug;

/// Detaches the guarded record when dropped, so an early return or an error
/// in the protocol handler cannot leak a load slot.
pub struct ConnectionGuard {
    /// The worker the record is attached to.
    worker: Arc<Worker>,
    /// The guarded connection.
    record: Arc<ConnectionRecord>,
    /// Set once the record has been detached explicitly.
    detached: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(worker: Arc<Worker>, record: Arc<ConnectionRecord>) -> Self {
        Self {
            worker,
            record,
            detached: false,
        }
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Detaches now and reports what happened, instead of waiting for drop.
    pub fn detach(mut self) -> DetachOutcome {
        self.detached = true;
        self.worker.detach(&self.record)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let outcome = self.worker.detach(&self.record);
        debug!(
            "ConnectionGuard dropping connection {} on thr={}: {:?}",
            self.record.id(),
            self.worker.index(),
            outcome
        );
    }
}
