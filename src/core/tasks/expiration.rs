// src/core/tasks/expiration.rs

use crate::connection::{ConnectionRecord, ReleaseReport, release_all};
use crate::core::metrics;
use crate::core::pool::Worker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// The outcome of one sweep pass over a worker's registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle top-level sessions found.
    pub sessions: usize,
    /// Records unlinked from the registry, children included.
    pub records: usize,
    /// Teardown results for the unlinked records.
    pub release: ReleaseReport,
}

/// Reaps sessions that have been idle for longer than `expire_after`.
///
/// Runs on the owning worker's thread from its periodic timer. Expiration
/// ignores the parent/child pinning that governs `detach`: an idle session is
/// torn down together with all of its children.
pub struct ExpirationSweeper {
    worker: Arc<Worker>,
    expire_after: Duration,
}

impl ExpirationSweeper {
    pub fn new(worker: Arc<Worker>, expire_after: Duration) -> Self {
        Self {
            worker,
            expire_after,
        }
    }

    /// Performs a single pass as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let index = self.worker.index();

        // Collect and unlink under the lock; teardown happens after release.
        let (sessions, expired) = {
            let mut state = self.worker.lock_state();
            let roots = state.registry.collect_expired(now, self.expire_after);
            let mut expired: Vec<Arc<ConnectionRecord>> = Vec::new();
            let mut still_attached = 0;
            for root in &roots {
                for slot in state.registry.remove_subtree(root) {
                    if !slot.detached {
                        still_attached += 1;
                    }
                    expired.push(slot.record);
                }
            }
            state.decrement_load(still_attached);
            state.check_load();
            self.worker.publish_load(state.load);
            (roots.len(), expired)
        };

        if expired.is_empty() {
            return SweepReport::default();
        }

        debug!("thr={} expired connections: {}", index, expired.len());
        for record in &expired {
            trace!(
                "thr={} expired {} {} idle={}s",
                index,
                record.id(),
                record.descriptors(),
                record.idle_at(now).as_secs()
            );
        }

        let release = release_all(index, &expired, "expiration");
        metrics::CONNECTIONS_EXPIRED_TOTAL.inc_by(expired.len() as f64);
        SweepReport {
            sessions,
            records: expired.len(),
            release,
        }
    }
}
