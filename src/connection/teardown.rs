// src/connection/teardown.rs

//! The per-connection teardown seam and the best-effort release loop used by
//! both normal detach and the expiration sweep.

use super::record::ConnectionRecord;
use crate::core::errors::TeardownError;
use crate::core::metrics;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tracing::{trace, warn};

/// Releases whatever a session holds (sockets, event registrations, protocol
/// state). Called exactly once, when the record leaves its worker's registry.
pub trait Teardown: Send {
    fn teardown(self: Box<Self>, record: &ConnectionRecord) -> Result<(), TeardownError>;
}

impl<F> Teardown for F
where
    F: FnOnce(&ConnectionRecord) -> Result<(), TeardownError> + Send,
{
    fn teardown(self: Box<Self>, record: &ConnectionRecord) -> Result<(), TeardownError> {
        (*self)(record)
    }
}

/// A teardown that simply closes the sockets it owns.
#[derive(Debug, Default)]
pub struct CloseDescriptors {
    fds: Vec<OwnedFd>,
}

impl CloseDescriptors {
    pub fn new(fds: impl IntoIterator<Item = OwnedFd>) -> Self {
        Self {
            fds: fds.into_iter().collect(),
        }
    }
}

impl Teardown for CloseDescriptors {
    fn teardown(self: Box<Self>, record: &ConnectionRecord) -> Result<(), TeardownError> {
        trace!(
            "Closing {} descriptors for connection {}",
            self.fds.len(),
            record.id()
        );
        drop(self.fds);
        Ok(())
    }
}

/// Totals from one best-effort release pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Records whose teardown ran successfully.
    pub released: usize,
    /// Records whose teardown returned an error or panicked.
    pub failed: usize,
}

impl ReleaseReport {
    pub(crate) fn merge(&mut self, other: ReleaseReport) {
        self.released += other.released;
        self.failed += other.failed;
    }
}

/// Tears down every record in `records`. A failure on one record is logged
/// and counted, and the loop moves on to the next.
pub(crate) fn release_all(
    worker: usize,
    records: &[Arc<ConnectionRecord>],
    context: &str,
) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    for record in records {
        match record.release() {
            Ok(true) => report.released += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                metrics::TEARDOWN_FAILURES_TOTAL.inc();
                warn!(
                    "thr={} {}: failed to release connection {} ({}): {}",
                    worker,
                    context,
                    record.id(),
                    record.descriptors(),
                    e
                );
            }
        }
    }
    report
}
