// src/connection/record.rs

//! Defines `ConnectionRecord`, the shared state of one proxied session.

use super::teardown::Teardown;
use crate::core::errors::TeardownError;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The identity of a connection. Descriptor numbers are reused by the OS, so
/// they are never used to tell two sessions apart.
pub type ConnId = Uuid;

bitflags! {
    /// End-of-stream state per direction. Only used for diagnostics here; the
    /// protocol logic owns the actual shutdown sequencing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct EofFlags: u8 {
        const SRC   = 1 << 0; // client -> proxy
        const E2SRC = 1 << 1; // proxy -> client
        const DST   = 1 << 2; // proxy -> destination
        const E2DST = 1 << 3; // destination -> proxy
        const DST2  = 1 << 4; // secondary destination of a child session
    }
}

impl fmt::Display for EofFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        f.write_str(&names.join(","))
    }
}

/// The socket descriptors belonging to a session, as seen by the protocol
/// logic. `None` means the socket is not open (yet, or any more).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptors {
    /// The accepted client socket.
    pub client: Option<RawFd>,
    /// The socket connected to the original destination.
    pub dest: Option<RawFd>,
    /// Source side of the secondary pair, for child sessions.
    pub child_src: Option<RawFd>,
    /// Destination side of the secondary pair, for child sessions.
    pub child_dst: Option<RawFd>,
}

impl Descriptors {
    pub fn pair(client: RawFd, dest: RawFd) -> Self {
        Self {
            client: Some(client),
            dest: Some(dest),
            ..Self::default()
        }
    }
}

fn fd_str(fd: Option<RawFd>) -> String {
    fd.map_or_else(|| "-".to_string(), |fd| fd.to_string())
}

impl fmt::Display for Descriptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fd={}/{} child_fd={}/{}",
            fd_str(self.client),
            fd_str(self.dest),
            fd_str(self.child_src),
            fd_str(self.child_dst)
        )
    }
}

/// One logical proxied session, shared between the acceptor, the protocol
/// logic and the owning worker through an `Arc`.
///
/// Parent/child relationships and registry membership live in the owning
/// worker's registry; the record only remembers the ids it needs to find them.
pub struct ConnectionRecord {
    id: ConnId,
    dest_addr: Option<SocketAddr>,
    created: Instant,
    access_time: Mutex<Instant>,
    descriptors: Mutex<Descriptors>,
    eof: AtomicU8,
    worker: OnceLock<usize>,
    parent: OnceLock<ConnId>,
    teardown: Mutex<Option<Box<dyn Teardown>>>,
}

impl ConnectionRecord {
    /// Creates a record with a fresh v4 UUID.
    pub fn new(descriptors: Descriptors, dest_addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            dest_addr,
            created: now,
            access_time: Mutex::new(now),
            descriptors: Mutex::new(descriptors),
            eof: AtomicU8::new(0),
            worker: OnceLock::new(),
            parent: OnceLock::new(),
            teardown: Mutex::new(None),
        }
    }

    /// Installs the callback that releases this session's resources once it
    /// leaves its worker's registry.
    pub fn with_teardown(self, teardown: impl Teardown + 'static) -> Self {
        *self.teardown.lock() = Some(Box::new(teardown));
        self
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn dest_addr(&self) -> Option<SocketAddr> {
        self.dest_addr
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// The index of the worker this record is pinned to, once attached.
    pub fn worker(&self) -> Option<usize> {
        self.worker.get().copied()
    }

    /// The id of the parent session, for child records.
    pub fn parent_id(&self) -> Option<ConnId> {
        self.parent.get().copied()
    }

    pub fn is_child(&self) -> bool {
        self.parent.get().is_some()
    }

    pub(crate) fn assign_worker(&self, worker: usize) {
        assert!(
            self.worker.set(worker).is_ok(),
            "connection {} is already attached to worker {:?}",
            self.id,
            self.worker.get()
        );
    }

    pub(crate) fn assign_parent(&self, parent: ConnId) {
        assert!(
            self.parent.set(parent).is_ok(),
            "connection {} already has a parent",
            self.id
        );
    }

    /// Records I/O activity. The access time never moves backwards.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let mut access_time = self.access_time.lock();
        if now > *access_time {
            *access_time = now;
        }
    }

    pub fn access_time(&self) -> Instant {
        *self.access_time.lock()
    }

    /// Time since the last recorded activity, saturating at zero.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.access_time())
    }

    pub fn descriptors(&self) -> Descriptors {
        *self.descriptors.lock()
    }

    pub fn update_descriptors(&self, f: impl FnOnce(&mut Descriptors)) {
        f(&mut self.descriptors.lock());
    }

    pub fn eof(&self) -> EofFlags {
        EofFlags::from_bits_truncate(self.eof.load(Ordering::Acquire))
    }

    pub fn mark_eof(&self, flags: EofFlags) {
        self.eof.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Whether the teardown callback has already run (or none was installed).
    pub fn is_released(&self) -> bool {
        self.teardown.lock().is_none()
    }

    /// Runs the teardown callback, at most once over the record's lifetime.
    ///
    /// Returns `Ok(false)` if there was nothing left to release. A panicking
    /// callback is reported as an error so the calling worker keeps running.
    pub(crate) fn release(&self) -> Result<bool, TeardownError> {
        // Taken out before running so the lock is not held across the callback.
        let teardown = self.teardown.lock().take();
        let Some(teardown) = teardown else {
            return Ok(false);
        };
        match catch_unwind(AssertUnwindSafe(|| teardown.teardown(self))) {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(TeardownError::Other(format!(
                "teardown callback for connection {} panicked",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("dest_addr", &self.dest_addr)
            .field("descriptors", &self.descriptors())
            .field("eof", &self.eof())
            .field("worker", &self.worker())
            .field("parent", &self.parent_id())
            .finish_non_exhaustive()
    }
}
