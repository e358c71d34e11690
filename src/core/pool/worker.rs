// src/core/pool/worker.rs

//! A single connection-handling worker: its shared state, its thread entry
//! point and the event loop it runs.

use super::registry::{DeferReason, Detached, Registry};
use super::thread_pool::ThreadStartHook;
use crate::config::PoolConfig;
use crate::connection::{ConnId, ConnectionRecord, ReleaseReport, release_all};
use crate::core::errors::UserDbError;
use crate::core::metrics;
use crate::core::resolver::DnsResolver;
use crate::core::status::WorkerStatus;
use crate::core::tasks::expiration::ExpirationSweeper;
use crate::core::userdb::{UserLookup, UserRecord};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{broadcast, oneshot};
use tracing::{Level, debug, info, trace};

/// What happened to a record handed to `detach`/`detach_child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The record (and possibly finished relatives it was pinning) left the
    /// registry and was torn down.
    Removed(ReleaseReport),
    /// The load slot was freed but the record stays registered.
    Deferred(DeferReason),
    /// The record was detached before; nothing changed.
    AlreadyDetached,
    /// The record is no longer registered, typically because the expiration
    /// sweep got to it first. Nothing changed.
    NotFound,
}

/// State guarded by the worker's mutex. The load counter and the registry are
/// only ever mutated together, under this lock.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    pub(crate) load: usize,
    pub(crate) registry: Registry,
}

impl WorkerState {
    pub(crate) fn decrement_load(&mut self, by: usize) {
        debug_assert!(self.load >= by, "worker load underflow");
        self.load = self.load.saturating_sub(by);
    }

    pub(crate) fn check_load(&self) {
        debug_assert_eq!(
            self.load,
            self.registry.attached_count(),
            "worker load out of sync with its registry"
        );
    }
}

/// One worker of the pool. Shared through an `Arc` between the pool, the
/// worker's own thread and any `ConnectionGuard`s handed out for it.
pub struct Worker {
    index: usize,
    state: Mutex<WorkerState>,
    running: AtomicBool,
    event_loop: Handle,
    resolver: Mutex<Option<Arc<DnsResolver>>>,
    user_lookup: Mutex<Option<Box<dyn UserLookup>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("load", &self.load())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        event_loop: Handle,
        resolver: Option<Arc<DnsResolver>>,
        user_lookup: Option<Box<dyn UserLookup>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            index,
            state: Mutex::new(WorkerState::default()),
            running: AtomicBool::new(false),
            event_loop,
            resolver: Mutex::new(resolver),
            user_lookup: Mutex::new(user_lookup),
            shutdown_tx,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The number of attached (not yet detached) connections, children included.
    pub fn load(&self) -> usize {
        self.state.lock().load
    }

    /// The number of records in the registry, including detached records
    /// that are still pinned by relatives.
    pub fn registered(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.state.lock().registry.contains(id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The event loop connections on this worker register their I/O with.
    pub fn event_loop(&self) -> &Handle {
        &self.event_loop
    }

    pub fn resolver(&self) -> Option<Arc<DnsResolver>> {
        self.resolver.lock().clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock()
    }

    pub(crate) fn publish_load(&self, load: usize) {
        metrics::WORKER_LOAD
            .with_label_values(&[&self.index.to_string()])
            .set(load as f64);
    }

    pub(crate) fn attach_root(&self, record: &Arc<ConnectionRecord>) {
        let mut state = self.state.lock();
        record.assign_worker(self.index);
        state.load += 1;
        state.registry.insert_root(record.clone());
        state.check_load();
        metrics::CONNECTIONS_ATTACHED_TOTAL.inc();
        self.publish_load(state.load);
    }

    pub(crate) fn attach_child(&self, child: &Arc<ConnectionRecord>, parent: ConnId) {
        let mut state = self.state.lock();
        child.assign_worker(self.index);
        child.assign_parent(parent);
        state.load += 1;
        let linked = state.registry.insert_child(child.clone(), parent);
        state.check_load();
        metrics::CONNECTIONS_ATTACHED_TOTAL.inc();
        self.publish_load(state.load);
        drop(state);

        if linked {
            trace!(
                "thr={} attached child {} under parent {}",
                self.index,
                child.id(),
                parent
            );
        } else {
            debug!(
                "thr={} parent {} is gone, child {} registered as top-level",
                self.index,
                parent,
                child.id()
            );
        }
    }

    /// Frees the record's load slot and unlinks it from the registry unless a
    /// live relative still pins it. Records that do leave the registry are
    /// torn down after the lock is released.
    pub fn detach(&self, record: &ConnectionRecord) -> DetachOutcome {
        let id = record.id();
        if tracing::enabled!(Level::TRACE) {
            trace!("thr={} before detach of {}:\n{}", self.index, id, self.status());
        }

        let detached = {
            let mut state = self.state.lock();
            let detached = state.registry.detach(&id);
            if matches!(detached, Detached::Removed(_) | Detached::Deferred(_)) {
                state.decrement_load(1);
                metrics::CONNECTIONS_DETACHED_TOTAL.inc();
            }
            state.check_load();
            self.publish_load(state.load);
            detached
        };

        let outcome = match detached {
            Detached::Removed(records) => {
                DetachOutcome::Removed(release_all(self.index, &records, "detach"))
            }
            Detached::Deferred(reason) => {
                let what = if record.is_child() { "child" } else { "parent" };
                match reason {
                    DeferReason::HasChildren => debug!(
                        "thr={} {} {} has 1+ active child, will not remove from the registry ({})",
                        self.index,
                        what,
                        id,
                        record.descriptors()
                    ),
                    DeferReason::HasParent => debug!(
                        "thr={} child {} has an active parent, will not remove from the registry ({})",
                        self.index,
                        id,
                        record.descriptors()
                    ),
                }
                DetachOutcome::Deferred(reason)
            }
            Detached::AlreadyDetached => {
                debug!("thr={} connection {} was already detached", self.index, id);
                DetachOutcome::AlreadyDetached
            }
            Detached::NotFound => {
                debug!(
                    "thr={} connection {} not in registry (already removed)",
                    self.index, id
                );
                DetachOutcome::NotFound
            }
        };

        if tracing::enabled!(Level::TRACE) {
            trace!("thr={} after detach of {}:\n{}", self.index, id, self.status());
        }
        outcome
    }

    /// Looks up the user bound to `ip` with this worker's prepared query.
    pub fn lookup_user(&self, ip: IpAddr) -> Result<Option<UserRecord>, UserDbError> {
        let mut lookup = self.user_lookup.lock();
        match lookup.as_mut() {
            Some(lookup) => lookup.lookup(ip),
            None => Err(UserDbError::NotConfigured),
        }
    }

    pub fn has_user_lookup(&self) -> bool {
        self.user_lookup.lock().is_some()
    }

    /// A point-in-time diagnostic snapshot of this worker.
    pub fn status(&self) -> WorkerStatus {
        let now = Instant::now();
        let state = self.state.lock();
        WorkerStatus::capture(self.index, self.is_running(), &state, now)
    }

    /// Asks the event loop to stop once its current callback returns.
    pub(crate) fn request_stop(&self) {
        // No receiver means the loop has already exited.
        let _ = self.shutdown_tx.send(());
    }

    /// Force-frees whatever is still registered. Only called once the
    /// worker's thread has been joined.
    pub(crate) fn drain(&self) -> ReleaseReport {
        let records: Vec<Arc<ConnectionRecord>> = {
            let mut state = self.state.lock();
            state.load = 0;
            self.publish_load(0);
            state
                .registry
                .drain()
                .into_iter()
                .map(|slot| slot.record)
                .collect()
        };
        if !records.is_empty() {
            debug!(
                "thr={} force-freeing {} connections left at shutdown",
                self.index,
                records.len()
            );
        }
        release_all(self.index, &records, "shutdown")
    }

    /// Drops the per-worker collaborator handles (resolver and user lookup).
    pub(crate) fn release_handles(&self) {
        if self.resolver.lock().take().is_some() {
            trace!("thr={} released resolver", self.index);
        }
        if self.user_lookup.lock().take().is_some() {
            trace!("thr={} finalized user lookup", self.index);
        }
    }
}

/// Starts the worker's thread. The thread drives `runtime` until the worker
/// is asked to stop, then hands the runtime back through the join handle so
/// the pool releases it after joining.
pub(crate) fn spawn(
    worker: Arc<Worker>,
    runtime: Runtime,
    config: PoolConfig,
    shutdown_rx: broadcast::Receiver<()>,
    ready_tx: oneshot::Sender<()>,
    on_start: Option<ThreadStartHook>,
) -> io::Result<JoinHandle<Runtime>> {
    thread::Builder::new()
        .name(format!("pxypool-worker-{}", worker.index))
        .spawn(move || {
            if let Some(hook) = on_start {
                hook(&worker);
            }
            runtime.block_on(dispatch(worker, config, shutdown_rx, ready_tx));
            runtime
        })
}

/// The worker's event loop body. A recurring timer drives the expiration
/// sweep and, every few ticks, a status dump; it also keeps the loop alive
/// when no connection has events pending.
async fn dispatch(
    worker: Arc<Worker>,
    config: PoolConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
    ready_tx: oneshot::Sender<()>,
) {
    let period = config.sweep_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let sweeper = ExpirationSweeper::new(worker.clone(), config.expire_after);
    let mut timeout_count: u32 = 0;

    worker.running.store(true, Ordering::Release);
    metrics::WORKERS_RUNNING.inc();
    // The pool blocks in `run` until this arrives.
    if ready_tx.send(()).is_err() {
        debug!("thr={} started after the pool stopped waiting", worker.index);
    }
    debug!("thr={} event loop started", worker.index);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                trace!("thr={} timer tick, load={}, to={}", worker.index, worker.load(), timeout_count);
                sweeper.sweep(Instant::now());

                timeout_count += 1;
                if timeout_count > config.status_every_ticks {
                    timeout_count = 0;
                    debug!("{}", worker.status());
                }
            }
            _ = shutdown_rx.recv() => {
                info!("thr={} event loop stopping", worker.index);
                break;
            }
        }
    }

    worker.running.store(false, Ordering::Release);
    metrics::WORKERS_RUNNING.dec();
}
