// src/core/pool/thread_pool.rs

//! Defines `ThreadPool`, the fixed set of workers connections are spread over.

use super::scheduling::least_loaded;
use super::worker::{self, DetachOutcome, Worker};
use crate::config::Config;
use crate::connection::{ConnectionGuard, ConnectionRecord, ReleaseReport};
use crate::core::errors::PoolError;
use crate::core::resolver::DnsResolver;
use crate::core::status::PoolStatus;
use crate::core::userdb::UserDb;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Where `attach` placed a connection: the worker index plus the handles the
/// caller registers the connection's I/O and lookups with.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker: usize,
    pub event_loop: Handle,
    pub resolver: Option<Arc<DnsResolver>>,
}

impl Assignment {
    fn for_worker(worker: &Worker) -> Self {
        Self {
            worker: worker.index(),
            event_loop: worker.event_loop().clone(),
            resolver: worker.resolver(),
        }
    }
}

/// Callback run on each worker's thread before its event loop starts.
pub type ThreadStartHook = Arc<dyn Fn(&Arc<Worker>) + Send + Sync>;

/// Everything the pool owns for one worker. The runtime lives here until the
/// worker's thread takes it, and comes back out of the join handle.
struct WorkerSlot {
    worker: Arc<Worker>,
    runtime: Option<Runtime>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    thread: Option<JoinHandle<Runtime>>,
}

impl WorkerSlot {
    /// Joins the thread (if one was started) and frees every resource the
    /// slot holds. Safe to call on slots that never started.
    fn release(mut self) -> ReleaseReport {
        let index = self.worker.index();
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(runtime) => self.runtime = Some(runtime),
                Err(_) => error!("thr={} worker thread panicked", index),
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        let report = self.worker.drain();
        self.worker.release_handles();
        debug!("thr={} released", index);
        report
    }
}

/// A fixed-size pool of workers, each running its own event loop on its own
/// OS thread.
///
/// `new` only records the configuration; `run` allocates and starts
/// everything, and `free` (or drop) stops and releases it again.
pub struct ThreadPool {
    config: Arc<Config>,
    num_workers: usize,
    user_db: Option<Arc<dyn UserDb>>,
    on_thread_start: Option<ThreadStartHook>,
    slots: Vec<WorkerSlot>,
}

impl ThreadPool {
    /// Sizes the pool at two workers per CPU core. Allocates nothing.
    pub fn new(config: Arc<Config>) -> Self {
        let num_workers = config.worker_count();
        Self {
            config,
            num_workers,
            user_db: None,
            on_thread_start: None,
            slots: Vec::new(),
        }
    }

    /// Supplies the user store each worker prepares its lookup against.
    pub fn with_user_db(mut self, user_db: Arc<dyn UserDb>) -> Self {
        self.user_db = Some(user_db);
        self
    }

    /// Runs `hook` on every worker thread before that worker reports ready.
    /// A panicking hook kills the thread and fails `run` with `NotReady`.
    pub fn with_thread_start(
        mut self,
        hook: impl Fn(&Arc<Worker>) + Send + Sync + 'static,
    ) -> Self {
        self.on_thread_start = Some(Arc::new(hook));
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Allocates every worker's resources, then starts the workers one at a
    /// time, each only after the previous one reported that it is
    /// dispatching. On any failure everything started so far is stopped and
    /// released again before the error is returned.
    ///
    /// Blocks while the workers come up; async callers go through
    /// `spawn_blocking`.
    pub fn run(&mut self) -> Result<(), PoolError> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }
        debug!(
            "Starting thread pool: {} workers, dns={}, user_auth={}",
            self.num_workers,
            self.config.dns_enabled(),
            self.config.has_user_auth()
        );

        let mut slots = Vec::with_capacity(self.num_workers);
        for idx in 0..self.num_workers {
            match self.allocate(idx) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    error!("Failed to set up worker {}: {}", idx, e);
                    Self::unwind(slots);
                    return Err(e);
                }
            }
        }

        if let Err(e) = slots.iter_mut().try_for_each(|slot| self.start(slot)) {
            error!("Failed to start thread pool: {}", e);
            Self::unwind(slots);
            return Err(e);
        }

        self.slots = slots;
        info!("Thread pool running with {} workers", self.num_workers);
        Ok(())
    }

    fn allocate(&self, idx: usize) -> Result<WorkerSlot, PoolError> {
        // Prepared before the runtime exists so a failure has no runtime to drop.
        let user_lookup = if self.config.has_user_auth() {
            let user_db = self.user_db.as_ref().ok_or(PoolError::MissingUserDb)?;
            let lookup = user_db
                .prepare_user_lookup(idx)
                .map_err(|source| PoolError::UserQuery {
                    worker: idx,
                    source,
                })?;
            Some(lookup)
        } else {
            None
        };

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| PoolError::EventLoop {
                worker: idx,
                source,
            })?;
        let handle = runtime.handle().clone();

        let resolver = self
            .config
            .dns_enabled()
            .then(|| Arc::new(DnsResolver::new(idx, handle.clone())));

        // Subscribed before the thread exists, so a stop requested early is not lost.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = Arc::new(Worker::new(idx, handle, resolver, user_lookup, shutdown_tx));

        Ok(WorkerSlot {
            worker,
            runtime: Some(runtime),
            shutdown_rx: Some(shutdown_rx),
            thread: None,
        })
    }

    fn start(&self, slot: &mut WorkerSlot) -> Result<(), PoolError> {
        let idx = slot.worker.index();
        let (Some(runtime), Some(shutdown_rx)) = (slot.runtime.take(), slot.shutdown_rx.take())
        else {
            return Err(PoolError::NotReady { worker: idx });
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let thread = worker::spawn(
            slot.worker.clone(),
            runtime,
            self.config.pool.clone(),
            shutdown_rx,
            ready_tx,
            self.on_thread_start.clone(),
        )
        .map_err(|source| PoolError::Spawn {
            worker: idx,
            source,
        })?;
        slot.thread = Some(thread);

        // A closed channel means the thread died before its loop started.
        ready_rx
            .blocking_recv()
            .map_err(|_| PoolError::NotReady { worker: idx })?;
        debug!("thr={} ready", idx);
        Ok(())
    }

    fn unwind(slots: Vec<WorkerSlot>) {
        for slot in &slots {
            slot.worker.request_stop();
        }
        for slot in slots {
            slot.release();
        }
    }

    /// Assigns `record` to the worker with the smallest load.
    ///
    /// Each worker's load is read under that worker's lock, one worker at a
    /// time, so the choice can be slightly stale under concurrent attaches.
    pub fn attach(&self, record: &Arc<ConnectionRecord>) -> Assignment {
        let idx = least_loaded(self.slots.iter().map(|slot| slot.worker.load()))
            .expect("attach called on a thread pool that is not running");
        let worker = &self.slots[idx].worker;
        worker.attach_root(record);
        debug!(
            "thr={} attached connection {}, load={}",
            idx,
            record.id(),
            worker.load()
        );
        Assignment::for_worker(worker)
    }

    /// Pins `child` to the worker `parent` is attached to.
    pub fn attach_child(
        &self,
        child: &Arc<ConnectionRecord>,
        parent: &ConnectionRecord,
    ) -> Assignment {
        let worker = self.owner(parent);
        worker.attach_child(child, parent.id());
        Assignment::for_worker(worker)
    }

    /// Frees a top-level connection's load slot and unlinks it once nothing
    /// pins it.
    pub fn detach(&self, record: &ConnectionRecord) -> DetachOutcome {
        self.owner(record).detach(record)
    }

    /// Frees a child connection's load slot and unlinks it once nothing pins it.
    pub fn detach_child(&self, record: &ConnectionRecord) -> DetachOutcome {
        debug_assert!(record.is_child(), "detach_child on a top-level connection");
        self.owner(record).detach(record)
    }

    /// Wraps an attached record in a guard that detaches it on drop.
    pub fn guard(&self, record: &Arc<ConnectionRecord>) -> ConnectionGuard {
        ConnectionGuard::new(self.owner(record).clone(), record.clone())
    }

    fn owner(&self, record: &ConnectionRecord) -> &Arc<Worker> {
        let idx = record
            .worker()
            .expect("connection was never attached to a worker");
        &self
            .slots
            .get(idx)
            .expect("connection belongs to a worker of another pool")
            .worker
    }

    /// The event loop of the worker `record` is attached to.
    pub fn event_loop(&self, record: &ConnectionRecord) -> Handle {
        self.owner(record).event_loop().clone()
    }

    /// The resolver of the worker `record` is attached to, if DNS is enabled.
    pub fn resolver(&self, record: &ConnectionRecord) -> Option<Arc<DnsResolver>> {
        self.owner(record).resolver()
    }

    pub fn worker(&self, idx: usize) -> Option<&Arc<Worker>> {
        self.slots.get(idx).map(|slot| &slot.worker)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.slots.iter().map(|slot| &slot.worker)
    }

    pub fn loads(&self) -> Vec<usize> {
        self.workers().map(|w| w.load()).collect()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.workers().map(|w| w.status()).collect(),
        }
    }

    /// Stops every worker, joins its thread and releases everything it owned,
    /// including connections still registered.
    pub fn free(mut self) -> ReleaseReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ReleaseReport {
        let slots = std::mem::take(&mut self.slots);
        if slots.is_empty() {
            return ReleaseReport::default();
        }
        info!("Stopping thread pool");
        for slot in &slots {
            slot.worker.request_stop();
        }
        let mut report = ReleaseReport::default();
        for slot in slots {
            report.merge(slot.release());
        }
        if report.failed > 0 {
            warn!(
                "Thread pool stopped; {} connections force-freed, {} failed to release",
                report.released, report.failed
            );
        } else {
            info!(
                "Thread pool stopped; {} connections force-freed",
                report.released
            );
        }
        report
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
