// tests/unit_lifecycle_test.rs

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use pxypool::ThreadPool;
use pxypool::core::pool::Worker;
use pxypool::core::userdb::{UserDb, UserLookup, UserRecord};
use pxypool::core::{PoolError, UserDbError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use test_helpers::{TeardownCounter, init_tracing, running_pool, test_config};

/// A user store whose lookups track how many of them are alive, optionally
/// refusing to prepare one for a given worker.
#[derive(Default)]
struct FakeUserDb {
    live: Arc<AtomicUsize>,
    prepared: AtomicUsize,
    fail_for: Option<usize>,
}

struct FakeLookup {
    worker: usize,
    live: Arc<AtomicUsize>,
}

impl UserDb for FakeUserDb {
    fn prepare_user_lookup(&self, worker: usize) -> Result<Box<dyn UserLookup>, UserDbError> {
        if self.fail_for == Some(worker) {
            return Err(UserDbError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeLookup {
            worker,
            live: self.live.clone(),
        }))
    }
}

impl UserLookup for FakeLookup {
    fn lookup(&mut self, ip: IpAddr) -> Result<Option<UserRecord>, UserDbError> {
        Ok(Some(UserRecord {
            user: format!("user-{}", self.worker),
            ether: "00:00:5e:00:53:01".to_string(),
            atime: 0,
            desc: Some(ip.to_string()),
        }))
    }
}

impl Drop for FakeLookup {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn user_auth_pool(cores: usize, user_db: Arc<FakeUserDb>) -> ThreadPool {
    init_tracing();
    let mut config = test_config(cores);
    config.user_auth.enabled = true;
    ThreadPool::new(Arc::new(config)).with_user_db(user_db)
}

#[test]
fn test_new_allocates_nothing() {
    let pool = ThreadPool::new(Arc::new(test_config(4)));
    assert_eq!(pool.num_workers(), 8);
    assert!(!pool.is_running());
    assert_eq!(pool.workers().count(), 0);
    assert!(pool.status().workers.is_empty());
}

#[test]
fn test_run_starts_every_worker() {
    let pool = running_pool(2);
    assert!(pool.is_running());
    assert_eq!(pool.workers().count(), 4);
    for (idx, worker) in pool.workers().enumerate() {
        assert_eq!(worker.index(), idx);
        assert!(worker.is_running());
        assert_eq!(worker.load(), 0);
    }
}

#[test]
fn test_run_twice_is_rejected() {
    let mut pool = running_pool(1);
    assert!(matches!(pool.run(), Err(PoolError::AlreadyRunning)));
    assert!(pool.is_running());
}

#[test]
fn test_free_stops_workers_and_force_frees_records() {
    let pool = running_pool(1);
    let counter = TeardownCounter::new();
    let records: Vec<_> = (0..3).map(|_| counter.record()).collect();
    for record in &records {
        pool.attach(record);
    }
    pool.attach_child(&counter.record(), &records[0]);
    let workers: Vec<Arc<Worker>> = pool.workers().cloned().collect();

    let report = pool.free();

    assert_eq!(report.released, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(counter.count(), 4);
    for worker in workers {
        assert!(!worker.is_running());
        assert_eq!(worker.load(), 0);
        assert_eq!(worker.registered(), 0);
    }
}

#[test]
fn test_drop_releases_like_free() {
    let counter = TeardownCounter::new();
    let worker = {
        let pool = running_pool(1);
        pool.attach(&counter.record());
        pool.worker(0).unwrap().clone()
    };
    assert_eq!(counter.count(), 1);
    assert!(!worker.is_running());
}

#[test]
fn test_free_without_run_is_harmless() {
    let pool = ThreadPool::new(Arc::new(test_config(1)));
    assert_eq!(pool.free().released, 0);
}

#[test]
fn test_user_auth_without_store_fails_startup() {
    init_tracing();
    let mut config = test_config(1);
    config.user_auth.enabled = true;
    let mut pool = ThreadPool::new(Arc::new(config));

    assert!(matches!(pool.run(), Err(PoolError::MissingUserDb)));
    assert!(!pool.is_running());
}

#[test]
fn test_failed_user_query_rolls_back_every_worker() {
    let user_db = Arc::new(FakeUserDb {
        fail_for: Some(3),
        ..FakeUserDb::default()
    });
    let mut pool = user_auth_pool(2, user_db.clone());

    match pool.run() {
        Err(PoolError::UserQuery { worker, .. }) => assert_eq!(worker, 3),
        other => panic!("expected a user query failure, got {other:?}"),
    }
    assert!(!pool.is_running());
    assert_eq!(user_db.prepared.load(Ordering::SeqCst), 3);
    assert_eq!(user_db.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_store_fails_startup_inside_async_context() {
    init_tracing();
    let mut config = test_config(1);
    config.user_auth.enabled = true;
    let mut pool = ThreadPool::new(Arc::new(config));

    assert!(matches!(pool.run(), Err(PoolError::MissingUserDb)));
    assert!(!pool.is_running());
}

#[tokio::test]
async fn test_failed_user_query_unwinds_inside_async_context() {
    let user_db = Arc::new(FakeUserDb {
        fail_for: Some(2),
        ..FakeUserDb::default()
    });
    let mut pool = user_auth_pool(2, user_db.clone());

    match pool.run() {
        Err(PoolError::UserQuery { worker, .. }) => assert_eq!(worker, 2),
        other => panic!("expected a user query failure, got {other:?}"),
    }
    assert!(!pool.is_running());
    assert_eq!(user_db.prepared.load(Ordering::SeqCst), 2);
    assert_eq!(user_db.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_worker_dying_before_ready_stops_started_workers() {
    let user_db = Arc::new(FakeUserDb::default());
    let started: Arc<Mutex<Vec<Arc<Worker>>>> = Arc::default();
    let hook_started = started.clone();
    let mut pool = user_auth_pool(2, user_db.clone()).with_thread_start(move |worker| {
        hook_started.lock().unwrap().push(worker.clone());
        if worker.index() == 2 {
            panic!("worker 2 failed to initialize");
        }
    });

    match pool.run() {
        Err(PoolError::NotReady { worker }) => assert_eq!(worker, 2),
        other => panic!("expected worker 2 to never report ready, got {other:?}"),
    }
    assert!(!pool.is_running());
    assert_eq!(pool.workers().count(), 0);

    let started = started.lock().unwrap();
    let indices: Vec<usize> = started.iter().map(|w| w.index()).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    for worker in started.iter() {
        assert!(!worker.is_running());
        assert!(!worker.has_user_lookup());
        assert_eq!(worker.load(), 0);
        assert_eq!(worker.registered(), 0);
    }
    // Worker 3 was allocated but never started; its lookup is gone too.
    assert_eq!(user_db.prepared.load(Ordering::SeqCst), 4);
    assert_eq!(user_db.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_thread_start_hook_runs_on_each_worker_thread() {
    init_tracing();
    let names: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let hook_names = names.clone();
    let mut pool = ThreadPool::new(Arc::new(test_config(1))).with_thread_start(move |_| {
        let name = std::thread::current().name().map(String::from);
        hook_names.lock().unwrap().push(name);
    });
    pool.run().unwrap();

    assert_eq!(
        *names.lock().unwrap(),
        vec![
            Some("pxypool-worker-0".to_string()),
            Some("pxypool-worker-1".to_string())
        ]
    );
    assert!(pool.workers().all(|w| w.is_running()));
}

#[test]
fn test_pool_can_start_after_failed_run() {
    let mut pool = ThreadPool::new(Arc::new({
        let mut config = test_config(1);
        config.user_auth.enabled = true;
        config
    }));
    assert!(pool.run().is_err());

    let user_db = Arc::new(FakeUserDb::default());
    let mut pool = pool.with_user_db(user_db.clone());
    pool.run().unwrap();
    assert_eq!(user_db.live.load(Ordering::SeqCst), 2);
}

#[test]
fn test_each_worker_gets_its_own_user_lookup() {
    let user_db = Arc::new(FakeUserDb::default());
    let mut pool = user_auth_pool(2, user_db.clone());
    pool.run().unwrap();
    assert_eq!(user_db.live.load(Ordering::SeqCst), 4);

    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    for worker in pool.workers() {
        assert!(worker.has_user_lookup());
        let user = worker.lookup_user(ip).unwrap().unwrap();
        assert_eq!(user.user, format!("user-{}", worker.index()));
    }

    pool.free();
    assert_eq!(user_db.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_lookup_user_without_user_auth() {
    let pool = running_pool(1);
    let worker = pool.worker(0).unwrap();
    assert!(!worker.has_user_lookup());
    assert!(matches!(
        worker.lookup_user(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        Err(UserDbError::NotConfigured)
    ));
}

#[test]
fn test_resolver_lookup_runs_on_worker_loop() {
    init_tracing();
    let mut config = test_config(1);
    config.dns.enabled = true;
    let mut pool = ThreadPool::new(Arc::new(config));
    pool.run().unwrap();

    let resolver = pool.worker(1).unwrap().resolver().unwrap();
    let handle = resolver.spawn_lookup("127.0.0.1", 8443);
    let rt = tokio::runtime::Runtime::new().unwrap();
    let addrs = rt.block_on(handle).unwrap().unwrap();

    let expected: SocketAddr = "127.0.0.1:8443".parse().unwrap();
    assert_eq!(addrs, vec![expected]);
}

#[test]
fn test_worker_thread_names() {
    let pool = running_pool(1);
    for worker in pool.workers() {
        let (tx, rx) = std::sync::mpsc::channel();
        worker.event_loop().spawn(async move {
            let _ = tx.send(std::thread::current().name().map(String::from));
        });
        let name = rx.recv().unwrap();
        assert_eq!(name, Some(format!("pxypool-worker-{}", worker.index())));
    }
}
