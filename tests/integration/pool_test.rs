// tests/integration/pool_test.rs

//! End-to-end tests driving the pool the way the proxy does: an acceptor
//! thread attaches, protocol tasks on the worker loops detach.

use super::test_helpers::{TeardownCounter, running_pool};
use pxypool::connection::EofFlags;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_connections_detached_from_worker_loops() {
    let pool = running_pool(2);
    let counter = TeardownCounter::new();
    const CONNECTIONS: usize = 400;

    for _ in 0..CONNECTIONS {
        let record = counter.record();
        let assignment = pool.attach(&record);
        let guard = pool.guard(&record);
        assignment.event_loop.spawn(async move {
            guard.record().touch();
            guard.record().mark_eof(EofFlags::SRC | EofFlags::DST);
            tokio::task::yield_now().await;
            drop(guard);
        });
    }

    assert!(
        wait_until(Duration::from_secs(10), || counter.count() == CONNECTIONS),
        "only {} of {} connections were torn down",
        counter.count(),
        CONNECTIONS
    );
    assert_eq!(pool.loads(), vec![0; 4]);
    for worker in pool.workers() {
        assert_eq!(worker.registered(), 0);
    }
}

#[test]
fn test_concurrent_acceptors_keep_loads_balanced() {
    let pool = Arc::new(running_pool(2));
    let counter = TeardownCounter::new();

    let acceptors: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| {
                        let record = counter.record();
                        pool.attach(&record);
                        record
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let records: Vec<_> = acceptors
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let loads = pool.loads();
    assert_eq!(loads.iter().sum::<usize>(), 200);
    let (min, max) = (loads.iter().min().unwrap(), loads.iter().max().unwrap());
    assert!(max - min <= 8, "loads drifted too far apart: {loads:?}");

    let detachers: Vec<_> = records
        .chunks(50)
        .map(|chunk| {
            let pool = pool.clone();
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for record in &chunk {
                    pool.detach(record);
                }
            })
        })
        .collect();
    for handle in detachers {
        handle.join().unwrap();
    }

    assert_eq!(pool.loads(), vec![0; 4]);
    assert_eq!(counter.count(), 200);
}

#[test]
fn test_free_releases_connections_held_by_pending_tasks() {
    let pool = running_pool(1);
    let counter = TeardownCounter::new();

    for _ in 0..10 {
        let record = counter.record();
        let assignment = pool.attach(&record);
        let parent_guard = pool.guard(&record);
        let child = counter.record();
        pool.attach_child(&child, &record);
        assignment.event_loop.spawn(async move {
            let _guard = parent_guard;
            std::future::pending::<()>().await;
        });
    }

    let report = pool.free();

    assert_eq!(report.failed, 0);
    assert_eq!(counter.count(), 20);
}
