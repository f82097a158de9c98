//! Work queue integration tests
//!
//! Exercises the slot rules under real worker threads:
//! - a (port, kind) item never runs concurrently with itself
//! - an item scheduled while it runs gets one more run
//! - delayed items are promoted by the timer thread
//!
//! Run with: `cargo test -p common --test workqueue_tests`

use common::{KIND_COUNT, WorkItem, WorkKind, WorkQueue, WorkerPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn slot(item: WorkItem) -> usize {
    item.port * KIND_COUNT + WorkKind::ALL.iter().position(|k| *k == item.kind).unwrap_or(0)
}

// ============================================================================
// Slot exclusivity
// ============================================================================

#[test]
fn test_item_never_runs_concurrently_with_itself() {
    const PORTS: usize = 3;
    let queue = Arc::new(WorkQueue::new(PORTS));
    let running: Arc<Vec<AtomicBool>> =
        Arc::new((0..PORTS * KIND_COUNT).map(|_| AtomicBool::new(false)).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let handler = {
        let running = running.clone();
        let overlaps = overlaps.clone();
        let runs = runs.clone();
        Arc::new(move |item: WorkItem| {
            let flag = &running[slot(item)];
            if flag.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(200));
            flag.store(false, Ordering::SeqCst);
            runs.fetch_add(1, Ordering::SeqCst);
        })
    };
    let pool = WorkerPool::spawn(queue.clone(), 4, handler).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for round in 0..500 {
                    let kind = WorkKind::ALL[round % KIND_COUNT];
                    queue.schedule(WorkItem::new(round % PORTS, kind));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || queue.is_idle()));
    pool.shutdown();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(runs.load(Ordering::SeqCst) > 0);
}

// ============================================================================
// No lost wakeups
// ============================================================================

#[test]
fn test_event_during_run_is_not_lost() {
    let queue = Arc::new(WorkQueue::new(1));
    let item = WorkItem::new(0, WorkKind::Inbound);
    let runs = Arc::new(AtomicUsize::new(0));

    let handler = {
        let queue = queue.clone();
        let runs = runs.clone();
        Arc::new(move |item: WorkItem| {
            // The first run raises its own event, as a peer edge would
            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                assert!(queue.schedule(item));
            }
        })
    };
    let pool = WorkerPool::spawn(queue.clone(), 2, handler).unwrap();

    queue.schedule(item);
    assert!(wait_for(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 2 && queue.is_idle()
    }));
    pool.shutdown();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_every_burst_gets_a_run_after_it() {
    let queue = Arc::new(WorkQueue::new(1));
    let item = WorkItem::new(0, WorkKind::Outbound);
    let produced = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));

    // Each run consumes everything produced so far
    let handler = {
        let produced = produced.clone();
        let consumed = consumed.clone();
        Arc::new(move |_: WorkItem| {
            consumed.store(produced.load(Ordering::SeqCst), Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(50));
        })
    };
    let pool = WorkerPool::spawn(queue.clone(), 3, handler).unwrap();

    for _ in 0..2000 {
        produced.fetch_add(1, Ordering::SeqCst);
        queue.schedule(item);
    }

    assert!(wait_for(Duration::from_secs(5), || queue.is_idle()));
    pool.shutdown();
    assert_eq!(consumed.load(Ordering::SeqCst), 2000);
}

// ============================================================================
// Timer
// ============================================================================

#[test]
fn test_timer_thread_promotes_delayed_items() {
    let queue = Arc::new(WorkQueue::new(2));
    let fired = Arc::new(AtomicUsize::new(0));

    let handler = {
        let fired = fired.clone();
        Arc::new(move |item: WorkItem| {
            assert_eq!(item.kind, WorkKind::PeerOpen);
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    let pool = WorkerPool::spawn(queue.clone(), 1, handler).unwrap();

    let started = Instant::now();
    queue.schedule_after(WorkItem::new(1, WorkKind::PeerOpen), Duration::from_millis(50));
    // Same item again keeps the first deadline
    queue.schedule_after(WorkItem::new(1, WorkKind::PeerOpen), Duration::from_millis(1));

    assert!(wait_for(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1));
    assert!(started.elapsed() >= Duration::from_millis(50));

    // A cancelled one never fires
    queue.schedule_after(WorkItem::new(0, WorkKind::PeerOpen), Duration::from_millis(20));
    assert!(queue.cancel_delayed(WorkItem::new(0, WorkKind::PeerOpen)));
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    pool.shutdown();
}

#[test]
fn test_dropping_pool_stops_threads() {
    let queue = Arc::new(WorkQueue::new(1));
    {
        let _pool = WorkerPool::spawn(queue.clone(), 2, Arc::new(|_: WorkItem| {})).unwrap();
    }
    assert!(queue.is_closed());
    assert!(!queue.schedule(WorkItem::new(0, WorkKind::Inbound)));
}
