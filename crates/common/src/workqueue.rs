//! Deferred work queue
//!
//! Interrupt-style producers (USB completions, peer availability edges,
//! modem status callbacks) never do transport I/O themselves. They schedule
//! a [`WorkItem`] and return; worker threads pick items up and run them.
//!
//! Every (port, kind) pair has one slot with the same semantics as a kernel
//! work item:
//!
//! - scheduling an item that is already queued does nothing
//! - scheduling an item while it runs marks it for one more run after the
//!   current one finishes
//!
//! So a kind of work never runs concurrently with itself on a port, and an
//! event that arrives mid-run is never lost.

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Number of work kinds per port
pub const KIND_COUNT: usize = 5;

/// How often the timer thread promotes due delayed items
const TIMER_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Drain completed OUT requests into the peer channel
    Inbound,
    /// Drain peer data into IN requests
    Outbound,
    /// Push host control lines to the modem
    PeerNotify,
    /// Push modem status to the host
    HostNotify,
    /// Open the peer channel
    PeerOpen,
}

impl WorkKind {
    pub const ALL: [WorkKind; KIND_COUNT] = [
        WorkKind::Inbound,
        WorkKind::Outbound,
        WorkKind::PeerNotify,
        WorkKind::HostNotify,
        WorkKind::PeerOpen,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub port: usize,
    pub kind: WorkKind,
}

impl WorkItem {
    pub fn new(port: usize, kind: WorkKind) -> Self {
        Self { port, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Queued,
    Running,
    Rerun,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    item: WorkItem,
}

/// Bounded queue of work items with per-slot deduplication
pub struct WorkQueue {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    ports: usize,
    slots: Vec<Mutex<SlotState>>,
    delayed: Mutex<Vec<Delayed>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkQueue {
    /// Create a queue for `ports` ports
    ///
    /// Capacity is one entry per slot, which is all deduplication ever lets
    /// into the channel at once.
    pub fn new(ports: usize) -> Self {
        let slot_count = ports * KIND_COUNT;
        let (tx, rx) = bounded(slot_count.max(1));
        Self {
            tx,
            rx,
            ports,
            slots: (0..slot_count).map(|_| Mutex::new(SlotState::Idle)).collect(),
            delayed: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, item: WorkItem) -> Option<&Mutex<SlotState>> {
        if item.port >= self.ports {
            return None;
        }
        self.slots.get(item.port * KIND_COUNT + item.kind.index())
    }

    /// Queue `item`; returns false if it was already pending
    pub fn schedule(&self, item: WorkItem) -> bool {
        let Some(slot) = self.slot(item) else {
            warn!("Dropping work for unknown port {}", item.port);
            return false;
        };

        let mut state = lock(slot);
        match *state {
            SlotState::Idle => match self.tx.try_send(item) {
                Ok(()) => {
                    *state = SlotState::Queued;
                    trace!("Queued {:?} for port {}", item.kind, item.port);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Work queue closed, dropping {:?}", item);
                    false
                }
                Err(TrySendError::Full(_)) => {
                    error!("Work queue full, dropping {:?}", item);
                    false
                }
            },
            SlotState::Running => {
                *state = SlotState::Rerun;
                true
            }
            SlotState::Queued | SlotState::Rerun => false,
        }
    }

    /// Queue `item` once `delay` has passed
    ///
    /// An item that is already waiting keeps its original deadline.
    pub fn schedule_after(&self, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            self.schedule(item);
            return;
        }

        let mut delayed = lock(&self.delayed);
        if delayed.iter().any(|d| d.item == item) {
            return;
        }
        debug!(
            "Deferring {:?} for port {} by {:?}",
            item.kind, item.port, delay
        );
        delayed.push(Delayed {
            due: Instant::now() + delay,
            item,
        });
    }

    /// Drop a delayed item that has not fired yet
    pub fn cancel_delayed(&self, item: WorkItem) -> bool {
        let mut delayed = lock(&self.delayed);
        let before = delayed.len();
        delayed.retain(|d| d.item != item);
        delayed.len() != before
    }

    /// Move every delayed item whose deadline has passed into the queue
    pub fn promote_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<WorkItem> = {
            let mut delayed = lock(&self.delayed);
            let (ready, waiting): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|d| d.due <= now);
            *delayed = waiting;
            ready.into_iter().map(|d| d.item).collect()
        };

        for item in &due {
            self.schedule(*item);
        }
        due.len()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.delayed).iter().map(|d| d.due).min()
    }

    pub fn try_next(&self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next item; fails once the queue is closed and drained
    pub fn next_blocking(&self) -> Result<WorkItem> {
        self.rx
            .recv_blocking()
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Mark an item taken off the queue as running
    pub fn begin(&self, item: WorkItem) {
        if let Some(slot) = self.slot(item) {
            let mut state = lock(slot);
            if *state == SlotState::Queued {
                *state = SlotState::Running;
            }
        }
    }

    /// Mark a run finished, requeueing it if it was scheduled meanwhile
    pub fn finish(&self, item: WorkItem) {
        let Some(slot) = self.slot(item) else {
            return;
        };
        let mut state = lock(slot);
        match *state {
            SlotState::Rerun => {
                if self.tx.try_send(item).is_ok() {
                    *state = SlotState::Queued;
                } else {
                    *state = SlotState::Idle;
                }
            }
            _ => *state = SlotState::Idle,
        }
    }

    /// Take one item, if any, and run it on the calling thread
    pub fn run_one(&self, handler: impl FnOnce(WorkItem)) -> bool {
        let Some(item) = self.try_next() else {
            return false;
        };
        self.begin(item);
        handler(item);
        self.finish(item);
        true
    }

    /// Nothing queued, running or waiting on a timer
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| *lock(s) == SlotState::Idle) && lock(&self.delayed).is_empty()
    }

    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Function the worker threads run for every item
pub type WorkHandler = Arc<dyn Fn(WorkItem) + Send + Sync>;

/// Worker threads plus the timer thread that feeds delayed items
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(queue: Arc<WorkQueue>, count: usize, handler: WorkHandler) -> Result<Self> {
        if count == 0 {
            return Err(Error::Config("Worker pool needs at least one thread".into()));
        }

        let mut pool = Self {
            queue: queue.clone(),
            workers: Vec::with_capacity(count + 1),
        };

        for i in 0..count {
            let queue = queue.clone();
            let handler = handler.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gser-worker-{}", i))
                .spawn(move || worker_loop(&queue, &handler))?;
            pool.workers.push(handle);
        }

        let timer_queue = queue.clone();
        let timer = std::thread::Builder::new()
            .name("gser-timer".to_string())
            .spawn(move || {
                while !timer_queue.is_closed() {
                    timer_queue.promote_due();
                    std::thread::sleep(TIMER_TICK);
                }
            })?;
        pool.workers.push(timer);

        info!("Started {} work queue threads", count);
        Ok(pool)
    }

    /// Close the queue and wait for every thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.queue.close();
        for handle in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.join() {
                error!("Work queue thread panicked: {:?}", e);
            }
        }
        info!("Work queue threads stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: &WorkQueue, handler: &WorkHandler) {
    debug!("Worker started");

    while let Ok(item) = queue.next_blocking() {
        queue.begin(item);

        // A panicking relay must not take the whole pool down
        let result = catch_unwind(AssertUnwindSafe(|| handler(item)));
        if let Err(e) = result {
            error!("Panic in work handler for {:?}: {:?}", item, e);
        }

        queue.finish(item);
    }

    debug!("Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_schedule_deduplicates_queued_items() {
        let queue = WorkQueue::new(2);
        let item = WorkItem::new(0, WorkKind::Inbound);

        assert!(queue.schedule(item));
        assert!(!queue.schedule(item));
        assert!(queue.schedule(WorkItem::new(1, WorkKind::Inbound)));

        assert_eq!(queue.try_next(), Some(item));
        assert_eq!(queue.try_next(), Some(WorkItem::new(1, WorkKind::Inbound)));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_schedule_while_running_reruns_once() {
        let queue = WorkQueue::new(1);
        let item = WorkItem::new(0, WorkKind::Outbound);
        let runs = AtomicUsize::new(0);

        queue.schedule(item);
        assert!(queue.run_one(|it| {
            runs.fetch_add(1, Ordering::SeqCst);
            // Two events during the run collapse into one rerun
            assert!(queue.schedule(it));
            assert!(!queue.schedule(it));
        }));

        assert!(queue.run_one(|_| {
            runs.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!queue.run_one(|_| unreachable!()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_unknown_port_is_rejected() {
        let queue = WorkQueue::new(1);
        assert!(!queue.schedule(WorkItem::new(3, WorkKind::Inbound)));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_delayed_items_fire_when_due() {
        let queue = WorkQueue::new(1);
        let item = WorkItem::new(0, WorkKind::PeerOpen);

        queue.schedule_after(item, Duration::from_millis(20));
        assert_eq!(queue.promote_due(), 0);
        assert!(!queue.is_idle());
        assert!(queue.next_deadline().is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.promote_due(), 1);
        assert_eq!(queue.try_next(), Some(item));
    }

    #[test]
    fn test_zero_delay_schedules_immediately() {
        let queue = WorkQueue::new(1);
        let item = WorkItem::new(0, WorkKind::PeerOpen);
        queue.schedule_after(item, Duration::ZERO);
        assert_eq!(queue.try_next(), Some(item));
    }

    #[test]
    fn test_cancel_delayed() {
        let queue = WorkQueue::new(1);
        let item = WorkItem::new(0, WorkKind::PeerOpen);
        queue.schedule_after(item, Duration::from_secs(60));
        assert!(queue.cancel_delayed(item));
        assert!(!queue.cancel_delayed(item));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_closed_queue_refuses_work() {
        let queue = WorkQueue::new(1);
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.schedule(WorkItem::new(0, WorkKind::Inbound)));
        assert!(queue.next_blocking().is_err());
    }

    #[test]
    fn test_worker_pool_runs_items_and_shuts_down() {
        let queue = Arc::new(WorkQueue::new(4));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let pool = WorkerPool::spawn(
            queue.clone(),
            2,
            Arc::new(move |_: WorkItem| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        for port in 0..4 {
            queue.schedule(WorkItem::new(port, WorkKind::Inbound));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_worker_pool_survives_panics() {
        let queue = Arc::new(WorkQueue::new(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let pool = WorkerPool::spawn(
            queue.clone(),
            1,
            Arc::new(move |item: WorkItem| {
                counter.fetch_add(1, Ordering::SeqCst);
                if item.kind == WorkKind::Inbound {
                    panic!("relay blew up");
                }
            }),
        )
        .unwrap();

        queue.schedule(WorkItem::new(0, WorkKind::Inbound));
        queue.schedule(WorkItem::new(0, WorkKind::Outbound));

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_workers_is_an_error() {
        let queue = Arc::new(WorkQueue::new(1));
        assert!(WorkerPool::spawn(queue, 0, Arc::new(|_: WorkItem| {})).is_err());
    }
}
