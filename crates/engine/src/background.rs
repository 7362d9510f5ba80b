//! Priority-ordered background I/O pools.
//!
//! Provides a priority-based task queue with lazily spawned worker threads.
//! Two instances back the cache: one for spill (write) work and one for
//! demand-fetch (read) work, so a burst of bulk writes never queues in front
//! of an interactive read.
//!
//! Workers are created on demand up to the configured bound and exit after
//! sitting idle for the configured timeout.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::CacheConfig;

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Partition deletion, orphan cleanup
    Maintenance = 0,
    /// Spill batches from insert
    BulkInsert = 1,
    /// Demand fetches a query is waiting on
    Retrieve = 2,
    /// Backend deletes for removed records
    Removal = 3,
}

/// Error returned when a task cannot be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackpressureError {
    /// The queue is at capacity.
    #[error("{pool} queue is full ({depth} tasks)")]
    QueueFull {
        /// Pool name
        pool: String,
        /// Queue depth at rejection
        depth: usize,
    },
    /// The pool was shut down.
    #[error("{0} pool is shut down")]
    ShutDown(String),
    /// No worker could be started.
    #[error("{pool} worker could not be spawned: {reason}")]
    SpawnFailed {
        /// Pool name
        pool: String,
        /// OS error text
        reason: String,
    },
}

impl From<BackpressureError> for geocache_core::Error {
    fn from(e: BackpressureError) -> Self {
        geocache_core::Error::SchedulerError(e.to_string())
    }
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Number of tasks currently being executed by workers.
    pub active_tasks: usize,
    /// Total number of tasks completed since scheduler creation.
    pub tasks_completed: u64,
    /// Number of live worker threads.
    pub worker_count: usize,
    /// Upper bound on worker threads.
    pub max_workers: usize,
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Box<dyn FnOnce() + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue plus worker bookkeeping, all guarded by one lock
struct QueueState {
    heap: BinaryHeap<TaskEnvelope>,
    live_workers: usize,
    idle_workers: usize,
}

struct SchedulerInner {
    name: String,
    state: ParkingMutex<QueueState>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    tasks_completed: AtomicU64,
    spawned: AtomicU64,
    max_workers: usize,
    max_queue_depth: usize,
    idle_timeout: Duration,
}

/// A background task scheduler with priority ordering.
///
/// Higher-priority tasks run first; within the same priority, tasks are
/// executed in FIFO order.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: ParkingMutex<Vec<JoinHandle<()>>>,
}

impl BackgroundScheduler {
    /// Create a scheduler with at most `max_workers` threads.
    ///
    /// No thread is started until the first submit. Workers are named
    /// `geocache-<name>-0`, `geocache-<name>-1`, etc.
    pub fn new(
        name: &str,
        max_workers: usize,
        max_queue_depth: usize,
        idle_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            name: name.to_string(),
            state: ParkingMutex::new(QueueState {
                heap: BinaryHeap::new(),
                live_workers: 0,
                idle_workers: 0,
            }),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            max_workers: max_workers.max(1),
            max_queue_depth,
            idle_timeout,
        });

        Self {
            inner,
            workers: ParkingMutex::new(Vec::new()),
        }
    }

    /// Pool name used in thread names and log lines.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submit a task.
    ///
    /// Returns `Err(BackpressureError)` if the queue is at capacity, the
    /// scheduler has been shut down, or no worker exists and none could be
    /// started.
    pub fn submit(
        &self,
        priority: TaskPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<(), BackpressureError> {
        // Reject after shutdown: workers have been joined, task would never run
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(BackpressureError::ShutDown(self.inner.name.clone()));
        }

        let depth = self.inner.queue_depth.load(AtomicOrdering::Acquire);
        if depth >= self.inner.max_queue_depth {
            return Err(BackpressureError::QueueFull {
                pool: self.inner.name.clone(),
                depth,
            });
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let envelope = TaskEnvelope {
            priority,
            sequence,
            work: Box::new(work),
        };

        let mut state = self.inner.state.lock();
        let needs_worker =
            state.idle_workers == 0 && state.live_workers < self.inner.max_workers;
        if needs_worker {
            match self.spawn_worker() {
                Ok(handle) => {
                    state.live_workers += 1;
                    let mut workers = self.workers.lock();
                    workers.retain(|h| !h.is_finished());
                    workers.push(handle);
                }
                Err(e) if state.live_workers == 0 => {
                    return Err(BackpressureError::SpawnFailed {
                        pool: self.inner.name.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(target: "geocache::pool", pool = %self.inner.name, error = %e, "Worker spawn failed, queueing on existing workers");
                }
            }
        }
        state.heap.push(envelope);
        self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        drop(state);

        self.inner.work_ready.notify_one();
        Ok(())
    }

    fn spawn_worker(&self) -> std::io::Result<JoinHandle<()>> {
        let n = self.inner.spawned.fetch_add(1, AtomicOrdering::Relaxed);
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name(format!("geocache-{}-{}", self.inner.name, n))
            .spawn(move || worker_loop(&inner))
    }

    /// Block until all queued and in-flight tasks have completed.
    ///
    /// Workers remain running after drain completes; this does NOT signal
    /// shutdown. Must not be called from one of this pool's own tasks.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut state);
        }
    }

    /// Shut down the scheduler: signal workers to exit and join all threads.
    ///
    /// Workers drain remaining tasks before exiting.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Notify under the lock so a worker between its shutdown check and
        // its wait cannot miss the wakeup
        {
            let _state = self.inner.state.lock();
            self.inner.work_ready.notify_all();
        }

        // A task that drops the last handle to its own pool cannot join itself
        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        let worker_count = self.inner.state.lock().live_workers;
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count,
            max_workers: self.inner.max_workers,
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// RAII guard that decrements `active_tasks` and notifies drain waiters on drop.
///
/// Keeps the bookkeeping right when a task panics; otherwise `drain()` would
/// wait forever on an inflated count.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _state = self.inner.state.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.heap.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    state.live_workers -= 1;
                    return;
                }
                state.idle_workers += 1;
                let timed_out = inner
                    .work_ready
                    .wait_for(&mut state, inner.idle_timeout)
                    .timed_out();
                state.idle_workers -= 1;
                if timed_out && state.heap.is_empty() {
                    state.live_workers -= 1;
                    debug!(target: "geocache::pool", pool = %inner.name, live = state.live_workers, "Idle worker exiting");
                    return;
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };

        // Execute outside the lock. catch_unwind keeps the worker alive if a
        // task panics; the guard handles bookkeeping either way.
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            error!(
                target: "geocache::pool",
                pool = %inner.name,
                "background task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

/// Countdown latch for fan-out / fan-in
///
/// A caller creates a latch for `n` tasks, hands each task a
/// [`LatchGuard`], and waits. Guards count down when dropped, so a panicking
/// task still releases the waiter.
#[derive(Clone)]
pub struct CompletionLatch {
    inner: Arc<(ParkingMutex<usize>, Condvar)>,
}

impl CompletionLatch {
    /// Latch expecting `count` completions
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((ParkingMutex::new(count), Condvar::new())),
        }
    }

    /// Guard that counts down once when dropped
    pub fn guard(&self) -> LatchGuard {
        LatchGuard {
            latch: self.clone(),
        }
    }

    /// Record one completion
    pub fn count_down(&self) {
        let (count, cond) = &*self.inner;
        let mut count = count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                cond.notify_all();
            }
        }
    }

    /// Outstanding completions
    pub fn remaining(&self) -> usize {
        *self.inner.0.lock()
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        let (count, cond) = &*self.inner;
        let mut count = count.lock();
        while *count > 0 {
            cond.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or the timeout elapses
    ///
    /// Returns true if the count reached zero.
    #[cfg(test)]
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let (count, cond) = &*self.inner;
        let mut count = count.lock();
        let deadline = std::time::Instant::now() + timeout;
        while *count > 0 {
            if cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Counts a [`CompletionLatch`] down when dropped
pub struct LatchGuard {
    latch: CompletionLatch,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

/// The spill and fetch pools of one cache
pub struct IoPools {
    /// Write side: spill batches, removals, partition deletes
    pub spill: BackgroundScheduler,
    /// Read side: demand fetches for queries
    pub fetch: BackgroundScheduler,
}

impl IoPools {
    /// Build both pools from the configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            spill: BackgroundScheduler::new(
                "spill",
                config.spill_threads(),
                config.max_queue_depth,
                config.idle_timeout(),
            ),
            fetch: BackgroundScheduler::new(
                "fetch",
                config.fetch_threads(),
                config.max_queue_depth,
                config.idle_timeout(),
            ),
        }
    }

    /// Wait for both pools to go idle
    pub fn drain(&self) {
        self.spill.drain();
        self.fetch.drain();
    }

    /// Stop both pools, running what is queued first
    pub fn shutdown(&self) {
        self.fetch.shutdown();
        self.spill.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn scheduler(workers: usize, depth: usize) -> BackgroundScheduler {
        BackgroundScheduler::new("test", workers, depth, Duration::from_secs(30))
    }

    /// Occupy the single worker until the returned barrier is released
    fn block_worker(scheduler: &BackgroundScheduler) -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Maintenance, move || {
                b.wait();
            })
            .unwrap();
        // Wait until the worker picks up the barrier task
        std::thread::sleep(Duration::from_millis(50));
        barrier
    }

    // ========================================
    // Scheduler Tests
    // ========================================

    #[test]
    fn test_no_workers_until_first_submit() {
        let scheduler = scheduler(4, 4096);
        assert_eq!(scheduler.stats().worker_count, 0);
        scheduler.submit(TaskPriority::Retrieve, || {}).unwrap();
        scheduler.drain();
        let stats = scheduler.stats();
        assert!(stats.worker_count >= 1 && stats.worker_count <= 4);
        assert_eq!(stats.max_workers, 4);
        scheduler.shutdown();
    }

    #[test]
    fn test_submit_and_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::BulkInsert, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        assert_eq!(scheduler.stats().tasks_completed, 10);
        scheduler.shutdown();
    }

    #[test]
    fn test_priority_ordering() {
        let scheduler = scheduler(1, 4096);
        let barrier = block_worker(&scheduler);

        let order = Arc::new(ParkingMutex::new(Vec::new()));
        for (priority, label) in [
            (TaskPriority::Maintenance, "maintenance"),
            (TaskPriority::BulkInsert, "bulk"),
            (TaskPriority::Retrieve, "retrieve"),
            (TaskPriority::Removal, "removal"),
        ] {
            let o = Arc::clone(&order);
            scheduler
                .submit(priority, move || {
                    o.lock().push(label);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();
        assert_eq!(
            *order.lock(),
            vec!["removal", "retrieve", "bulk", "maintenance"]
        );
        scheduler.shutdown();
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let scheduler = scheduler(1, 4096);
        let barrier = block_worker(&scheduler);

        let order = Arc::new(ParkingMutex::new(Vec::new()));
        for i in 0..5 {
            let o = Arc::clone(&order);
            scheduler
                .submit(TaskPriority::Retrieve, move || {
                    o.lock().push(i);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        scheduler.shutdown();
    }

    #[test]
    fn test_backpressure() {
        let scheduler = scheduler(1, 2);
        let barrier = block_worker(&scheduler);

        scheduler.submit(TaskPriority::BulkInsert, || {}).unwrap();
        scheduler.submit(TaskPriority::BulkInsert, || {}).unwrap();
        let result = scheduler.submit(TaskPriority::BulkInsert, || {});
        assert!(matches!(result, Err(BackpressureError::QueueFull { depth: 2, .. })));

        barrier.wait();
        scheduler.drain();
        scheduler.shutdown();
    }

    #[test]
    fn test_idle_workers_time_out() {
        let scheduler = BackgroundScheduler::new("idle", 2, 4096, Duration::from_millis(20));
        scheduler.submit(TaskPriority::Retrieve, || {}).unwrap();
        scheduler.drain();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(scheduler.stats().worker_count, 0);

        // Pool restarts workers on demand
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        scheduler
            .submit(TaskPriority::Retrieve, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_drains_remaining() {
        let scheduler = scheduler(1, 4096);
        let barrier = block_worker(&scheduler);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::BulkInsert, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.shutdown();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let scheduler = scheduler(2, 4096);
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        let result = scheduler.submit(TaskPriority::Removal, || {});
        assert!(matches!(result, Err(BackpressureError::ShutDown(_))));
        // Idempotent
        scheduler.shutdown();
    }

    #[test]
    fn test_task_panic_does_not_hang_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .submit(TaskPriority::Retrieve, || {
                panic!("intentional test panic");
            })
            .unwrap();
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Retrieve, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert_eq!(scheduler.stats().tasks_completed, 6);
        scheduler.shutdown();
    }

    #[test]
    fn test_concurrent_submits() {
        let scheduler = Arc::new(scheduler(2, 4096));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&scheduler);
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let c = Arc::clone(&c);
                        s.submit(TaskPriority::BulkInsert, move || {
                            c.fetch_add(1, AtomicOrdering::Relaxed);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 400);
        scheduler.shutdown();
    }

    // ========================================
    // Latch Tests
    // ========================================

    #[test]
    fn test_latch_waits_for_all_guards() {
        let scheduler = scheduler(4, 4096);
        let latch = CompletionLatch::new(8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let guard = latch.guard();
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Retrieve, move || {
                    let _guard = guard;
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        latch.wait();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 8);
        assert_eq!(latch.remaining(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_latch_released_by_panicking_task() {
        let scheduler = scheduler(1, 4096);
        let latch = CompletionLatch::new(1);
        let guard = latch.guard();
        scheduler
            .submit(TaskPriority::Retrieve, move || {
                let _guard = guard;
                panic!("intentional test panic");
            })
            .unwrap();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        scheduler.shutdown();
    }

    #[test]
    fn test_latch_timeout() {
        let latch = CompletionLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_io_pools_from_config() {
        let config = CacheConfig::default();
        let pools = IoPools::from_config(&config);
        assert_eq!(pools.spill.name(), "spill");
        assert_eq!(pools.fetch.stats().max_workers, config.fetch_threads());
        pools.drain();
        pools.shutdown();
    }
}
