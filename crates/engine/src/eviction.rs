//! Payload eviction
//!
//! Eviction reclaims payloads only. Entries and their store references stay
//! in memory for the life of the record, and an entry without a reference
//! (spill still in flight) is never evicted.
//!
//! A pass scans the entry map once, sorts evictable entries by last-used
//! stamp and drops payloads oldest first until the resident count reaches
//! the target:
//!
//! | pressure | target                         |
//! |----------|--------------------------------|
//! | nominal  | pool size                      |
//! | warning  | max(pool size / 2, min resident) |
//! | critical | min resident                   |
//!
//! Background passes run on a dedicated thread owned by
//! [`EvictionController`]. Requests arriving within the debounce window are
//! coalesced into one pass aiming at the lowest requested target.

use geocache_core::{Error, Result};
use geocache_storage::EntryMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Memory status reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MemoryPressure {
    /// No pressure
    #[default]
    Nominal,
    /// Memory is getting low
    Warning,
    /// Memory is critically low
    Critical,
}

impl MemoryPressure {
    /// Resident payload count to aim for under this status
    pub fn resident_target(self, pool_size: usize, min_resident: usize) -> usize {
        match self {
            MemoryPressure::Nominal => pool_size,
            MemoryPressure::Warning => (pool_size / 2).max(min_resident),
            MemoryPressure::Critical => min_resident,
        }
    }
}

/// Source of memory status
pub trait MemoryMonitor: Send + Sync {
    /// Current status
    fn status(&self) -> MemoryPressure;
}

/// Counters of one eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    /// Entries visited by the scan
    pub scanned: usize,
    /// Resident payloads when the pass started
    pub resident_before: usize,
    /// Resident entries skipped because they have no reference yet
    pub unspilled: usize,
    /// Evictable entries found
    pub candidates: usize,
    /// Payloads dropped
    pub evicted: usize,
}

/// Evict least recently used payloads until at most `target` are resident
///
/// Unspilled payloads are counted as resident but never dropped, so the
/// target can be missed when too few entries are durable.
pub fn evict_to_target(entries: &EntryMap, target: usize) -> EvictionStats {
    let resident_before = entries.resident_count();
    let mut stats = EvictionStats {
        resident_before,
        ..EvictionStats::default()
    };
    if resident_before <= target {
        return stats;
    }

    let scan = entries.scan();
    stats.scanned = scan.scanned;
    stats.unspilled = scan.unspilled;
    stats.candidates = scan.candidates.len();

    let deficit = resident_before - target;
    for candidate in scan.candidates {
        if stats.evicted >= deficit {
            break;
        }
        if entries.evict(&candidate.entry) {
            stats.evicted += 1;
        }
    }
    stats
}

/// Eviction sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Resident payloads allowed under nominal pressure
    pub pool_size: usize,
    /// Floor for pressure-driven passes
    pub min_resident: usize,
    /// Coalescing window of background passes
    pub debounce: Duration,
}

impl EvictionPolicy {
    /// Target for a pressure status
    pub fn target(&self, pressure: MemoryPressure) -> usize {
        pressure.resident_target(self.pool_size, self.min_resident)
    }

    /// Target that leaves room for `incoming` new payloads, if one is needed
    pub fn headroom_target(&self, resident: usize, incoming: usize) -> Option<usize> {
        if resident + incoming <= self.pool_size {
            return None;
        }
        Some(self.pool_size.saturating_sub(incoming).max(self.min_resident))
    }
}

struct ControllerShared {
    entries: Arc<EntryMap>,
    policy: EvictionPolicy,
    pending: Mutex<Option<usize>>,
    wake: Condvar,
    shutdown: AtomicBool,
    passes: AtomicU64,
    last: Mutex<Option<EvictionStats>>,
}

impl ControllerShared {
    fn run_loop(&self) {
        loop {
            let target = {
                let mut pending = self.pending.lock();
                while pending.is_none() && !self.shutdown.load(Ordering::Acquire) {
                    self.wake.wait(&mut pending);
                }
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }

                // Later requests inside the window fold into this pass
                let deadline = Instant::now() + self.policy.debounce;
                while !self.shutdown.load(Ordering::Acquire) {
                    if self.wake.wait_until(&mut pending, deadline).timed_out() {
                        break;
                    }
                }
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                pending.take()
            };

            if let Some(target) = target {
                let stats = evict_to_target(&self.entries, target);
                self.passes.fetch_add(1, Ordering::Relaxed);
                if stats.evicted + target < stats.resident_before {
                    warn!(
                        target: "geocache::eviction",
                        target_resident = target,
                        resident_before = stats.resident_before,
                        evicted = stats.evicted,
                        unspilled = stats.unspilled,
                        "Eviction fell short of target"
                    );
                } else {
                    debug!(
                        target: "geocache::eviction",
                        target_resident = target,
                        evicted = stats.evicted,
                        scanned = stats.scanned,
                        "Eviction pass complete"
                    );
                }
                *self.last.lock() = Some(stats);
            }
        }
    }
}

/// Background eviction thread
///
/// # Example
///
/// ```ignore
/// let controller = EvictionController::start(Arc::clone(&entries), policy)?;
/// controller.request(MemoryPressure::Warning);
/// // ...
/// controller.shutdown();
/// ```
pub struct EvictionController {
    shared: Arc<ControllerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionController {
    /// Spawn the eviction thread
    ///
    /// # Errors
    ///
    /// Returns `Error::SchedulerError` if the thread cannot be spawned.
    pub fn start(entries: Arc<EntryMap>, policy: EvictionPolicy) -> Result<Self> {
        let shared = Arc::new(ControllerShared {
            entries,
            policy,
            pending: Mutex::new(None),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            last: Mutex::new(None),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("geocache-evict".to_string())
            .spawn(move || worker.run_loop())
            .map_err(|e| Error::SchedulerError(format!("eviction thread could not be spawned: {e}")))?;
        info!(target: "geocache::eviction", pool_size = policy.pool_size, min_resident = policy.min_resident, "Eviction controller started");
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Sizing in effect
    pub fn policy(&self) -> EvictionPolicy {
        self.shared.policy
    }

    /// Schedule a background pass for a pressure status
    pub fn request(&self, pressure: MemoryPressure) {
        self.request_target(self.shared.policy.target(pressure));
    }

    /// Schedule a pass making room for `incoming` payloads, if needed
    ///
    /// Returns whether a pass was requested.
    pub fn request_headroom(&self, incoming: usize) -> bool {
        let resident = self.shared.entries.resident_count();
        match self.shared.policy.headroom_target(resident, incoming) {
            Some(target) => {
                self.request_target(target);
                true
            }
            None => false,
        }
    }

    fn request_target(&self, target: usize) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.shared.pending.lock();
        *pending = Some(pending.map_or(target, |p| p.min(target)));
        self.shared.wake.notify_one();
    }

    /// Run a pass on the calling thread
    pub fn run_now(&self, pressure: MemoryPressure) -> EvictionStats {
        let stats = evict_to_target(&self.shared.entries, self.shared.policy.target(pressure));
        *self.shared.last.lock() = Some(stats);
        stats
    }

    /// Background passes completed
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    /// Stats of the most recent pass
    pub fn last_stats(&self) -> Option<EvictionStats> {
        *self.shared.last.lock()
    }

    /// Stop the thread and wait for it
    ///
    /// A pass already running completes first. Idempotent.
    pub fn shutdown(&self) {
        {
            let _pending = self.shared.pending.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(target: "geocache::eviction", "Eviction thread panicked");
            }
        }
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for EvictionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WatcherShared {
    shutdown: AtomicBool,
    observed: Mutex<MemoryPressure>,
}

/// Polls a [`MemoryMonitor`] and requests eviction on escalation
///
/// A pass is requested each time the status changes to warning or
/// critical. Returning to nominal requests nothing.
pub struct PressureWatcher {
    shared: Arc<WatcherShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PressureWatcher {
    /// Spawn the polling thread
    ///
    /// # Errors
    ///
    /// Returns `Error::SchedulerError` if the thread cannot be spawned.
    pub fn start(
        monitor: Arc<dyn MemoryMonitor>,
        controller: Arc<EvictionController>,
        interval: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(WatcherShared {
            shutdown: AtomicBool::new(false),
            observed: Mutex::new(MemoryPressure::Nominal),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("geocache-pressure".to_string())
            .spawn(move || {
                let step = Duration::from_millis(10).min(interval);
                while !worker.shutdown.load(Ordering::Relaxed) {
                    let status = monitor.status();
                    let previous = std::mem::replace(&mut *worker.observed.lock(), status);
                    if status != previous && status != MemoryPressure::Nominal {
                        debug!(target: "geocache::eviction", ?previous, ?status, "Memory pressure changed");
                        controller.request(status);
                    }

                    let mut elapsed = Duration::ZERO;
                    while elapsed < interval {
                        if worker.shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(step);
                        elapsed += step;
                    }
                }
            })
            .map_err(|e| Error::SchedulerError(format!("pressure watcher could not be spawned: {e}")))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Last status seen
    pub fn observed(&self) -> MemoryPressure {
        *self.shared.observed.lock()
    }

    /// Stop polling and wait for the thread
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(target: "geocache::eviction", "Pressure watcher panicked");
            }
        }
    }
}

impl Drop for PressureWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocache_core::{PartSet, Payload, RecordId, TimeSpan, TypeKey, VisualState};
    use geocache_storage::{CacheEntry, Presence, RegistryRef, StoreRef};
    use proptest::prelude::*;

    fn policy(pool_size: usize, min_resident: usize) -> EvictionPolicy {
        EvictionPolicy {
            pool_size,
            min_resident,
            debounce: Duration::from_millis(5),
        }
    }

    /// `count` resident entries; the first `spilled` carry a reference
    fn populate(count: u64, spilled: u64) -> Arc<EntryMap> {
        let map = Arc::new(EntryMap::new());
        for i in 1..=count {
            let entry = map.insert(
                RecordId::new(i),
                CacheEntry::new(
                    TypeKey::new("t"),
                    TimeSpan::ALL,
                    VisualState::new(),
                    Payload::new(Some(i), None, None),
                    map.tick(),
                ),
            );
            if i <= spilled {
                let presence = Presence::new(PartSet::ORIGIN_ID);
                entry.attach_store_ref(StoreRef::Registry(RegistryRef::new(i, presence)));
            }
        }
        map
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // ========================================================================
    // Targets
    // ========================================================================

    #[test]
    fn test_pressure_targets() {
        assert_eq!(MemoryPressure::Nominal.resident_target(100, 10), 100);
        assert_eq!(MemoryPressure::Warning.resident_target(100, 10), 50);
        assert_eq!(MemoryPressure::Warning.resident_target(100, 80), 80);
        assert_eq!(MemoryPressure::Critical.resident_target(100, 10), 10);
    }

    #[test]
    fn test_headroom_target() {
        let p = policy(100, 10);
        assert_eq!(p.headroom_target(50, 50), None);
        assert_eq!(p.headroom_target(90, 20), Some(80));
        assert_eq!(p.headroom_target(90, 200), Some(10));
    }

    // ========================================================================
    // Passes
    // ========================================================================

    #[test]
    fn test_evicts_oldest_first() {
        let map = populate(10, 10);
        // Refresh the two oldest so they survive
        let stamp = map.tick();
        map.touch(RecordId::new(1), stamp);
        map.touch(RecordId::new(2), stamp);

        let stats = evict_to_target(&map, 4);
        assert_eq!(stats.resident_before, 10);
        assert_eq!(stats.evicted, 6);
        assert_eq!(map.resident_count(), 4);

        let resident: Vec<u64> = map
            .ids()
            .into_iter()
            .filter(|id| map.get(*id).map_or(false, |e| e.payload().is_some()))
            .map(|id| id.as_u64())
            .collect();
        assert_eq!(resident, vec![1, 2, 9, 10]);
    }

    #[test]
    fn test_unspilled_entries_are_never_evicted() {
        let map = populate(10, 3);
        let stats = evict_to_target(&map, 0);
        assert_eq!(stats.unspilled, 7);
        assert_eq!(stats.candidates, 3);
        assert_eq!(stats.evicted, 3);
        assert_eq!(map.resident_count(), 7);
        for i in 4..=10 {
            assert!(map.get(RecordId::new(i)).unwrap().payload().is_some());
        }
    }

    #[test]
    fn test_under_target_skips_scan() {
        let map = populate(5, 5);
        let stats = evict_to_target(&map, 5);
        assert_eq!(stats.scanned, 0);
        assert_eq!(stats.evicted, 0);
    }

    proptest! {
        #[test]
        fn test_pass_meets_target_when_enough_are_durable(
            count in 1u64..60,
            spilled_share in 0u64..=100,
            target in 0usize..80,
        ) {
            let spilled = count * spilled_share / 100;
            let map = populate(count, spilled);
            let stats = evict_to_target(&map, target);

            let unspilled = (count - spilled) as usize;
            prop_assert_eq!(map.resident_count(), (count as usize).min(target.max(unspilled)));
            prop_assert!(stats.evicted <= spilled as usize);
            for i in spilled + 1..=count {
                prop_assert!(map.get(RecordId::new(i)).unwrap().payload().is_some());
            }
        }
    }

    // ========================================================================
    // Controller
    // ========================================================================

    #[test]
    fn test_controller_coalesces_to_lowest_target() {
        let map = populate(100, 100);
        let controller = EvictionController::start(Arc::clone(&map), policy(80, 10)).unwrap();

        controller.request(MemoryPressure::Warning);
        controller.request(MemoryPressure::Critical);
        controller.request(MemoryPressure::Nominal);

        assert!(wait_for(|| map.resident_count() == 10));
        assert!(wait_for(|| controller.passes() >= 1));
        controller.shutdown();
        assert!(controller.is_shutdown());
        assert_eq!(map.resident_count(), 10);
    }

    #[test]
    fn test_controller_headroom() {
        let map = populate(50, 50);
        let controller = EvictionController::start(Arc::clone(&map), policy(60, 0)).unwrap();

        assert!(!controller.request_headroom(10));
        assert!(controller.request_headroom(20));
        assert!(wait_for(|| map.resident_count() == 40));
        controller.shutdown();
    }

    #[test]
    fn test_run_now_is_synchronous() {
        let map = populate(30, 30);
        let controller = EvictionController::start(Arc::clone(&map), policy(20, 5)).unwrap();
        let stats = controller.run_now(MemoryPressure::Nominal);
        assert_eq!(stats.evicted, 10);
        assert_eq!(controller.last_stats(), Some(stats));
        assert_eq!(map.resident_count(), 20);
    }

    #[test]
    fn test_requests_after_shutdown_are_ignored() {
        let map = populate(10, 10);
        let controller = EvictionController::start(Arc::clone(&map), policy(5, 0)).unwrap();
        controller.shutdown();
        controller.shutdown();
        controller.request(MemoryPressure::Critical);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(map.resident_count(), 10);
    }

    // ========================================================================
    // Watcher
    // ========================================================================

    struct ScriptedMonitor(Mutex<MemoryPressure>);

    impl MemoryMonitor for ScriptedMonitor {
        fn status(&self) -> MemoryPressure {
            *self.0.lock()
        }
    }

    #[test]
    fn test_watcher_requests_on_escalation() {
        let map = populate(40, 40);
        let controller = Arc::new(EvictionController::start(Arc::clone(&map), policy(40, 4)).unwrap());
        let monitor = Arc::new(ScriptedMonitor(Mutex::new(MemoryPressure::Nominal)));
        let watcher = PressureWatcher::start(
            Arc::clone(&monitor) as Arc<dyn MemoryMonitor>,
            Arc::clone(&controller),
            Duration::from_millis(5),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(map.resident_count(), 40);

        *monitor.0.lock() = MemoryPressure::Warning;
        assert!(wait_for(|| map.resident_count() == 20));
        assert!(wait_for(|| watcher.observed() == MemoryPressure::Warning));

        *monitor.0.lock() = MemoryPressure::Critical;
        assert!(wait_for(|| map.resident_count() == 4));

        watcher.shutdown();
        controller.shutdown();
    }
}
