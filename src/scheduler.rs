//! Periodic scheduler driving distributor cycles.
//!
//! One [`Scheduler`] owns one worker thread. Every attached distributor
//! gets its [`run_cycle`](crate::Distributor::run_cycle) invoked once per
//! pass, in attachment order, after which the worker sleeps for the
//! configured period. Attach and detach are legal whether the worker is
//! running or not; both go through the registry lock, so a cycle never
//! observes a half-registered distributor.
//!
//! Stopping is synchronous: `stop` signals the worker and joins it, which
//! bounds shutdown latency to roughly one pass plus one period (the stop
//! flag is checked on both sides of the sleep).

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::distributor::Distributor;

/// Capability a scheduler needs from anything it drives: run one cycle,
/// and expose the link recording which scheduler currently drives it.
pub(crate) trait RunCycle: Send + Sync {
    fn run_cycle(&self);
    fn attached(&self) -> &Mutex<Weak<SchedulerShared>>;
}

struct Entry {
    key: usize,
    cycle: Arc<dyn RunCycle>,
}

/// State shared between the scheduler front, its worker thread and the
/// attached distributors.
pub(crate) struct SchedulerShared {
    registry: Mutex<Vec<Entry>>,
    period_ms: AtomicU64,
    stop: AtomicBool,
    running: AtomicBool,
}

impl SchedulerShared {
    pub(crate) fn period_ms(&self) -> u64 {
        self.period_ms.load(Ordering::Acquire)
    }

    fn remove(&self, key: usize) -> Option<Arc<dyn RunCycle>> {
        let mut registry = self.registry.lock();
        let pos = registry.iter().position(|entry| entry.key == key)?;
        Some(registry.remove(pos).cycle)
    }
}

/// Stable identity of an attached distributor: the address of its core.
fn key_of(cycle: &Arc<dyn RunCycle>) -> usize {
    Arc::as_ptr(cycle) as *const () as usize
}

/// Default cycle period, matching a comfortably non-real-time control rate.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(250);

/// Periodic driver for one or more distributors.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                registry: Mutex::new(Vec::new()),
                period_ms: AtomicU64::new(period.as_millis() as u64),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Attach a distributor, so every pass of the worker runs its cycle.
    ///
    /// Attaching a distributor that is already attached to this scheduler
    /// is a no-op; one attached elsewhere is moved here. Legal while
    /// running.
    pub fn attach<S: Clone + Send + 'static>(&self, distributor: &Distributor<S>) {
        let cycle = distributor.cycle_handle();
        let key = key_of(&cycle);

        let mut link = cycle.attached().lock();
        if let Some(previous) = link.upgrade() {
            if Arc::ptr_eq(&previous, &self.shared) {
                return;
            }
            previous.remove(key);
        }
        *link = Arc::downgrade(&self.shared);
        self.shared.registry.lock().push(Entry { key, cycle: Arc::clone(&cycle) });
        trace!("distributor attached");
    }

    /// Detach a distributor. Returns whether it was attached here.
    pub fn detach<S: Clone + Send + 'static>(&self, distributor: &Distributor<S>) -> bool {
        let cycle = distributor.cycle_handle();
        match self.shared.remove(key_of(&cycle)) {
            Some(removed) => {
                let mut link = removed.attached().lock();
                // Leave the link alone if someone re-attached it elsewhere
                // in the meantime.
                if link.upgrade().map_or(true, |s| Arc::ptr_eq(&s, &self.shared)) {
                    *link = Weak::new();
                }
                trace!("distributor detached");
                true
            }
            None => false,
        }
    }

    /// Spawn the periodic worker. No-op when already running.
    pub fn start(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("statecast-scheduler".into())
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn scheduler worker");
        self.worker = Some(worker);
        debug!("scheduler started");
    }

    /// Signal the worker to terminate and join it. Synchronous; returns
    /// once the worker has finished its current pass. No-op when stopped.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("scheduler stopped");
        }
        self.shared.running.store(false, Ordering::Release);
    }

    /// Change the cycle period. Takes effect on the worker's next sleep.
    pub fn set_period(&self, period: Duration) {
        self.shared
            .period_ms
            .store(period.as_millis() as u64, Ordering::Release);
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.shared.period_ms())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn attached_count(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        // Orphan whatever is still attached so blocking handles fall back
        // to their unattached poll interval.
        let entries: Vec<Entry> = mem::take(&mut *self.shared.registry.lock());
        for entry in entries {
            let mut link = entry.cycle.attached().lock();
            if link.upgrade().map_or(true, |s| Arc::ptr_eq(&s, &self.shared)) {
                *link = Weak::new();
            }
        }
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        {
            let registry = shared.registry.lock();
            for entry in registry.iter() {
                entry.cycle.run_cycle();
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(shared.period_ms()));
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
    }
}
