//! Broadcast state distributor.
//!
//! A [`Distributor`] owns one authoritative value and fans fresh snapshots
//! of it out to any number of consumer handles. Mutation never happens in
//! place where a reader could see it: producers submit *change closures*
//! through lock-free channels, the distributor applies them all at once
//! inside [`Distributor::run_cycle`] (normally driven by a
//! [`Scheduler`](crate::Scheduler)), and every consumer then receives its
//! own immutable boxed copy of the result.
//!
//! Consumers coalesce: a snapshot that was not read before the next one was
//! published is dropped, never queued. Each consumer therefore sees a
//! strictly newest-first but possibly sparse view of the state history.
//!
//! Three consumer flavors exist:
//!
//! - [`Getter`]: non-blocking `update()` + `get()`, safe on real-time threads
//! - [`BlockingGetter`]: `update()` waits for the next cycle to answer
//! - [`Awaiter`]: waits for pending changes to be applied, holds no value

use std::mem;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use smallbox::{smallbox, space, SmallBox};
use tracing::trace;

use crate::channel::Channel;
use crate::scheduler::{RunCycle, SchedulerShared};

/// A change closure, stored inline up to four machine words.
///
/// Closures that outgrow the inline capacity spill to the heap, the same
/// policy the default channel send follows when its node pool runs dry; a
/// producer that must never allocate keeps its captures small and uses
/// [`Producer::submit_if_available`].
pub type Change<S> = SmallBox<dyn FnMut(&mut S) + Send, space::S4>;

type OnChange<S> = Box<dyn FnMut(&S) + Send>;

/// Poll interval for blocking handles when no scheduler is attached.
const UNATTACHED_POLL_MS: u64 = 1;

/// Whether a blocking wait should sleep or busy-spin between polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Sleep for roughly one scheduler period between polls.
    Sleep,
    /// Busy-wait with a spin hint. Burns a core, reacts immediately.
    Spin,
}

/// Node preallocation counts used when a distributor builds handle channels.
#[derive(Clone, Copy, Debug)]
pub struct DistributorConfig {
    /// Nodes seeded into each producer's change channel.
    pub change_nodes: usize,
    /// Nodes seeded into each consumer's snapshot channel.
    pub snapshot_nodes: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            change_nodes: 32,
            snapshot_nodes: 2,
        }
    }
}

struct ProducerLink<S> {
    changes: Channel<Change<S>>,
}

struct GetterLink<S> {
    /// Snapshots travelling to the consumer.
    inbound: Channel<Box<S>>,
    /// Retired snapshots travelling back for reclamation.
    outbound: Channel<Box<S>>,
}

struct BlockingLink<S> {
    inbound: Channel<Box<S>>,
    outbound: Channel<Box<S>>,
    /// One token per outstanding `update()` call.
    requests: Channel<()>,
}

struct AwaiterLink {
    requests: Channel<()>,
    acks: Channel<()>,
}

struct Registry<S> {
    producers: Vec<Arc<ProducerLink<S>>>,
    getters: Vec<Arc<GetterLink<S>>>,
    blocking: Vec<Arc<BlockingLink<S>>>,
    awaiters: Vec<Arc<AwaiterLink>>,
}

impl<S> Registry<S> {
    fn new() -> Self {
        Self {
            producers: Vec::new(),
            getters: Vec::new(),
            blocking: Vec::new(),
            awaiters: Vec::new(),
        }
    }
}

fn remove_link<L>(list: &mut Vec<Arc<L>>, link: &Arc<L>) {
    if let Some(pos) = list.iter().position(|entry| Arc::ptr_eq(entry, link)) {
        list.remove(pos);
    }
}

struct CycleState<S> {
    state: S,
    on_change: Option<OnChange<S>>,
}

pub(crate) struct Core<S> {
    /// Authoritative state plus the change callback. Locked by the cycle
    /// while applying changes and briefly by handle creation to seed local
    /// copies; never locked on a consumer's update path.
    cycle: Mutex<CycleState<S>>,
    /// Handle lists. Its lock is the registration lock; the cycle holds it
    /// only long enough to snapshot the lists, so registering never waits
    /// on change application.
    registry: Mutex<Registry<S>>,
    /// The scheduler currently driving this distributor, if any. Blocking
    /// handles read their poll period through it.
    pub(crate) attached: Mutex<Weak<SchedulerShared>>,
    config: DistributorConfig,
}

impl<S: Clone + Send + 'static> Core<S> {
    fn run_cycle(&self) {
        let (producers, getters, blocking, awaiters) = {
            let registry = self.registry.lock();
            (
                registry.producers.clone(),
                registry.getters.clone(),
                registry.blocking.clone(),
                registry.awaiters.clone(),
            )
        };

        // Reclaim snapshots the consumers retired since the last cycle. The
        // emptied carriers land on each inbound pool, ready for the
        // publishes below.
        for getter in &getters {
            getter.outbound.drain_into(&getter.inbound);
        }
        for handle in &blocking {
            handle.outbound.drain_into(&handle.inbound);
        }

        // Collect requests before draining any producer: a request taken
        // here was sent before the apply pass below, so the answer is
        // guaranteed to cover every change submitted ahead of it.
        let asked: Vec<bool> = blocking
            .iter()
            .map(|handle| handle.requests.receive_all_fifo(|_| {}) > 0)
            .collect();
        let awaited: Vec<bool> = awaiters
            .iter()
            .map(|awaiter| awaiter.requests.receive_all_fifo(|_| {}) > 0)
            .collect();

        let mut cycle = self.cycle.lock();
        let CycleState { state, on_change } = &mut *cycle;

        let mut changes = 0;
        for producer in &producers {
            changes += producer
                .changes
                .receive_all_fifo(|mut change| (&mut *change)(&mut *state));
        }

        if changes > 0 {
            trace!(changes, "applied changes, publishing snapshots");
            if let Some(callback) = on_change.as_mut() {
                callback(state);
            }
            for getter in &getters {
                getter.inbound.discard_pending();
                getter.inbound.send(Box::new(state.clone()));
            }
        }

        // Blocking handles are answered every cycle they asked, changed or
        // not.
        for (handle, &asked) in blocking.iter().zip(&asked) {
            if asked {
                handle.inbound.discard_pending();
                handle.inbound.send(Box::new(state.clone()));
            }
        }
        drop(cycle);

        for (awaiter, &awaited) in awaiters.iter().zip(&awaited) {
            if awaited {
                awaiter.acks.discard_pending();
                awaiter.acks.send(());
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        let period = self
            .attached
            .lock()
            .upgrade()
            .map(|scheduler| scheduler.period_ms())
            .unwrap_or(UNATTACHED_POLL_MS);
        Duration::from_millis(period + 1)
    }
}

impl<S: Clone + Send + 'static> RunCycle for Core<S> {
    fn run_cycle(&self) {
        Core::run_cycle(self)
    }

    fn attached(&self) -> &Mutex<Weak<SchedulerShared>> {
        &self.attached
    }
}

/// Shared-state broadcaster: one authoritative value, N producers of change
/// closures, M snapshot consumers.
///
/// `Distributor` is a cheap cloneable front over the shared core; clones
/// refer to the same state. Handles hold the core alive, so dropping every
/// `Distributor` clone while handles exist is harmless.
pub struct Distributor<S> {
    core: Arc<Core<S>>,
}

impl<S> Clone for Distributor<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: Clone + Send + 'static> Distributor<S> {
    pub fn new(initial: S) -> Self {
        Self::with_config(initial, DistributorConfig::default())
    }

    pub fn with_config(initial: S, config: DistributorConfig) -> Self {
        Self {
            core: Arc::new(Core {
                cycle: Mutex::new(CycleState {
                    state: initial,
                    on_change: None,
                }),
                registry: Mutex::new(Registry::new()),
                attached: Mutex::new(Weak::new()),
                config,
            }),
        }
    }

    /// Install a callback invoked inside the cycle whenever at least one
    /// change was applied, with the freshly mutated state.
    ///
    /// The callback runs with the state lock held: it must not request
    /// handles on this distributor or block on one of its cycles.
    pub fn set_on_change(&self, callback: impl FnMut(&S) + Send + 'static) {
        self.core.cycle.lock().on_change = Some(Box::new(callback));
    }

    /// Register a new producer handle. Takes the registration lock; legal
    /// whether or not a scheduler is running.
    pub fn request_producer(&self) -> Producer<S> {
        let link = Arc::new(ProducerLink {
            changes: Channel::with_pool(self.core.config.change_nodes),
        });
        self.core.registry.lock().producers.push(Arc::clone(&link));
        trace!("producer registered");
        Producer {
            link,
            core: Arc::clone(&self.core),
        }
    }

    /// Register a non-blocking consumer, seeded with a copy of the current
    /// state.
    pub fn request_getter(&self) -> Getter<S> {
        let local = Box::new(self.core.cycle.lock().state.clone());
        let link = Arc::new(GetterLink {
            inbound: Channel::with_pool(self.core.config.snapshot_nodes),
            outbound: Channel::new(),
        });
        self.core.registry.lock().getters.push(Arc::clone(&link));
        trace!("getter registered");
        Getter {
            local,
            link,
            core: Arc::clone(&self.core),
        }
    }

    /// Register a blocking consumer, seeded with a copy of the current
    /// state.
    pub fn request_blocking_getter(&self) -> BlockingGetter<S> {
        let local = Box::new(self.core.cycle.lock().state.clone());
        let link = Arc::new(BlockingLink {
            inbound: Channel::with_pool(self.core.config.snapshot_nodes),
            outbound: Channel::new(),
            requests: Channel::with_pool(2),
        });
        self.core.registry.lock().blocking.push(Arc::clone(&link));
        trace!("blocking getter registered");
        BlockingGetter {
            local,
            link,
            core: Arc::clone(&self.core),
        }
    }

    /// Register an awaiter: a handle that can wait for all changes
    /// submitted so far to be applied without holding a snapshot.
    pub fn request_awaiter(&self) -> Awaiter<S> {
        let link = Arc::new(AwaiterLink {
            requests: Channel::with_pool(2),
            acks: Channel::with_pool(2),
        });
        self.core.registry.lock().awaiters.push(Arc::clone(&link));
        trace!("awaiter registered");
        Awaiter {
            link,
            core: Arc::clone(&self.core),
        }
    }

    /// Run one apply-and-publish cycle.
    ///
    /// The attached scheduler calls this periodically; tests and custom
    /// drivers may call it directly. Must not race with itself: attach the
    /// distributor to at most one scheduler, or drive it from one place.
    pub fn run_cycle(&self) {
        self.core.run_cycle()
    }

    pub(crate) fn cycle_handle(&self) -> Arc<dyn RunCycle> {
        Arc::clone(&self.core) as Arc<dyn RunCycle>
    }

    #[cfg(test)]
    fn handle_counts(&self) -> (usize, usize, usize, usize) {
        let registry = self.core.registry.lock();
        (
            registry.producers.len(),
            registry.getters.len(),
            registry.blocking.len(),
            registry.awaiters.len(),
        )
    }
}

/// Producer handle: a private outbound channel of change closures.
///
/// Dropping the handle deregisters it; changes still queued at that moment
/// are discarded with it.
pub struct Producer<S> {
    link: Arc<ProducerLink<S>>,
    core: Arc<Core<S>>,
}

impl<S: Clone + Send + 'static> Producer<S> {
    /// Submit a change closure. Non-blocking; allocates a carrier node when
    /// the pool is empty. Returns `true` when a pooled node was reused.
    pub fn submit(&self, change: impl FnMut(&mut S) + Send + 'static) -> bool {
        let change: Change<S> = smallbox!(change);
        self.link.changes.send(change)
    }

    /// Submit a change closure only if a pooled carrier node is available,
    /// so the send never allocates. Returns whether the change was sent.
    pub fn submit_if_available(&self, change: impl FnMut(&mut S) + Send + 'static) -> bool {
        let change: Change<S> = smallbox!(change);
        self.link.changes.send_if_available(change).is_ok()
    }

    /// Grow this producer's node pool ahead of an expected burst.
    pub fn preallocate(&self, nodes: usize) {
        self.link.changes.preallocate(nodes);
    }
}

impl<S> Drop for Producer<S> {
    fn drop(&mut self) {
        remove_link(&mut self.core.registry.lock().producers, &self.link);
    }
}

/// Non-blocking consumer handle holding a locally owned snapshot.
pub struct Getter<S> {
    local: Box<S>,
    link: Arc<GetterLink<S>>,
    core: Arc<Core<S>>,
}

impl<S: Clone + Send + 'static> Getter<S> {
    /// Swap in the newest published snapshot if there is one. Lock-free,
    /// allocation-free, free of deallocation: the stale local copy rides
    /// the emptied carrier node back to the distributor for reclamation.
    ///
    /// Returns whether the local copy changed. Takes `&mut self`, so it
    /// cannot run concurrently with reads of [`Getter::get`] by design.
    pub fn update(&mut self) -> bool {
        if let Some(mut node) = self.link.inbound.receive_latest_node() {
            if let Some(fresh) = node.take() {
                let stale = mem::replace(&mut self.local, fresh);
                node.replace(stale);
                self.link.outbound.send_node(node);
                return true;
            }
            self.link.inbound.recycle_node(node);
        }
        false
    }

    /// The local snapshot. Stable until the next [`Getter::update`].
    pub fn get(&self) -> &S {
        &self.local
    }
}

impl<S> Drop for Getter<S> {
    fn drop(&mut self) {
        remove_link(&mut self.core.registry.lock().getters, &self.link);
    }
}

/// Blocking consumer handle: `update` waits for the next cycle to answer.
pub struct BlockingGetter<S> {
    local: Box<S>,
    link: Arc<BlockingLink<S>>,
    core: Arc<Core<S>>,
}

impl<S: Clone + Send + 'static> BlockingGetter<S> {
    /// Request a synchronized snapshot and wait for it.
    ///
    /// Sends a request token, then polls the inbound channel until the
    /// distributor's next cycle answers. There is no deadline: the call
    /// waits for as long as it takes the next cycle to run. With
    /// [`Wait::Sleep`] the thread sleeps roughly one scheduler period
    /// between polls; with [`Wait::Spin`] it busy-waits.
    pub fn update(&mut self, wait: Wait) {
        self.link.requests.send(());
        loop {
            if let Some(mut node) = self.link.inbound.receive_latest_node() {
                if let Some(fresh) = node.take() {
                    let stale = mem::replace(&mut self.local, fresh);
                    node.replace(stale);
                    self.link.outbound.send_node(node);
                    return;
                }
                self.link.inbound.recycle_node(node);
            }
            match wait {
                Wait::Sleep => thread::sleep(self.core.poll_interval()),
                Wait::Spin => std::hint::spin_loop(),
            }
        }
    }

    /// The local snapshot. Stable until the next call to
    /// [`BlockingGetter::update`].
    pub fn get(&self) -> &S {
        &self.local
    }
}

impl<S> Drop for BlockingGetter<S> {
    fn drop(&mut self) {
        remove_link(&mut self.core.registry.lock().blocking, &self.link);
    }
}

/// A handle that blocks until every change submitted before the call has
/// been applied, without ever holding a snapshot.
pub struct Awaiter<S> {
    link: Arc<AwaiterLink>,
    core: Arc<Core<S>>,
}

impl<S: Clone + Send + 'static> Awaiter<S> {
    /// Wait until the next cycle completes its apply step.
    pub fn wait(&mut self, wait: Wait) {
        self.link.requests.send(());
        loop {
            if self.link.acks.receive_latest().is_some() {
                return;
            }
            match wait {
                Wait::Sleep => thread::sleep(self.core.poll_interval()),
                Wait::Spin => std::hint::spin_loop(),
            }
        }
    }
}

impl<S> Drop for Awaiter<S> {
    fn drop(&mut self) {
        remove_link(&mut self.core.registry.lock().awaiters, &self.link);
    }
}
