//! Node-pooled message channel built on two exchange stacks.
//!
//! A [`Channel`] pairs a *live* stack of pending messages with a *pool*
//! stack of free nodes. Sending takes a node from the pool (or allocates
//! one under the default policy), fills it and pushes it on the live stack;
//! receiving detaches the whole live chain and recycles the carrier nodes
//! back into the pool. Once the pool is primed, sends and receives move
//! nodes around without touching the allocator.
//!
//! Two receive disciplines are provided:
//!
//! - [`Channel::receive_latest`] keeps only the newest message and discards
//!   the rest, for state-style channels where intermediate values are
//!   worthless the moment a newer one exists
//! - [`Channel::receive_all_fifo`] replays every message in submission
//!   order, for command-style channels where each message must be applied
//!
//! The stack hands back chains newest-first, so FIFO replay caches the
//! reverse order through each node's backward link in a single pass before
//! applying.
//!
//! Discarded payloads are never dropped on the receiving thread: they stay
//! in their recycled node until the next sender overwrites the slot, which
//! keeps receive paths safe to call from real-time threads.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::PoolExhausted;
use crate::stack::{chain_tail, free_chain, ExchangeStack, Node};

/// A node owned by the caller rather than by a channel.
///
/// Obtained from [`Channel::receive_latest_node`] and moved back into a
/// channel with [`Channel::send_node`] or [`Channel::recycle_node`]. Holding
/// the node itself lets a consumer swap payloads in place and hand the
/// carrier straight to another channel without copying anything. Dropping an
/// `OwnedNode` frees the node and whatever payload it still holds.
pub struct OwnedNode<T> {
    raw: NonNull<Node<T>>,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: an OwnedNode is exclusive ownership of one unlinked node.
unsafe impl<T: Send> Send for OwnedNode<T> {}

impl<T> OwnedNode<T> {
    pub(crate) fn from_raw(raw: NonNull<Node<T>>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    fn into_raw(self) -> NonNull<Node<T>> {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    /// Move the payload out, leaving the node empty.
    pub fn take(&mut self) -> Option<T> {
        // SAFETY: we own the node exclusively.
        unsafe { (*self.raw.as_ptr()).slot.take() }
    }

    /// Store a payload, returning the previous one if the node was full.
    pub fn replace(&mut self, payload: T) -> Option<T> {
        // SAFETY: we own the node exclusively.
        unsafe { (*self.raw.as_ptr()).slot.replace(payload) }
    }

    /// True when the node currently carries no payload.
    pub fn is_empty(&self) -> bool {
        // SAFETY: we own the node exclusively.
        unsafe { (*self.raw.as_ptr()).slot.is_none() }
    }
}

impl<T> Drop for OwnedNode<T> {
    fn drop(&mut self) {
        // SAFETY: we own the node exclusively and it is not linked anywhere.
        unsafe { Node::free(self.raw) }
    }
}

/// Lock-free channel with an embedded node pool.
///
/// All operations are non-blocking. `send` may allocate when the pool is
/// empty; `send_if_available` never does. Multiple senders and multiple
/// receivers may operate concurrently from any threads.
pub struct Channel<T> {
    live: ExchangeStack<T>,
    pool: ExchangeStack<T>,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            live: ExchangeStack::new(),
            pool: ExchangeStack::new(),
        }
    }

    /// A channel whose pool is seeded with `nodes` empty nodes.
    pub fn with_pool(nodes: usize) -> Self {
        let channel = Self::new();
        channel.preallocate(nodes);
        channel
    }

    /// Detach one node from the pool, returning the remainder of the chain.
    fn pop_pooled(&self) -> Option<NonNull<Node<T>>> {
        let head = self.pool.pop_all()?;
        // SAFETY: the chain is detached and exclusively ours.
        unsafe {
            let rest = (*head.as_ptr()).next;
            (*head.as_ptr()).next = ptr::null_mut();
            if let Some(rest) = NonNull::new(rest) {
                let tail = chain_tail(rest);
                self.pool.push_chain(rest, tail);
            }
        }
        Some(head)
    }

    /// Send a payload, taking a node from the pool or allocating one if the
    /// pool is empty. Non-blocking.
    ///
    /// Returns `true` when a pooled node was reused, `false` when a new node
    /// had to be allocated. Any stale payload left in the reused node is
    /// dropped here, on the sending thread.
    pub fn send(&self, payload: T) -> bool {
        match self.pop_pooled() {
            Some(node) => {
                // SAFETY: the node was just detached from the pool.
                unsafe {
                    (*node.as_ptr()).slot = Some(payload);
                }
                self.live.push(node);
                true
            }
            None => {
                self.live.push(Node::alloc(Some(payload)));
                false
            }
        }
    }

    /// Send a payload only if a pooled node is available; never allocates.
    ///
    /// On pool exhaustion the payload comes back inside the error.
    pub fn send_if_available(&self, payload: T) -> Result<(), PoolExhausted<T>> {
        match self.pop_pooled() {
            Some(node) => {
                // SAFETY: the node was just detached from the pool.
                unsafe {
                    (*node.as_ptr()).slot = Some(payload);
                }
                self.live.push(node);
                Ok(())
            }
            None => Err(PoolExhausted(payload)),
        }
    }

    /// Push an already-owned node onto the live stack without touching its
    /// payload. The zero-copy publish path for heap-sized payloads.
    pub fn send_node(&self, node: OwnedNode<T>) {
        self.live.push(node.into_raw());
    }

    /// Return an owned node to the pool for reuse.
    pub fn recycle_node(&self, node: OwnedNode<T>) {
        self.pool.push(node.into_raw());
    }

    /// Receive the most recently sent payload, discarding everything older.
    ///
    /// Intermediate messages are never delivered: their nodes go straight
    /// back to the pool with payloads retained until reuse.
    pub fn receive_latest(&self) -> Option<T> {
        let head = self.live.pop_all()?;
        // SAFETY: the chain is detached and exclusively ours.
        unsafe {
            let payload = (*head.as_ptr()).slot.take();
            let tail = chain_tail(head);
            self.pool.push_chain(head, tail);
            payload
        }
    }

    /// Like [`Channel::receive_latest`] but keeps the newest message inside
    /// its carrier node, so the caller can swap payloads and forward the
    /// node elsewhere.
    pub fn receive_latest_node(&self) -> Option<OwnedNode<T>> {
        let head = self.live.pop_all()?;
        // SAFETY: the chain is detached and exclusively ours.
        unsafe {
            let rest = (*head.as_ptr()).next;
            (*head.as_ptr()).next = ptr::null_mut();
            if let Some(rest) = NonNull::new(rest) {
                let tail = chain_tail(rest);
                self.pool.push_chain(rest, tail);
            }
        }
        Some(OwnedNode::from_raw(head))
    }

    /// Receive every pending payload in submission order, then recycle the
    /// whole chain. Returns the number of payloads handled.
    pub fn receive_all_fifo(&self, mut action: impl FnMut(T)) -> usize {
        let Some(head) = self.live.pop_all() else {
            return 0;
        };
        let mut handled = 0;
        // SAFETY: the chain is detached and exclusively ours for the whole
        // reversal and replay.
        unsafe {
            // pop_all yields newest first; cache the reverse order through
            // the backward links, then replay from the oldest end.
            (*head.as_ptr()).prev = ptr::null_mut();
            let mut tail = head.as_ptr();
            while !(*tail).next.is_null() {
                let next = (*tail).next;
                (*next).prev = tail;
                tail = next;
            }
            let mut it = tail;
            while !it.is_null() {
                if let Some(payload) = (*it).slot.take() {
                    action(payload);
                    handled += 1;
                }
                it = (*it).prev;
            }
            self.pool.push_chain(head, NonNull::new_unchecked(tail));
        }
        handled
    }

    /// Discard all pending messages, recycling their nodes. Payloads stay in
    /// the recycled nodes until a sender overwrites them, so this is safe on
    /// a real-time thread. Returns the number of messages discarded.
    pub fn discard_pending(&self) -> usize {
        let Some(head) = self.live.pop_all() else {
            return 0;
        };
        // SAFETY: the chain is detached and exclusively ours.
        unsafe {
            let mut count = 1;
            let mut tail = head.as_ptr();
            while !(*tail).next.is_null() {
                tail = (*tail).next;
                count += 1;
            }
            self.pool.push_chain(head, NonNull::new_unchecked(tail));
            count
        }
    }

    /// Discard all pending messages and free their nodes. Teardown helper;
    /// drops payloads on the calling thread.
    pub fn discard_and_free_pending(&self) {
        // SAFETY: the chain is detached and exclusively ours.
        unsafe { free_chain(self.live.pop_all()) }
    }

    /// Free every node currently in the pool.
    pub fn free_pool(&self) {
        // SAFETY: the chain is detached and exclusively ours.
        unsafe { free_chain(self.pool.pop_all()) }
    }

    /// Drop every pending payload and park the emptied nodes on `target`'s
    /// pool.
    ///
    /// This is the reclamation half of a channel pair: retired values come
    /// back on one channel and their carriers are fed to the other channel's
    /// pool, so the pair circulates a fixed set of nodes. Payloads are
    /// dropped here, on the calling thread, which must therefore not be a
    /// real-time one.
    pub fn drain_into(&self, target: &Channel<T>) -> usize {
        let Some(head) = self.live.pop_all() else {
            return 0;
        };
        // SAFETY: the chain is detached and exclusively ours.
        unsafe {
            let mut count = 1;
            let mut tail = head.as_ptr();
            loop {
                drop((*tail).slot.take());
                if (*tail).next.is_null() {
                    break;
                }
                tail = (*tail).next;
                count += 1;
            }
            target.pool.push_chain(head, NonNull::new_unchecked(tail));
            count
        }
    }

    /// Eagerly allocate `count` empty nodes into the pool, guaranteeing that
    /// many sends without allocation.
    pub fn preallocate(&self, count: usize) {
        self.seed(count, || None)
    }

    /// Like [`Channel::preallocate`] but seeds each node with a payload from
    /// `init`, for pools that should start with constructed values.
    pub fn preallocate_with(&self, count: usize, mut init: impl FnMut() -> T) {
        self.seed(count, || Some(init()))
    }

    fn seed(&self, count: usize, mut fill: impl FnMut() -> Option<T>) {
        if count == 0 {
            return;
        }
        let head = Node::alloc(fill());
        let mut tail = head;
        for _ in 1..count {
            let node = Node::alloc(fill());
            // SAFETY: nodes are freshly allocated and not yet shared.
            unsafe {
                (*tail.as_ptr()).next = node.as_ptr();
            }
            tail = node;
        }
        self.pool.push_chain(head, tail);
    }

    /// Advisory check, mainly useful to decide whether a strict send has any
    /// chance of succeeding.
    pub fn pool_is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Total nodes currently held by this channel as (pending, pooled).
    ///
    /// Counts by detaching and re-attaching both chains, so it must not race
    /// with other users; it exists for tests and diagnostics.
    #[cfg(test)]
    pub(crate) fn node_count(&self) -> (usize, usize) {
        fn count_and_restore<T>(stack: &ExchangeStack<T>) -> usize {
            let Some(head) = stack.pop_all() else {
                return 0;
            };
            // SAFETY: the chain is detached and exclusively ours.
            unsafe {
                let mut count = 1;
                let mut tail = head.as_ptr();
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                    count += 1;
                }
                stack.push_chain(head, NonNull::new_unchecked(tail));
                count
            }
        }
        (count_and_restore(&self.live), count_and_restore(&self.pool))
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_receive_latest_keeps_newest() {
        let channel = Channel::new();
        channel.send(1);
        channel.send(2);
        channel.send(3);

        assert_eq!(channel.receive_latest(), Some(3));
        assert_eq!(channel.receive_latest(), None);
        // The discarded carriers are back in the pool.
        assert_eq!(channel.node_count(), (0, 3));
    }

    #[test]
    fn test_receive_all_fifo_replays_submission_order() {
        let channel = Channel::new();
        for i in 1..=5 {
            channel.send(i);
        }

        let mut log = String::new();
        let handled = channel.receive_all_fifo(|v: i32| log.push_str(&v.to_string()));
        assert_eq!(handled, 5);
        assert_eq!(log, "12345");
    }

    #[test]
    fn test_send_reports_node_reuse() {
        let channel = Channel::new();
        assert!(!channel.send(1)); // empty pool, allocated
        channel.receive_latest();
        assert!(channel.send(2)); // carrier came back, reused
    }

    #[test]
    fn test_strict_send_bounded_by_pool() {
        let channel = Channel::with_pool(4);
        for i in 0..4 {
            assert!(channel.send_if_available(i).is_ok());
        }
        let err = channel.send_if_available(99).unwrap_err();
        assert_eq!(err.into_inner(), 99);

        // Receiving recycles the carriers and strict sends work again.
        assert_eq!(channel.receive_latest(), Some(3));
        assert!(channel.send_if_available(100).is_ok());
    }

    #[test]
    fn test_node_conservation() {
        const SEEDED: usize = 8;
        let channel = Channel::with_pool(SEEDED);

        for round in 0..50 {
            for i in 0..4 {
                assert!(channel.send_if_available(round * 10 + i).is_ok());
            }
            if round % 2 == 0 {
                channel.receive_latest();
            } else {
                channel.receive_all_fifo(|_| {});
            }
            let (pending, pooled) = channel.node_count();
            assert_eq!(pending + pooled, SEEDED);
        }
    }

    #[test]
    fn test_preallocate_with_seeds_full_nodes() {
        let channel = Channel::new();
        channel.preallocate_with(3, || 7);
        assert_eq!(channel.node_count(), (0, 3));
        // Seeded nodes are free carriers like any other.
        for i in 0..3 {
            assert!(channel.send_if_available(i).is_ok());
        }
        assert!(channel.send_if_available(3).is_err());
    }

    #[test]
    fn test_node_swap_round_trip() {
        let inbound = Channel::new();
        let outbound = Channel::new();

        inbound.send(Box::new(42u64));
        let mut node = inbound.receive_latest_node().unwrap();

        // Swap payloads the way a consumer updates its local copy.
        let mut local = Box::new(0u64);
        let fresh = node.take().unwrap();
        let stale = std::mem::replace(&mut local, fresh);
        assert_eq!(*local, 42);
        assert!(node.is_empty());
        assert!(node.replace(stale).is_none());
        outbound.send_node(node);

        // The stale value travels back intact.
        assert_eq!(outbound.receive_latest(), Some(Box::new(0u64)));
    }

    #[test]
    fn test_drain_into_moves_nodes_across_channels() {
        let retired = Channel::new();
        let fresh = Channel::<Arc<u32>>::new();

        let payload = Arc::new(5u32);
        for _ in 0..3 {
            retired.send(Arc::clone(&payload));
        }
        assert_eq!(Arc::strong_count(&payload), 4);

        assert_eq!(retired.drain_into(&fresh), 3);
        // Payloads were dropped during the drain, nodes moved to `fresh`.
        assert_eq!(Arc::strong_count(&payload), 1);
        assert_eq!(fresh.node_count(), (0, 3));
        assert_eq!(retired.node_count(), (0, 0));
    }

    #[test]
    fn test_discard_pending_recycles() {
        let channel = Channel::with_pool(2);
        channel.send(1);
        channel.send(2);
        assert_eq!(channel.discard_pending(), 2);
        assert_eq!(channel.receive_latest(), None);
        assert_eq!(channel.node_count(), (0, 2));
    }

    #[test]
    fn test_drop_frees_pending_and_pooled_payloads() {
        let payload = Arc::new(1u32);
        {
            let channel = Channel::new();
            channel.send(Arc::clone(&payload));
            channel.send(Arc::clone(&payload));
            channel.receive_latest(); // leaves one stale payload in the pool
            channel.send(Arc::clone(&payload));
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_concurrent_senders_keep_per_thread_order() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 1000;

        let channel = Arc::new(Channel::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        channel.send((t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut received: Vec<(u64, u64)> = Vec::new();
        channel.receive_all_fifo(|pair| received.push(pair));
        assert_eq!(received.len(), (THREADS * PER_THREAD) as usize);

        // FIFO replay must preserve each sender's submission order.
        let mut next = [0u64; THREADS as usize];
        for (t, i) in received {
            assert_eq!(i, next[t as usize]);
            next[t as usize] += 1;
        }
    }
}
