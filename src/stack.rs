//! Lock-free MPMC exchange stack.
//!
//! An intrusive LIFO stack that supports `push`, `push_chain` and an atomic
//! `pop_all`, but deliberately no single-element pop. Detaching the whole
//! chain in one swap is what makes the stack safe under arbitrary
//! multi-producer multi-consumer use: there is no moment where a consumer
//! holds a stale head pointer that another consumer could recycle, so the
//! classic ABA hazard of lock-free stacks never arises.
//!
//! # Design
//! - `push`: CAS loop on the head pointer, release on success
//! - `pop_all`: single atomic swap with null, acquire on the detached chain
//! - nodes link through an embedded forward pointer; a second backward
//!   pointer exists only for the FIFO replay pass in [`crate::channel`]

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

/// A heap-allocated carrier for one payload, linked into at most one stack
/// at any instant.
///
/// The payload lives in an `Option` slot so it can be moved out while the
/// node itself keeps circulating between the live stack and the pool.
pub(crate) struct Node<T> {
    pub(crate) slot: Option<T>,
    /// Forward link, used by the stack and by pool chains.
    pub(crate) next: *mut Node<T>,
    /// Backward link, written during the FIFO reversal pass and not valid
    /// anywhere else.
    pub(crate) prev: *mut Node<T>,
}

impl<T> Node<T> {
    /// Allocate a fresh unlinked node.
    pub(crate) fn alloc(slot: Option<T>) -> NonNull<Node<T>> {
        let node = Box::new(Node {
            slot,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Free one node, dropping any payload still in its slot.
    ///
    /// # Safety
    /// The caller must exclusively own `node`, and `node` must not be linked
    /// into any stack.
    pub(crate) unsafe fn free(node: NonNull<Node<T>>) {
        drop(Box::from_raw(node.as_ptr()));
    }
}

/// Walk the forward links to the last node of a chain.
///
/// # Safety
/// The caller must exclusively own the chain starting at `head`.
pub(crate) unsafe fn chain_tail<T>(head: NonNull<Node<T>>) -> NonNull<Node<T>> {
    let mut it = head;
    while let Some(next) = NonNull::new((*it.as_ptr()).next) {
        it = next;
    }
    it
}

/// Free a whole chain, dropping the payloads still held in the slots.
///
/// # Safety
/// The caller must exclusively own the chain starting at `head`.
pub(crate) unsafe fn free_chain<T>(head: Option<NonNull<Node<T>>>) {
    let mut it = head;
    while let Some(node) = it {
        it = NonNull::new((*node.as_ptr()).next);
        Node::free(node);
    }
}

/// Multi-producer multi-consumer pop-all LIFO stack.
///
/// Unbounded; the stack itself never allocates. Callers move node ownership
/// in on `push` and take ownership of the entire chain back on `pop_all`.
pub(crate) struct ExchangeStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
}

// SAFETY: nodes are only dereferenced by whichever thread currently owns
// them; the stack hands ownership over through acquire/release pairs on the
// head pointer.
unsafe impl<T: Send> Send for ExchangeStack<T> {}
unsafe impl<T: Send> Sync for ExchangeStack<T> {}

impl<T> ExchangeStack<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Push one node. Lock-free, never blocks, never allocates.
    pub(crate) fn push(&self, node: NonNull<Node<T>>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: until the CAS below succeeds the node is still owned
            // by this thread, so writing its forward link is not a race.
            unsafe {
                (*node.as_ptr()).next = head;
            }
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Push an already-linked chain in one shot.
    ///
    /// The chain keeps its internal order; `head` becomes the new top of the
    /// stack. `tail` must be the last node reachable from `head`.
    pub(crate) fn push_chain(&self, head: NonNull<Node<T>>, tail: NonNull<Node<T>>) {
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the chain is exclusively owned until the CAS succeeds.
            unsafe {
                (*tail.as_ptr()).next = current;
            }
            match self.head.compare_exchange_weak(
                current,
                head.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    /// Atomically detach and return the entire chain, leaving the stack
    /// empty. Returns the most recently pushed node first.
    pub(crate) fn pop_all(&self) -> Option<NonNull<Node<T>>> {
        NonNull::new(self.head.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Advisory emptiness check; the answer can be stale by the time the
    /// caller acts on it.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for ExchangeStack<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self means no other thread can still push.
        unsafe { free_chain(self.pop_all()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn collect(stack: &ExchangeStack<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        let mut it = stack.pop_all();
        while let Some(node) = it {
            unsafe {
                out.extend((*node.as_ptr()).slot.take());
                it = NonNull::new((*node.as_ptr()).next);
                Node::free(node);
            }
        }
        out
    }

    #[test]
    fn test_pop_all_is_lifo() {
        let stack = ExchangeStack::new();
        for i in 1..=3 {
            stack.push(Node::alloc(Some(i)));
        }
        assert_eq!(collect(&stack), vec![3, 2, 1]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_pop_all_on_empty() {
        let stack = ExchangeStack::<i32>::new();
        assert!(stack.pop_all().is_none());
    }

    #[test]
    fn test_push_chain_keeps_order() {
        let stack = ExchangeStack::new();
        stack.push(Node::alloc(Some(0)));

        // Build a detached chain 1 -> 2 -> 3 and push it on top.
        let head = Node::alloc(Some(1));
        let mid = Node::alloc(Some(2));
        let tail = Node::alloc(Some(3));
        unsafe {
            (*head.as_ptr()).next = mid.as_ptr();
            (*mid.as_ptr()).next = tail.as_ptr();
        }
        stack.push_chain(head, tail);

        assert_eq!(collect(&stack), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_chain_tail_walks_to_last() {
        let head = Node::alloc(Some(1));
        let tail = Node::alloc(Some(2));
        unsafe {
            (*head.as_ptr()).next = tail.as_ptr();
            assert_eq!(chain_tail(head).as_ptr(), tail.as_ptr());
            free_chain(Some(head));
        }
    }

    #[test]
    fn test_concurrent_push_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: i32 = 1000;

        let stack = Arc::new(ExchangeStack::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(Node::alloc(Some(t as i32 * PER_THREAD + i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut values = collect(&stack);
        values.sort_unstable();
        let expected: Vec<i32> = (0..THREADS as i32 * PER_THREAD).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_concurrent_pop_all_partitions_pushes() {
        const PUSHERS: usize = 4;
        const PER_THREAD: usize = 500;

        let stack = Arc::new(ExchangeStack::new());
        let poppers: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    let mut seen = 0usize;
                    for _ in 0..10_000 {
                        let mut it = stack.pop_all();
                        while let Some(node) = it {
                            unsafe {
                                it = NonNull::new((*node.as_ptr()).next);
                                Node::free(node);
                            }
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();
        let pushers: Vec<_> = (0..PUSHERS)
            .map(|_| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(Node::alloc(Some(i as i32)));
                    }
                })
            })
            .collect();
        for handle in pushers {
            handle.join().unwrap();
        }
        let mut total: usize = poppers.into_iter().map(|h| h.join().unwrap()).sum();

        // Whatever the poppers missed is still on the stack.
        let mut it = stack.pop_all();
        while let Some(node) = it {
            unsafe {
                it = NonNull::new((*node.as_ptr()).next);
                Node::free(node);
            }
            total += 1;
        }
        assert_eq!(total, PUSHERS * PER_THREAD);
    }
}
