//! Single-consumer push variant for one real-time reader.
//!
//! Where the [`Distributor`](crate::Distributor) fans snapshots out to many
//! consumers on a schedule, [`RealtimeValue`] covers the common simpler
//! case: exactly one real-time reader and any number of ordinary-thread
//! writers. There is no periodic worker; writers publish synchronously at
//! the call site and pay the allocation and locking cost themselves, so the
//! reader side stays completely free of locks, allocation and deallocation.
//!
//! Publication is a single node hand-off of a fully constructed boxed
//! value. The reader can never observe a half-written instance, because
//! values are built privately under the writer lock and only then pushed
//! through the channel.
//!
//! Retired values come back to the writers through a second channel and are
//! freed opportunistically on the next publish; the reader never calls a
//! deallocator.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;

/// Default number of preallocated carrier nodes.
pub const DEFAULT_NODES: usize = 128;

struct Shared<T> {
    /// Fresh values travelling to the reader.
    fresh: Channel<Box<T>>,
    /// Values the reader swapped out, waiting to be freed by a writer.
    retired: Channel<Box<T>>,
    /// The last published value; writers serialize on it and base every
    /// new publication on it, never on the instance the reader holds.
    last: Mutex<T>,
}

/// A value owned by one real-time reader and updated by N writers.
pub struct RealtimeValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> RealtimeValue<T> {
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_NODES)
    }

    /// Control how many carrier nodes are preallocated. The pool only
    /// matters for node reuse; each publish still clones the value.
    pub fn with_capacity(initial: T, nodes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                fresh: Channel::with_pool(nodes),
                retired: Channel::new(),
                last: Mutex::new(initial),
            }),
        }
    }

    /// Split into a cloneable writer handle and the unique reader handle.
    pub fn split(self) -> (RealtimeWriter<T>, RealtimeReader<T>) {
        let local = Box::new(self.shared.last.lock().clone());
        (
            RealtimeWriter {
                shared: Arc::clone(&self.shared),
            },
            RealtimeReader {
                local,
                shared: self.shared,
            },
        )
    }
}

/// Writer handle. Cloneable; writers serialize on an internal lock.
pub struct RealtimeWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RealtimeWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> RealtimeWriter<T> {
    /// Apply `transform` to the last published value and publish the
    /// result. Blocks other writers for the duration of the transform;
    /// never blocks the reader.
    pub fn change(&self, transform: impl FnOnce(&mut T)) {
        let mut last = self.shared.last.lock();
        transform(&mut last);
        self.publish(&last);
    }

    /// Like [`RealtimeWriter::change`], but only when `predicate` accepts
    /// the current value. Returns whether the change was applied.
    pub fn change_if(
        &self,
        transform: impl FnOnce(&mut T),
        predicate: impl FnOnce(&T) -> bool,
    ) -> bool {
        let mut last = self.shared.last.lock();
        if !predicate(&last) {
            return false;
        }
        transform(&mut last);
        self.publish(&last);
        true
    }

    /// A copy of the last published value.
    pub fn snapshot(&self) -> T {
        self.shared.last.lock().clone()
    }

    /// Free values the reader has retired since the last publish. Publishes
    /// do this on their own; calling it from any non-real-time thread just
    /// tightens the bound on how long retired values linger.
    pub fn reclaim(&self) -> usize {
        self.shared.retired.drain_into(&self.shared.fresh)
    }

    fn publish(&self, value: &T) {
        self.shared.retired.drain_into(&self.shared.fresh);
        self.shared.fresh.send(Box::new(value.clone()));
    }
}

/// The unique reader handle; move it to the real-time thread.
pub struct RealtimeReader<T> {
    local: Box<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> RealtimeReader<T> {
    /// The current value, updated to the newest publication if one arrived.
    ///
    /// Lock-free and allocation-free: a new value is swapped into the
    /// held box's place and the old box rides the emptied carrier node back
    /// for a writer to free. The reference is stable until the next `get`.
    pub fn get(&mut self) -> &T {
        if let Some(mut node) = self.shared.fresh.receive_latest_node() {
            if let Some(fresh) = node.take() {
                let stale = mem::replace(&mut self.local, fresh);
                node.replace(stale);
                self.shared.retired.send_node(node);
            } else {
                self.shared.fresh.recycle_node(node);
            }
        }
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_starts_with_initial_value() {
        let (_writer, mut reader) = RealtimeValue::new(7i32).split();
        assert_eq!(*reader.get(), 7);
    }

    #[test]
    fn test_reader_sees_latest_publication() {
        let (writer, mut reader) = RealtimeValue::new(0i32).split();
        writer.change(|v| *v = 1);
        writer.change(|v| *v = 2);
        writer.change(|v| *v = 3);
        // Intermediate values coalesce away.
        assert_eq!(*reader.get(), 3);
    }

    #[test]
    fn test_change_if_honors_predicate() {
        let (writer, mut reader) = RealtimeValue::new(5i32).split();
        assert!(!writer.change_if(|v| *v = 100, |v| *v > 10));
        assert!(writer.change_if(|v| *v = 100, |v| *v == 5));
        assert_eq!(*reader.get(), 100);
        assert_eq!(writer.snapshot(), 100);
    }

    #[test]
    fn test_nodes_circulate_without_growth() {
        const NODES: usize = 4;
        let (writer, mut reader) = RealtimeValue::with_capacity(0u32, NODES).split();

        for i in 1..=20u32 {
            writer.change(|v| *v = i);
            assert_eq!(*reader.get(), i);
            let (f_pending, f_pooled) = writer.shared.fresh.node_count();
            let (r_pending, r_pooled) = writer.shared.retired.node_count();
            assert_eq!(f_pending + f_pooled + r_pending + r_pooled, NODES);
        }
    }

    #[test]
    fn test_reader_never_sees_torn_value() {
        #[derive(Clone)]
        struct Pair {
            a: u64,
            b: u64,
        }

        const WRITERS: usize = 4;
        const PER_WRITER: u64 = 2_000;

        let (writer, mut reader) = RealtimeValue::new(Pair { a: 0, b: 0 }).split();

        let reader_thread = thread::spawn(move || {
            let mut highest = 0;
            loop {
                let pair = reader.get();
                // Every published value was built whole under the writer
                // lock; a mismatch would mean a torn read.
                assert_eq!(pair.a, pair.b);
                assert!(pair.a >= highest);
                highest = pair.a;
                if highest == (WRITERS as u64) * PER_WRITER {
                    return reader;
                }
                thread::yield_now();
            }
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for _ in 0..PER_WRITER {
                        writer.change(|p| {
                            p.a += 1;
                            p.b += 1;
                        });
                    }
                })
            })
            .collect();
        for handle in writers {
            handle.join().unwrap();
        }

        let mut reader = reader_thread.join().unwrap();
        let last = reader.get();
        assert_eq!(last.a, (WRITERS as u64) * PER_WRITER);
    }
}
