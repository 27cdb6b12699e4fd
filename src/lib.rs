//! Statecast - lock-free state sharing for real-time threads
//!
//! This library provides allocation-minimized primitives for sharing and
//! updating state across threads with different latency requirements:
//! typically one or more real-time threads that must never block, allocate
//! or take a lock, and ordinary threads that produce updates.
//!
//! # Architecture
//!
//! - **[`Channel`]**: lock-free exchange-and-recycle messaging. Carrier
//!   nodes circulate between a live stack and a pool, so a primed channel
//!   sends and receives without touching the allocator.
//! - **[`Distributor`]**: owns one authoritative value; producers submit
//!   change closures, a periodic cycle applies them and broadcasts fresh
//!   immutable snapshots to every consumer handle.
//! - **[`Scheduler`]**: one worker thread driving the cycles of any number
//!   of attached distributors.
//! - **[`RealtimeValue`]**: the single-reader shortcut; writers publish
//!   synchronously, the one real-time reader swaps in whole values.
//!
//! # The real-time rules
//!
//! Consumer-side operations never lock, never allocate and never free:
//! discarded values always travel back through a channel to be reclaimed
//! on a non-real-time thread. Producer-side operations may allocate (or
//! can be told not to with the `*_if_available` variants); registration
//! and deregistration take short locks and belong on ordinary threads.

pub mod channel;
pub mod distributor;
pub mod error;
pub mod realtime;
pub mod scheduler;
mod stack;

pub use channel::{Channel, OwnedNode};
pub use distributor::{
    Awaiter, BlockingGetter, Change, Distributor, DistributorConfig, Getter, Producer, Wait,
};
pub use error::PoolExhausted;
pub use realtime::{RealtimeReader, RealtimeValue, RealtimeWriter};
pub use scheduler::{Scheduler, DEFAULT_PERIOD};
