//! Error types for statecast

use thiserror::Error;

/// A strict-policy send was rejected because the node pool was empty.
///
/// Carries the rejected payload back to the caller, so nothing is lost when
/// a real-time-adjacent producer declines to allocate. This is an expected,
/// recoverable condition: try again after the receiving side has recycled
/// some nodes, or fall back to an allocating [`Channel::send`].
///
/// [`Channel::send`]: crate::Channel::send
#[derive(Error)]
#[error("node pool exhausted")]
pub struct PoolExhausted<T>(pub T);

impl<T> PoolExhausted<T> {
    /// Take the rejected payload back.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::fmt::Debug for PoolExhausted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PoolExhausted(..)")
    }
}
