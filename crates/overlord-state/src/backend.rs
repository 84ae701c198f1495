//! Where a [`crate::State`] sends its commits and wake-up requests

use std::io;
use std::time::Duration;

/// Sink for committed state and for ensure-loop wake requests.
///
/// Implementations must not take the state lock: both methods are called
/// while it is held.
pub trait Backend: Send + Sync {
    /// Durably stores the full serialized state.
    fn checkpoint(&self, data: &[u8]) -> io::Result<()>;

    /// Asks the ensure loop to run no later than `d` from now.
    fn ensure_before(&self, d: Duration);
}
