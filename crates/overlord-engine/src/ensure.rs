//! Wake-up requests for the ensure loop
//!
//! Any number of `ensure_before` calls collapse into one pending deadline,
//! the earliest one asked for.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Stand-in deadline for requests too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + d`, saturating instead of overflowing.
pub(crate) fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or(now + FAR_FUTURE)
}

#[derive(Debug, Default)]
pub struct EnsureTimer {
    requested: Mutex<Option<Instant>>,
    changed: Notify,
}

impl EnsureTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an ensure pass no later than `d` from now. Never pushes an
    /// earlier pending request back.
    pub fn ensure_before(&self, d: Duration) {
        let when = deadline_after(d);
        {
            let mut requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
            match *requested {
                Some(pending) if pending <= when => return,
                _ => *requested = Some(when),
            }
        }
        self.changed.notify_one();
    }

    /// The pending deadline, if any.
    pub fn requested(&self) -> Option<Instant> {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears and returns the pending deadline. Called right before a pass so
    /// requests made during the pass survive it.
    pub fn take(&self) -> Option<Instant> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Resolves when the pending deadline moved earlier.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// When the next pass is due: the pending deadline or `fallback`, whichever comes first.
    pub fn next_deadline(&self, fallback: Instant) -> Instant {
        match self.requested() {
            Some(at) => at.min(fallback),
            None => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_keep_earliest_deadline() {
        let timer = EnsureTimer::new();
        timer.ensure_before(Duration::from_secs(60));
        let late = timer.requested().unwrap();
        timer.ensure_before(Duration::from_secs(1));
        let early = timer.requested().unwrap();
        assert!(early < late);
        timer.ensure_before(Duration::from_secs(30));
        assert_eq!(timer.requested(), Some(early));
    }

    #[tokio::test]
    async fn huge_request_saturates() {
        let timer = EnsureTimer::new();
        timer.ensure_before(Duration::MAX);
        let far = timer.requested().unwrap();
        assert!(far > Instant::now() + Duration::from_secs(86400 * 365));
        timer.ensure_before(Duration::ZERO);
        assert!(timer.requested().unwrap() < far);
    }

    #[tokio::test]
    async fn take_clears_pending_request() {
        let timer = EnsureTimer::new();
        assert!(timer.take().is_none());
        timer.ensure_before(Duration::ZERO);
        assert!(timer.take().is_some());
        assert!(timer.requested().is_none());
    }

    #[tokio::test]
    async fn request_before_wait_is_not_lost() {
        let timer = EnsureTimer::new();
        timer.ensure_before(Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(1), timer.changed())
            .await
            .expect("stored wake-up");
    }

    #[tokio::test]
    async fn fallback_used_without_request() {
        let timer = EnsureTimer::new();
        let fallback = Instant::now() + Duration::from_secs(5);
        assert_eq!(timer.next_deadline(fallback), fallback);
        timer.ensure_before(Duration::ZERO);
        assert!(timer.next_deadline(fallback) < fallback);
    }
}
