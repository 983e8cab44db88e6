//! Wall-clock readings tied to the tokio clock.
//!
//! Persisted timestamps are wall-clock (RFC 3339), while sleeps use tokio time.
//! `Clock` anchors both at construction so that a paused tokio clock in tests also
//! pauses the wall-clock view, and auto-advance moves both together.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self { Self { origin_utc: Utc::now(), origin: Instant::now() } }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        self.origin_utc + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Time left until `at`, zero if already passed.
    pub fn until(&self, at: DateTime<Utc>) -> std::time::Duration {
        (at - self.now()).to_std().unwrap_or_default()
    }
}

impl Default for Clock {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_tokio_time() {
        let clock = Clock::new();
        let t0 = clock.now();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let t1 = clock.now();
        assert_eq!((t1 - t0).num_seconds(), 30);
        assert_eq!(clock.until(t0), Duration::ZERO);
        assert_eq!(clock.until(t1 + chrono::Duration::seconds(5)), Duration::from_secs(5));
    }
}
