//! Per-sender message rate limiting.
//!
//! Fixed-window reset: 100 messages per rolling 60-second window per sender.
//! Not a true sliding average; a burst at the end of one window plus another
//! at the start of the next is permitted.
//!
//! The lock is held only across a single map lookup/update.  A background
//! sweeper evicts records idle for more than five minutes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const MAX_PER_WINDOW: u32 = 100;
pub const WINDOW: Duration = Duration::from_secs(60);
const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct WindowRecord {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    records: Mutex<HashMap<String, WindowRecord>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Account one send attempt for `user`; returns whether it is allowed.
    pub fn allow(&self, user: &str) -> bool {
        let now = Instant::now();
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(user) {
            None => {
                records.insert(
                    user.to_owned(),
                    WindowRecord {
                        count: 1,
                        window_start: now,
                    },
                );
                true
            }
            Some(record) if now.duration_since(record.window_start) >= WINDOW => {
                record.count = 1;
                record.window_start = now;
                true
            }
            Some(record) if record.count < MAX_PER_WINDOW => {
                record.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Drop records whose window started more than five minutes ago.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| now.duration_since(record.window_start) <= IDLE_EVICTION);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "rate limiter swept idle senders");
        }
    }

    pub fn tracked_senders(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Periodic sweep until shutdown flips.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => limiter.sweep(),
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hundredth_message_allowed_hundred_first_denied() {
        let limiter = RateLimiter::new();
        for n in 1..=MAX_PER_WINDOW {
            assert!(limiter.allow("alice"), "message {n} should pass");
        }
        assert!(!limiter.allow("alice"), "message 101 must be denied");
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_sixty_seconds() {
        let limiter = RateLimiter::new();
        for _ in 0..MAX_PER_WINDOW {
            assert!(limiter.allow("alice"));
        }
        assert!(!limiter.allow("alice"));

        tokio::time::advance(WINDOW).await;
        assert!(limiter.allow("alice"), "fresh window admits again");
    }

    #[tokio::test(start_paused = true)]
    async fn senders_are_limited_independently() {
        let limiter = RateLimiter::new();
        for _ in 0..MAX_PER_WINDOW {
            assert!(limiter.allow("alice"));
        }
        assert!(!limiter.allow("alice"));
        assert!(limiter.allow("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_idle_records() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("old"));
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(limiter.allow("fresh"));
        tokio::time::advance(Duration::from_secs(90)).await;

        limiter.sweep();
        assert_eq!(limiter.tracked_senders(), 1, "only 'fresh' survives");
        // The swept sender starts a brand-new window.
        assert!(limiter.allow("old"));
    }
}
