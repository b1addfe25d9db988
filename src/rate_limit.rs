use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;

/// Pacing for calls against a rate-limited remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Items allowed in flight at once.
    pub max_concurrent: usize,
    /// Minimum spacing between consecutive item starts.
    pub delay_per_item: Duration,
    /// Take a longer break after this many items (0 disables it).
    pub pause_every: usize,
    pub pause: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            delay_per_item: Duration::from_millis(100),
            pause_every: 25,
            pause: Duration::from_secs(5),
        }
    }
}

impl ThrottlePolicy {
    pub fn unthrottled() -> Self {
        Self {
            max_concurrent: 1,
            delay_per_item: Duration::ZERO,
            pause_every: 0,
            pause: Duration::ZERO,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Shared by every in-flight item. The periodic pause holds a gate that
/// `ready` also takes, so no new item starts during the break.
pub struct Throttle {
    policy: ThrottlePolicy,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pause_gate: Mutex<()>,
    completed: AtomicUsize,
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        // A zero period has no quota; treat it as "no spacing".
        let limiter = Quota::with_period(policy.delay_per_item).map(RateLimiter::direct);
        Self {
            policy,
            limiter,
            pause_gate: Mutex::new(()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Waits until the next item may start.
    pub async fn ready(&self) {
        drop(self.pause_gate.lock().await);
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Marks one item done, pausing when the periodic break is due.
    pub async fn finished(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.policy.pause_every > 0 && completed % self.policy.pause_every == 0 {
            let _gate = self.pause_gate.lock().await;
            tracing::info!(
                "Processed {} items, pausing for {:?}",
                completed,
                self.policy.pause
            );
            tokio::time::sleep(self.policy.pause).await;
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}
