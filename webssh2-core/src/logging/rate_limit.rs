use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use webssh2_common::{RateLimitConfig, Webssh2Error};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket stage. A rule targeting an event name gets its own
/// bucket; the `*` rule is one bucket shared by every event without a
/// dedicated rule. No matching rule means no limiting.
pub struct EventRateLimiter {
    per_event: HashMap<String, DirectLimiter>,
    shared: Option<DirectLimiter>,
    dropped: AtomicU64,
}

fn build_limiter(limit: u32, interval_ms: u64) -> Result<DirectLimiter, Webssh2Error> {
    let limit = NonZeroU32::new(limit)
        .ok_or_else(|| Webssh2Error::Config("rate limit must be nonzero".into()))?;
    // A bucket of `limit` tokens refilling evenly across the interval.
    let period = Duration::from_millis(interval_ms) / limit.get();
    let quota = Quota::with_period(period)
        .ok_or_else(|| Webssh2Error::Config("rate limit interval must be nonzero".into()))?
        .allow_burst(limit);
    Ok(RateLimiter::direct(quota))
}

impl EventRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, Webssh2Error> {
        let mut per_event = HashMap::new();
        let mut shared = None;
        for rule in &config.rules {
            let limiter = build_limiter(rule.limit, rule.interval_ms)?;
            if rule.target == "*" {
                shared = Some(limiter);
            } else {
                per_event.insert(rule.target.clone(), limiter);
            }
        }
        Ok(Self {
            per_event,
            shared,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn check(&self, event: &str) -> bool {
        let limiter = match self.per_event.get(event) {
            Some(limiter) => limiter,
            None => match &self.shared {
                Some(limiter) => limiter,
                None => return true,
            },
        };
        let allowed = limiter.check().is_ok();
        if !allowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
