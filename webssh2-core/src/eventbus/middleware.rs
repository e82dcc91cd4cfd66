use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::*;

use super::{EventCategory, EventEnvelope};

pub enum MiddlewareDecision {
    Continue(EventEnvelope),
    Drop(&'static str),
}

/// One stage of the pre-delivery chain. Stages run in registration order;
/// a `Drop` short-circuits the rest.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, event: EventEnvelope) -> MiddlewareDecision;
}

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        trace!(category = ?event.category, name = %event.name, "Bus event");
        MiddlewareDecision::Continue(event)
    }
}

#[derive(Default)]
pub struct BusMetrics {
    published: AtomicU64,
    per_category: [AtomicU64; 6],
}

impl BusMetrics {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn published_for(&self, category: EventCategory) -> u64 {
        self.per_category[Self::index(category)].load(Ordering::Relaxed)
    }

    fn index(category: EventCategory) -> usize {
        match category {
            EventCategory::Auth => 0,
            EventCategory::Connection => 1,
            EventCategory::Terminal => 2,
            EventCategory::Session => 3,
            EventCategory::System => 4,
            EventCategory::Recording => 5,
        }
    }
}

pub struct MetricsMiddleware {
    metrics: Arc<BusMetrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<BusMetrics>) -> Self {
        Self { metrics }
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        self.metrics.per_category[BusMetrics::index(event.category)]
            .fetch_add(1, Ordering::Relaxed);
        MiddlewareDecision::Continue(event)
    }
}

const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Catches pathological envelopes before they reach subscribers.
pub struct ErrorHandlingMiddleware;

impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &'static str {
        "error-handling"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        let size = serde_json::to_vec(&event.payload).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > MAX_PAYLOAD_BYTES {
            return MiddlewareDecision::Drop("payload too large");
        }
        MiddlewareDecision::Continue(event)
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RateLimitMiddleware {
    limiter: DirectLimiter,
}

impl RateLimitMiddleware {
    pub fn new(limit: u32, interval: Duration) -> Self {
        let limit = NonZeroU32::new(limit.max(1)).expect("nonzero after max");
        let period = interval / limit.get();
        let quota = Quota::with_period(period.max(Duration::from_nanos(1)))
            .expect("nonzero period")
            .allow_burst(limit);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        if self.limiter.check().is_ok() {
            MiddlewareDecision::Continue(event)
        } else {
            MiddlewareDecision::Drop("rate_limit")
        }
    }
}

/// Drops events identical to one seen within the window. Identity is the
/// hash of (category, name, session, payload); ids and timestamps are
/// deliberately excluded.
pub struct DedupMiddleware {
    window: Duration,
    seen: Mutex<HashMap<u64, Instant>>,
}

impl DedupMiddleware {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(event: &EventEnvelope) -> u64 {
        let mut hasher = DefaultHasher::new();
        event.category.hash(&mut hasher);
        event.name.hash(&mut hasher);
        event.session_id.hash(&mut hasher);
        event.payload.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

impl Middleware for DedupMiddleware {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        let now = Instant::now();
        let fingerprint = Self::fingerprint(&event);
        let mut seen = self.seen.lock().expect("dedup lock");
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.contains_key(&fingerprint) {
            return MiddlewareDecision::Drop("duplicate");
        }
        seen.insert(fingerprint, now);
        MiddlewareDecision::Continue(event)
    }
}

/// Config-driven name blocklist.
pub struct FilterMiddleware {
    blocked: Vec<String>,
}

impl FilterMiddleware {
    pub fn new(blocked: Vec<String>) -> Self {
        Self { blocked }
    }
}

impl Middleware for FilterMiddleware {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        if self.blocked.iter().any(|b| b == &event.name) {
            MiddlewareDecision::Drop("filtered")
        } else {
            MiddlewareDecision::Continue(event)
        }
    }
}

static EVENT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_.:-]*$").expect("static regex"));

pub struct ValidationMiddleware;

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn process(&self, event: EventEnvelope) -> MiddlewareDecision {
        if !EVENT_NAME_RE.is_match(&event.name) {
            return MiddlewareDecision::Drop("invalid event name");
        }
        MiddlewareDecision::Continue(event)
    }
}

/// The documented default chain: logging → metrics → error-handling →
/// rate-limit → dedup → filter → validation. (The circuit breaker, the
/// chain's final stage, lives in delivery because it is per-subscriber.)
pub fn default_middleware_chain(metrics: Arc<BusMetrics>) -> Vec<Box<dyn Middleware>> {
    vec![
        Box::new(LoggingMiddleware),
        Box::new(MetricsMiddleware::new(metrics)),
        Box::new(ErrorHandlingMiddleware),
        Box::new(RateLimitMiddleware::new(1000, Duration::from_secs(1))),
        Box::new(DedupMiddleware::new(Duration::from_secs(1))),
        Box::new(FilterMiddleware::new(vec![])),
        Box::new(ValidationMiddleware),
    ]
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(name: &str) -> EventEnvelope {
        EventEnvelope::new(EventCategory::Session, name, json!({"k": "v"}))
    }

    #[test]
    fn test_dedup_window() {
        let mw = DedupMiddleware::new(Duration::from_millis(50));
        assert!(matches!(
            mw.process(event("e")),
            MiddlewareDecision::Continue(_)
        ));
        assert!(matches!(mw.process(event("e")), MiddlewareDecision::Drop(_)));
        // A different name is not a duplicate.
        assert!(matches!(
            mw.process(event("other")),
            MiddlewareDecision::Continue(_)
        ));

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            mw.process(event("e")),
            MiddlewareDecision::Continue(_)
        ));
    }

    #[test]
    fn test_rate_limit_middleware() {
        let mw = RateLimitMiddleware::new(2, Duration::from_secs(60));
        assert!(matches!(mw.process(event("a")), MiddlewareDecision::Continue(_)));
        assert!(matches!(mw.process(event("b")), MiddlewareDecision::Continue(_)));
        assert!(matches!(
            mw.process(event("c")),
            MiddlewareDecision::Drop("rate_limit")
        ));
    }

    #[test]
    fn test_validation_rejects_bad_names() {
        let mw = ValidationMiddleware;
        assert!(matches!(mw.process(event("ok_name")), MiddlewareDecision::Continue(_)));
        assert!(matches!(mw.process(event("Bad Name")), MiddlewareDecision::Drop(_)));
        assert!(matches!(mw.process(event("")), MiddlewareDecision::Drop(_)));
    }

    #[test]
    fn test_filter_blocklist() {
        let mw = FilterMiddleware::new(vec!["noisy".into()]);
        assert!(matches!(mw.process(event("noisy")), MiddlewareDecision::Drop(_)));
        assert!(matches!(mw.process(event("fine")), MiddlewareDecision::Continue(_)));
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let mw = ErrorHandlingMiddleware;
        let huge = EventEnvelope::new(
            EventCategory::System,
            "big",
            json!({"blob": "x".repeat(80 * 1024)}),
        );
        assert!(matches!(mw.process(huge), MiddlewareDecision::Drop(_)));
    }

    #[test]
    fn test_metrics_counts_categories() {
        let metrics = Arc::new(BusMetrics::default());
        let mw = MetricsMiddleware::new(metrics.clone());
        mw.process(event("one"));
        mw.process(EventEnvelope::new(EventCategory::Auth, "two", json!({})));
        assert_eq!(metrics.published(), 2);
        assert_eq!(metrics.published_for(EventCategory::Auth), 1);
        assert_eq!(metrics.published_for(EventCategory::Session), 1);
        assert_eq!(metrics.published_for(EventCategory::System), 0);
    }
}
