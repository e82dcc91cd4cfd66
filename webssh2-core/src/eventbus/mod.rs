mod circuit;
mod middleware;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;
use webssh2_common::SessionId;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use middleware::{
    default_middleware_chain, BusMetrics, DedupMiddleware, ErrorHandlingMiddleware,
    FilterMiddleware, LoggingMiddleware, MetricsMiddleware, Middleware, MiddlewareDecision,
    RateLimitMiddleware, ValidationMiddleware,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Auth,
    Connection,
    Terminal,
    Session,
    System,
    Recording,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One internal event. Payload is opaque JSON; the category/name pair is
/// the routing key.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub category: EventCategory,
    pub name: String,
    pub priority: EventPriority,
    pub session_id: Option<SessionId>,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(category: EventCategory, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            name: name.into(),
            priority: EventPriority::Normal,
            session_id: None,
            payload,
            ts: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

type HandlerFn =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type FilterFn = Box<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

struct SubscriberEntry {
    name: String,
    filter: FilterFn,
    handler: HandlerFn,
    breaker: CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPublishResult {
    Delivered { handlers: usize, failures: usize },
    DroppedByMiddleware { stage: &'static str },
}

/// Internal pub/sub, decoupled from the WebSocket layer. Events pass the
/// middleware chain once, then fan out to matching subscribers; the final
/// chain stage — the circuit breaker — is applied per subscriber, so one
/// failing handler is eventually skipped without affecting the rest.
pub struct EventBus {
    middleware: Vec<Box<dyn Middleware>>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    breaker_config: CircuitBreakerConfig,
}

impl EventBus {
    pub fn new(
        middleware: Vec<Box<dyn Middleware>>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            middleware,
            subscribers: Mutex::new(vec![]),
            breaker_config,
        }
    }

    pub fn with_default_middleware() -> (Self, Arc<BusMetrics>) {
        let metrics = Arc::new(BusMetrics::default());
        let bus = Self::new(
            default_middleware_chain(metrics.clone()),
            CircuitBreakerConfig::default(),
        );
        (bus, metrics)
    }

    pub async fn subscribe_handler<F, H>(&self, name: impl Into<String>, filter: F, handler: H)
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
        H: Fn(EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.subscribers.lock().await.push(SubscriberEntry {
            name: name.into(),
            filter: Box::new(filter),
            handler: Arc::new(handler),
            breaker: CircuitBreaker::new(self.breaker_config),
        });
    }

    /// Channel-style subscription: events matching the filter arrive on
    /// the returned receiver. Dropping the receiver opens the breaker and
    /// the subscription goes quiet.
    pub async fn subscribe_channel<F>(
        &self,
        name: impl Into<String>,
        filter: F,
    ) -> UnboundedReceiver<EventEnvelope>
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = unbounded_channel();
        self.subscribe_handler(name, filter, move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(event)
                    .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
            })
        })
        .await;
        rx
    }

    pub async fn publish(&self, event: EventEnvelope) -> BusPublishResult {
        let mut event = event;
        for mw in &self.middleware {
            match mw.process(event) {
                MiddlewareDecision::Continue(next) => event = next,
                MiddlewareDecision::Drop(reason) => {
                    debug!(stage = mw.name(), %reason, "Event dropped by middleware");
                    return BusPublishResult::DroppedByMiddleware { stage: mw.name() };
                }
            }
        }

        let mut handlers = 0;
        let mut failures = 0;
        let mut subscribers = self.subscribers.lock().await;
        for entry in subscribers.iter_mut() {
            if !(entry.filter)(&event) {
                continue;
            }
            if !entry.breaker.allow() {
                continue;
            }
            handlers += 1;
            match (entry.handler)(event.clone()).await {
                Ok(()) => entry.breaker.record_success(),
                Err(error) => {
                    failures += 1;
                    entry.breaker.record_failure();
                    warn!(subscriber = %entry.name, %error, "Event handler failed");
                }
            }
        }
        BusPublishResult::Delivered { handlers, failures }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn envelope(name: &str) -> EventEnvelope {
        EventEnvelope::new(EventCategory::System, name, json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_affect_others() {
        let bus = EventBus::new(vec![], CircuitBreakerConfig::default());
        let successes = Arc::new(AtomicU32::new(0));

        bus.subscribe_handler("bad", |_| true, |_| {
            Box::pin(async { Err(anyhow::anyhow!("handler bug")) })
        })
        .await;
        let counter = successes.clone();
        bus.subscribe_handler("good", |_| true, move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .await;

        let result = bus.publish(envelope("tick")).await;
        assert_eq!(
            result,
            BusPublishResult::Delivered {
                handlers: 2,
                failures: 1
            }
        );
        assert_eq!(successes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_and_half_opens() {
        let bus = EventBus::new(
            vec![],
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(100),
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        bus.subscribe_handler("flaky", |_| true, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Box::pin(async { Err(anyhow::anyhow!("down")) })
        })
        .await;

        for _ in 0..3 {
            bus.publish(envelope("tick")).await;
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        // Open: handler is skipped entirely.
        bus.publish(envelope("tick")).await;
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        // After the cooldown one trial call goes through (half-open).
        tokio::time::sleep(Duration::from_millis(120)).await;
        bus.publish(envelope("tick")).await;
        assert_eq!(calls.load(Ordering::Relaxed), 4);

        // The trial failed, so the breaker snaps open again.
        bus.publish(envelope("tick")).await;
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new(vec![], CircuitBreakerConfig::default());
        let mut rx = bus
            .subscribe_channel("auth-only", |e| e.category == EventCategory::Auth)
            .await;

        bus.publish(envelope("ignored")).await;
        bus.publish(EventEnvelope::new(
            EventCategory::Auth,
            "auth_success",
            json!({}),
        ))
        .await;

        let received = rx.try_recv().unwrap();
        assert_eq!(received.name, "auth_success");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_default_chain_dedups() {
        let (bus, metrics) = EventBus::with_default_middleware();
        let mut rx = bus.subscribe_channel("all", |_| true).await;

        let event = envelope("repeat");
        bus.publish(event.clone()).await;
        let result = bus.publish(event).await;
        assert!(matches!(
            result,
            BusPublishResult::DroppedByMiddleware { stage: "dedup" }
        ));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.published(), 2);
    }
}
