use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use webssh2_common::{LoggingConfig, Webssh2Error};

use super::catalog::is_known_event;
use super::rate_limit::EventRateLimiter;
use super::record::LogRecord;
use super::sampling::Sampler;
use super::stdout::StdoutTransport;
use super::syslog::{format_rfc5424, start_syslog_transport};
use super::LogError;

/// What happened to a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Denied { reason: &'static str },
}

#[derive(Default)]
struct LogStats {
    accepted: AtomicU64,
    dropped_by_level: AtomicU64,
    dropped_by_sampling: AtomicU64,
    dropped_by_rate_limit: AtomicU64,
    transport_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStatsSnapshot {
    pub accepted: u64,
    pub dropped_by_level: u64,
    pub dropped_by_sampling: u64,
    pub dropped_by_rate_limit: u64,
    pub transport_errors: u64,
}

/// The structured-log pipeline: catalog check, context validation, level
/// filter, sampling, rate limiting, JSON formatting, then fan-out to the
/// configured transports.
pub struct LogPipeline {
    config: LoggingConfig,
    sampler: Sampler,
    rate_limiter: EventRateLimiter,
    stdout: Option<StdoutTransport>,
    syslog: Option<mpsc::Sender<String>>,
    hostname: String,
    pid: u32,
    stats: LogStats,
}

impl LogPipeline {
    pub fn new(config: &LoggingConfig) -> Result<Self, Webssh2Error> {
        let stdout = config
            .transports
            .iter()
            .any(|t| t == "stdout")
            .then(|| StdoutTransport::start(config.stdout.max_queue_size));
        let syslog = config
            .transports
            .iter()
            .any(|t| t == "syslog")
            .then(|| start_syslog_transport(config.syslog.clone()));

        Ok(Self {
            sampler: Sampler::new(&config.sampling),
            rate_limiter: EventRateLimiter::new(&config.rate_limit)?,
            stdout,
            syslog,
            hostname: hostname(),
            pid: std::process::id(),
            config: config.clone(),
            stats: LogStats::default(),
        })
    }

    /// Builds a pipeline with no transports attached; used by tests and
    /// by components that only need the filtering stages.
    pub fn disconnected(config: &LoggingConfig) -> Result<Self, Webssh2Error> {
        let mut config = config.clone();
        config.transports.clear();
        Self::new(&config)
    }

    pub fn publish(&self, record: LogRecord) -> Result<PublishOutcome, LogError> {
        if !is_known_event(&record.event) {
            return Err(LogError::UnknownEvent(record.event));
        }
        record.context.validate()?;

        if record.level < self.config.minimum_level {
            self.stats.dropped_by_level.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome::Denied { reason: "level" });
        }
        if !self.sampler.should_accept(&record.event) {
            self.stats
                .dropped_by_sampling
                .fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome::Denied { reason: "sampling" });
        }
        if !self.rate_limiter.check(&record.event) {
            self.stats
                .dropped_by_rate_limit
                .fetch_add(1, Ordering::Relaxed);
            return Ok(PublishOutcome::Denied {
                reason: "rate_limit",
            });
        }

        let json = record.to_json()?;

        if let Some(stdout) = &self.stdout {
            if let Err(error) = stdout.enqueue(json.clone()) {
                // Transport trouble is counted, never propagated.
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                eprintln!("log transport overflow: {error}");
            }
        }
        if let Some(syslog) = &self.syslog {
            match format_rfc5424(&record, &self.config.syslog, &self.hostname, self.pid) {
                Ok(line) => {
                    if syslog.try_send(line).is_err() {
                        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(error) => {
                    self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    eprintln!("syslog formatting failed: {error}");
                }
            }
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(PublishOutcome::Accepted)
    }

    pub fn stats(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            dropped_by_level: self.stats.dropped_by_level.load(Ordering::Relaxed),
            dropped_by_sampling: self.stats.dropped_by_sampling.load(Ordering::Relaxed),
            dropped_by_rate_limit: self.stats.dropped_by_rate_limit.load(Ordering::Relaxed),
            transport_errors: self.stats.transport_errors.load(Ordering::Relaxed),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webssh2_common::{LogLevel, RateLimitRule, SamplingRule};

    use super::super::record::LogRecord;
    use super::*;

    fn pipeline(mutate: impl FnOnce(&mut LoggingConfig)) -> LogPipeline {
        let mut config = LoggingConfig::default();
        mutate(&mut config);
        LogPipeline::disconnected(&config).unwrap()
    }

    #[test]
    fn test_unknown_event_rejected() {
        let pipeline = pipeline(|_| {});
        let record = LogRecord::new(LogLevel::Info, "nonsense");
        assert!(matches!(
            pipeline.publish(record),
            Err(LogError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_invalid_context_rejected() {
        let pipeline = pipeline(|_| {});
        let mut record = LogRecord::new(LogLevel::Info, "session_start");
        record.context.client_ip = Some("not-an-ip".into());
        assert!(matches!(
            pipeline.publish(record),
            Err(LogError::InvalidContext { .. })
        ));
    }

    #[test]
    fn test_level_filter() {
        let pipeline = pipeline(|c| c.minimum_level = LogLevel::Warn);
        let outcome = pipeline
            .publish(LogRecord::new(LogLevel::Info, "session_start"))
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Denied { reason: "level" });
        let outcome = pipeline
            .publish(LogRecord::new(LogLevel::Error, "session_start"))
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Accepted);
    }

    #[test]
    fn test_sampling_drop_counted() {
        let pipeline = pipeline(|c| {
            c.sampling.rules = vec![SamplingRule {
                target: "session_start".into(),
                rate: 0.0,
            }];
        });
        let outcome = pipeline
            .publish(LogRecord::new(LogLevel::Info, "session_start"))
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Denied { reason: "sampling" });
        assert_eq!(pipeline.stats().dropped_by_sampling, 1);
    }

    #[test]
    fn test_rate_limit_denies_then_recovers() {
        let pipeline = pipeline(|c| {
            c.rate_limit.rules = vec![RateLimitRule {
                target: "*".into(),
                limit: 2,
                interval_ms: 1000,
            }];
        });
        let record = || LogRecord::new(LogLevel::Info, "session_start");
        assert_eq!(pipeline.publish(record()).unwrap(), PublishOutcome::Accepted);
        assert_eq!(pipeline.publish(record()).unwrap(), PublishOutcome::Accepted);
        assert_eq!(
            pipeline.publish(record()).unwrap(),
            PublishOutcome::Denied {
                reason: "rate_limit"
            }
        );
        assert_eq!(pipeline.stats().dropped_by_rate_limit, 1);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(pipeline.publish(record()).unwrap(), PublishOutcome::Accepted);
    }
}
