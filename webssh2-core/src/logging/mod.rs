mod catalog;
mod layer;
mod pipeline;
mod rate_limit;
mod record;
mod sampling;
mod stdout;
mod syslog;

pub use catalog::is_known_event;
pub use layer::make_pipeline_logger_layer;
pub use pipeline::{LogPipeline, LogStatsSnapshot, PublishOutcome};
pub use record::{LogContext, LogProtocol, LogRecord, LogStatus, LogSubsystem};
pub use syslog::format_rfc5424;

/// Failures inside the structured-log pipeline. These never propagate to
/// clients; callers count them and fall back to stderr at worst.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("unknown log event: {0}")]
    UnknownEvent(String),

    #[error("invalid log context field `{field}`: {reason}")]
    InvalidContext {
        field: &'static str,
        reason: String,
    },

    #[error("transport queue full ({0} entries)")]
    Backpressure(usize),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
