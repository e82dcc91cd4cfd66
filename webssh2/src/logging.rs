use std::sync::Arc;

use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use webssh2_core::logging::{make_pipeline_logger_layer, LogPipeline};

pub fn init_logging(pipeline: Arc<LogPipeline>, debug: u8) {
    if std::env::var("RUST_LOG").is_err() {
        let default = match debug {
            0 => "webssh2=info",
            1 => "webssh2=debug",
            2 => "webssh2=debug,russh=debug",
            _ => "debug",
        };
        std::env::set_var("RUST_LOG", default);
    }

    let env_filter = Arc::new(EnvFilter::from_default_env());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_filter(dynamic_filter_fn(move |metadata, ctx| {
            env_filter.enabled(metadata, ctx.clone())
        }));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(make_pipeline_logger_layer(pipeline))
        .init();
}
