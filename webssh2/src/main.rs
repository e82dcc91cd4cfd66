mod config;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::*;
use webssh2_core::{set_global_services, Services};
use webssh2_protocol_http::HttpProtocolServer;

#[derive(Parser)]
#[command(name = "webssh2", about = "Web-to-SSH gateway", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Increase verbosity (-d, -dd, -ddd).
    #[arg(long, short, action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configuration problems are fatal before anything else starts.
    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Configuration error: {error:#}");
            std::process::exit(1);
        }
    };

    let listen = SocketAddr::new(
        config
            .store
            .listen
            .ip
            .parse()
            .context("parsing listen.ip")?,
        config.store.listen.port,
    );

    let services = Services::new(config).await?;
    logging::init_logging(services.log_pipeline.clone(), cli.debug);
    set_global_services(services.clone());

    {
        let config = services.config.lock().await;
        info!(
            event = "config_loaded",
            "Configuration loaded: {}",
            config.store.to_masked_json()
        );
    }

    let server = HttpProtocolServer::new(&services);
    tokio::select! {
        result = server.run(listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "server_stop", "Shutting down");
        }
    }
    Ok(())
}
