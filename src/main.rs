//! CLI for amqp-bridge
//!
//! Reads settings (file, `BRIDGE_*` and legacy environment variables, `.env`),
//! then bridges until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use amqp_bridge::broker::amqp::AmqpConnector;
use amqp_bridge::config::{load_config, load_config_from};
use amqp_bridge::utils::logging;
use amqp_bridge::{Consumer, Result};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "amqp-bridge", version, about)]
struct Cli {
    /// Settings file; defaults to `config/default.*` when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, env = "BRIDGE_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "bridge terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    settings.validate()?;

    let mut consumer = Consumer::connect(&AmqpConnector, &settings).await?;
    info!(
        upstream = %settings.upstream.connection.host,
        queue = %settings.upstream.queue,
        downstream = %settings.downstream.connection.host,
        exchange = %settings.downstream.exchange,
        "bridge started"
    );

    consumer
        .start(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = ?err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
}
