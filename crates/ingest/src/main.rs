//! Service entry point
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal errors (permanent
//! database error, commit failure, configuration error), 2 on startup
//! precondition failures.

use std::path::PathBuf;

use clap::Parser;
use timescale_ingest::supervisor::Supervisor;
use timescale_ingest::IngestError;
use timescale_ingest_config::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "timescale-ingest",
    version,
    about = "Adaptive Kafka to TimescaleDB candle ingestion service"
)]
struct Args {
    /// Optional YAML configuration file; environment variables take
    /// precedence over its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::load(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "application starting");

    match Supervisor::new(config).run().await {
        Ok(()) => info!("clean shutdown"),
        Err(e @ IngestError::Startup(_)) => {
            error!(error = %e, "startup precondition failed");
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(1);
        }
    }
}

fn init_tracing(log_level: &str) {
    let directives = format!("{},rdkafka=warn,sqlx=warn", log_level.to_lowercase());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
