use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mockgate::api;
use mockgate::state::AppState;
use mockgate_core::config::parse_size;
use mockgate_core::{LogHub, LogReader, LogSettings, LogWriter, RotationSpec, ServiceRepository, StrategyProcessor};

/// Room for bursts while the hub fans events out to slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Programmable HTTP/SOAP mock gateway", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Directory for the request log and its archives
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Request log size threshold, e.g. 50MB, 512KB, 1GB
    #[arg(long, env = "LOG_MAX_SIZE", default_value = "50MB")]
    log_max_size: String,

    /// Number of archived request log files to keep
    #[arg(long, env = "LOG_BACKUP_COUNT", default_value_t = 10)]
    log_backup_count: usize,

    /// Time-based rotation cadence (1d, 12h, 1w); overrides size rotation
    #[arg(long, env = "LOG_ROTATION_TIME")]
    log_rotation_time: Option<String>,

    /// Application log level (request log records are unaffected)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Optional JSON file persisting registered mock services
    #[arg(long, env = "DATA_FILE")]
    data_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = LogSettings {
        dir: args.log_dir.clone(),
        max_bytes: parse_size(&args.log_max_size).context("parsing --log-max-size")?,
        backup_count: args.log_backup_count,
        rotation: args
            .log_rotation_time
            .as_deref()
            .map(str::parse::<RotationSpec>)
            .transpose()
            .context("parsing --log-rotation-time")?,
    };

    let repo = match args.data_file.clone() {
        Some(path) => {
            let repo = ServiceRepository::open(path).context("loading service snapshot")?;
            for (id, error) in repo.revalidate() {
                warn!(service = id, %error, "stored service failed validation, left as-is");
            }
            repo
        }
        None => ServiceRepository::new(),
    };

    let (hub, events) = LogHub::spawn(EVENT_CHANNEL_CAPACITY);
    let writer = LogWriter::new(&settings, events).context("opening request log")?;
    let reader = LogReader::new(&settings);
    let processor = StrategyProcessor::new().context("building upstream client")?;

    let state = AppState {
        repo: Arc::new(repo),
        processor: Arc::new(processor),
        writer: Arc::new(writer),
        reader: Arc::new(reader),
        hub,
    };
    let app = api::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, log_dir = %args.log_dir.display(), "mockgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
    }
}
