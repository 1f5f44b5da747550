use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use q_console::{config::Config, server::run_server};

#[derive(Parser)]
#[command(name = "q-console")]
#[command(about = "Web console for a pool of interactive Q CLI chat instances")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Q CLI binary, run as `<q-command> chat`
    #[arg(long, default_value = "q")]
    q_command: String,

    /// Maximum number of concurrently registered instances
    #[arg(long, default_value = "5")]
    max_instances: usize,

    /// Quiet seconds after which buffered output becomes a complete reply
    #[arg(long, default_value = "3.0")]
    response_timeout: f64,

    /// Seconds to wait after SIGTERM before force-killing an instance
    #[arg(long, default_value = "5.0")]
    stop_grace: f64,

    /// Retained chat/system history entries
    #[arg(long, default_value = "1000")]
    history_limit: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Console and file logging, filtered by RUST_LOG when set.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let logs_dir = std::path::Path::new(".q-console/logs");
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("Starting Q Console");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}:{}", args.host, args.port);
    info!("Q CLI binary: {}", args.q_command);
    info!("Max instances: {}", args.max_instances);

    let config = Config {
        host: args.host,
        port: args.port,
        q_command: args.q_command,
        max_instances: args.max_instances,
        response_idle_timeout: Duration::from_secs_f64(args.response_timeout),
        stop_grace_period: Duration::from_secs_f64(args.stop_grace),
        history_limit: args.history_limit,
        ..Config::default()
    };

    run_server(config).await
}
