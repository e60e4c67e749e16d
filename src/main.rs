//! Command line interface for the relay. Serves the HTTP and WebSocket
//! endpoints, verifies event files offline, and publishes test notes.

mod client;
mod config;
mod connection;
mod event;
mod filter;
mod hub;
mod message;
mod relay;
mod server;
mod store;
mod ws;

use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use relay::Relay;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "tidepool",
    author,
    version,
    about = "In-memory Nostr relay",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP and WebSocket services.
    Serve,
    /// Check ids and signatures of event files.
    Verify {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Sign a note and publish it to a relay, printing every response.
    Publish {
        /// Relay WebSocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:7778/")]
        relay: String,
        /// Event kind.
        #[arg(long, default_value_t = 1)]
        kind: u32,
        /// Hex secret key; a fresh key is generated when omitted.
        #[arg(long)]
        secret: Option<String>,
        /// Seconds to wait for the relay's `OK`.
        #[arg(long, default_value_t = 5)]
        wait: u64,
        /// Note content.
        content: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let _guard = init_logging(&cfg)?;
    match cli.command {
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse().context("BIND_HTTP")?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse().context("BIND_WS")?;
            let relay = Arc::new(Relay::new(cfg.limits()));
            info!(http = %http_addr, ws = %ws_addr, "relay starting");
            tokio::try_join!(
                server::serve_http(http_addr, relay.clone(), &cfg, shutdown_signal()),
                ws::serve_ws(ws_addr, relay, shutdown_signal())
            )?;
            info!("relay stopped");
        }
        Commands::Verify { files } => {
            let mut failed = 0;
            for f in &files {
                match verify_file(f) {
                    Ok(id) => println!("ok {id}"),
                    Err(e) => {
                        failed += 1;
                        println!("invalid {f}: {e:#}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} events failed verification", files.len());
            }
        }
        Commands::Publish {
            relay,
            kind,
            secret,
            wait,
            content,
        } => {
            let keys = client::keypair(secret.as_deref())?;
            let publication =
                client::publish(&relay, &keys, kind, &content, Duration::from_secs(wait)).await?;
            for line in &publication.responses {
                println!("{line}");
            }
            publication.into_result()?;
        }
    }
    Ok(())
}

/// Parse and verify one event file, returning its id.
fn verify_file(path: &str) -> anyhow::Result<String> {
    let data = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&data)?;
    let ev = event::Event::from_value(value)?;
    ev.verify()?;
    Ok(ev.id)
}

/// Resolves on Ctrl-C so both listeners drain and exit together.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Log to stderr, and to `LOG_DIR/relay.log` when configured. `RUST_LOG`
/// overrides the default `info` level.
fn init_logging(cfg: &Settings) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, "relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    // a subscriber may already be installed, e.g. across test runs
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    Ok(guard)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("OUTBOUND_QUEUE=256\n");
    content.push_str("MAX_MESSAGE_BYTES=524288\n");
    content.push_str("PING_INTERVAL_SECS=54\n");
    content.push_str("IDLE_TIMEOUT_SECS=60\n");
    content.push_str("WRITE_TIMEOUT_SECS=10\n");
    content.push_str("RELAY_NAME=tidepool\n");
    content.push_str("RELAY_DESCRIPTION=\n");
    content.push_str("RELAY_CONTACT=\n");
    content.push_str("RELAY_PUBKEY=\n");
    content.push_str("LOG_DIR=\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
