//! The Ripple WebSocket CLI.
//!
//! - `ripple serve` - Run an echo or chat server
//! - `ripple connect <url>` - Interactive client: stdin lines out, messages to stdout
//!
//! Logging goes to stderr and is filtered by `--log-level` or `RUST_LOG`.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ripple_rt::ws::client::ClientOptions;
use ripple_rt::{Callbacks, CloseCode, HeartbeatConfig, Registry, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "ripple", version, about = "WebSocket server and client")]
struct Cli {
    /// Log filter (e.g. `debug`, `ripple_rt=trace`); overrides RUST_LOG
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Send every message back to its sender
    Echo,
    /// Send every message to all connected clients
    Chat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WebSocket server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "echo")]
        mode: Mode,

        /// Ping every N seconds and drop clients that do not answer
        #[arg(long = "heartbeat-secs")]
        heartbeat_secs: Option<u64>,
    },
    /// Connect to a ws:// or wss:// URL
    Connect {
        url: String,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Serve {
            bind,
            config,
            mode,
            heartbeat_secs,
        } => serve(bind, config, mode, heartbeat_secs),
        Commands::Connect { url } => connect(&url),
    }
}

fn serve(
    bind: Option<String>,
    config_path: Option<PathBuf>,
    mode: Mode,
    heartbeat_secs: Option<u64>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    apply_overrides(&mut config, bind, heartbeat_secs);

    let registry = Arc::new(Registry::new());
    let handler = match mode {
        Mode::Echo => Callbacks::new().on_message(|conn, text| {
            let _ = conn.send_text(text);
        }),
        Mode::Chat => {
            let room = Arc::clone(&registry);
            Callbacks::new().on_message(move |_conn, text| {
                room.broadcast(text);
            })
        }
    };

    let server =
        Server::bind_with_registry(config, registry, handler).context("starting server")?;
    info!(addr = %server.local_addr(), mode = ?mode, "serving");
    server.serve().context("accept loop")?;
    Ok(())
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut ServerConfig, bind: Option<String>, heartbeat_secs: Option<u64>) {
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(secs) = heartbeat_secs {
        config.heartbeat = Some(HeartbeatConfig {
            interval_ms: secs.saturating_mul(1000),
            ..config.heartbeat.unwrap_or_default()
        });
    }
}

fn connect(url: &str) -> Result<()> {
    let handler = Callbacks::new()
        .on_message(|_conn, text| println!("{}", text))
        .on_binary(|_conn, data| println!("<{} bytes of binary data>", data.len()))
        .on_disconnect(|_conn, code| match code {
            Some(code) => eprintln!("connection closed ({})", code),
            None => eprintln!("connection closed"),
        });

    let conn = ripple_rt::connect(url, handler, ClientOptions::default())
        .with_context(|| format!("connecting to {}", url))?;
    let receiver = conn.spawn().context("starting receive loop")?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if conn.send_text(&line).is_err() {
            break;
        }
    }

    conn.disconnect(CloseCode::NORMAL);
    let _ = receiver.join();
    Ok(())
}
