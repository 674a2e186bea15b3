//! Overmux CLI
//!
//! Runs the mux transport over plain TCP: `listen` serves a line echo on an
//! overlay address, `send` pushes one message per logical stream over a
//! single TCP connection.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use tracing::info;

use overmux::MuxTransport;
use overmux::smux::SmuxMultiplexer;
use overmux_core::Addr;
use overmux_core::tracing_init::init_tracing;

mod listen_cmd;
mod send_cmd;

type TcpTransport = MuxTransport<SmuxMultiplexer<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "overmux-cli")]
#[command(version, about = "Many logical streams over one TCP connection")]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long, env = "OVERMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level for overmux crates (overridden by RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept mux sessions on a TCP overlay address and echo every line.
    Listen {
        /// Local overlay address, e.g. /ip/127.0.0.1/tcp/1812/mux.
        #[arg(long)]
        addr: Addr,
    },
    /// Send each message on its own logical stream and print the echoes.
    Send {
        /// Remote overlay address, e.g. /ip/127.0.0.1/tcp/1812/mux.
        #[arg(long)]
        addr: Addr,

        /// Messages; the first bootstraps the session.
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = overmux_core::config::load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_json {
        config.log.json = true;
    }
    init_tracing(&config.log);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting overmux-cli");

    let transport: TcpTransport =
        MuxTransport::new(SmuxMultiplexer::new(&config.smux), config.transport);

    match cli.command {
        Command::Listen { addr } => listen_cmd::run(&transport, &addr).await,
        Command::Send { addr, messages } => send_cmd::run(&transport, &addr, &messages).await,
    }
}
