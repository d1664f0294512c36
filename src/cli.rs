use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Single-tenant AI agent orchestrator", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the orchestrator: webhook intake, scheduler, MCP uplink, and
    /// the trigger/session coordinator.
    Serve {
        /// SQLite database path (overrides OUTPOST_DB).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Run the in-sandbox bridge: MCP over HTTP for the reasoning engine,
    /// one WebSocket uplink for the orchestrator.
    Bridge {
        /// Port serving MCP to the engine (loopback side).
        #[arg(long, default_value_t = 7780)]
        http_port: u16,
        /// Port accepting the orchestrator's WebSocket.
        #[arg(long, default_value_t = 7781)]
        ws_port: u16,
        /// Per-request deadline in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Print store row counts and conversation stats.
    Status {
        /// SQLite database path (overrides OUTPOST_DB).
        #[arg(long)]
        db: Option<PathBuf>,
    },
}
