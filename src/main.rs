// Module declarations
mod bridge;
mod cli;
mod coding;
mod config;
mod context;
mod coordinator;
mod cron;
mod embedder;
mod engine;
mod intake;
mod mcp;
mod outbound;
mod sandbox;
mod scheduler;
mod search;
mod store;
mod tool_args;
mod tool_defs;
mod tool_exec;
mod types;
mod uplink;
mod util;
mod web;

// Re-export module items at the crate root so cross-module references stay
// flat; the modules grew out of one file and still share a namespace.
#[allow(unused_imports)]
pub(crate) use bridge::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use coding::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use context::*;
#[allow(unused_imports)]
pub(crate) use coordinator::*;
#[allow(unused_imports)]
pub(crate) use cron::*;
#[allow(unused_imports)]
pub(crate) use embedder::*;
#[allow(unused_imports)]
pub(crate) use engine::*;
#[allow(unused_imports)]
pub(crate) use intake::*;
#[allow(unused_imports)]
pub(crate) use mcp::*;
#[allow(unused_imports)]
pub(crate) use outbound::*;
#[allow(unused_imports)]
pub(crate) use sandbox::*;
#[allow(unused_imports)]
pub(crate) use scheduler::*;
#[allow(unused_imports)]
pub(crate) use search::*;
#[allow(unused_imports)]
pub(crate) use store::*;
#[allow(unused_imports)]
pub(crate) use tool_args::*;
#[allow(unused_imports)]
pub(crate) use tool_defs::*;
#[allow(unused_imports)]
pub(crate) use tool_exec::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use uplink::*;
#[allow(unused_imports)]
pub(crate) use util::*;
#[allow(unused_imports)]
pub(crate) use web::*;

use std::time::Duration;

use clap::Parser;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { db } => {
            let mut config = Config::from_env();
            if let Some(db) = db {
                config.db_path = db;
            }
            eprintln!("[outpost] serving with db {}", config.db_path.display());
            run_serve(config)
        }

        Command::Bridge {
            http_port,
            ws_port,
            timeout_secs,
        } => run_bridge(http_port, ws_port, Duration::from_secs(timeout_secs)),

        Command::Status { db } => {
            let mut config = Config::from_env();
            if let Some(db) = db {
                config.db_path = db;
            }
            let store = Store::open(&config.db_path)?;
            let stats = store.conversation_stats(config.compact_threshold)?;
            println!("db: {}", config.db_path.display());
            println!(
                "messages: {} (~{} tokens, compaction {})",
                stats.count,
                stats.approx_tokens,
                if stats.needs_compaction { "due" } else { "not due" }
            );
            println!("journal: {}", store.table_count("journal"));
            println!("topics: {}", store.table_count("topics"));
            println!("state files: {}", store.table_count("state_files"));
            println!("reminders: {}", store.table_count("reminders"));
            println!("summaries: {}", store.table_count("summaries"));
            println!("coding tasks: {}", store.table_count("coding_task_state"));
            Ok(())
        }
    }
}
