//! mxkernel RPC server - JSON-RPC backend for a console front end.
//!
//! This binary hosts a single kernel session over HTTP: operations arrive as
//! JSON-RPC 2.0 calls and kernel messages leave as server-sent events.

mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use mxkernel::{BroadcastPublisher, ChannelConfig, Engine, InMemoryEngine, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Stack size for runtime threads; formula evaluation recurses per nested call.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "mxkernel-rpc")]
#[command(about = "JSON-RPC server for the mxkernel session")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Model directory or archive to load at start (repeatable)
    #[arg(long = "model")]
    models: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(WORKER_STACK_SIZE)
        .build()?
        .block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting mxkernel RPC Server");

    let mut engine = InMemoryEngine::new();
    for path in &args.models {
        let model = engine.read_model(path, None)?;
        info!("Preloaded {} from {}", model.fullname, path.display());
    }

    let publisher = Arc::new(BroadcastPublisher::new(ChannelConfig::BROADCAST_CAPACITY));
    let session = Session::new(Box::new(engine), publisher.clone());

    let addr = server::start_server(session, publisher, &args.host, args.port).await?;

    // Print port for the front end to read (intentional stdout for IPC)
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
