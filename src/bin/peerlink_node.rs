//! peerlink-node: Registry node
//!
//! Runs one process of a deployment: optionally serves a configured server
//! id, connects to every other configured peer (retrying in the background
//! until they come up) and logs heartbeats relayed from peers.
//!
//! ## Architecture
//! ```text
//! [peerlink-node --serve rpc-1] <--(frames)--> [peerlink-node --serve rpc-2]
//!              ^                                          ^
//!              +-------------(frames)---------------------+
//!                                   |
//!                          [peerlink-node] (web role)
//! ```
//!
//! ## Configuration
//! - `--config <path>`: YAML configuration file (PEERLINK_CONFIG is layered on top)
//! - `--serve <id>` or PEERLINK_SERVE: server id to serve (web role if unset)
//! - PEERLINK_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::BoxFuture;
use tracing::{info, warn};

use peerlink::bus::{BusError, Envelope, EventHandler, Origin};
use peerlink::config::{Config, SERVE_ENV_VAR};
use peerlink::services::heartbeat::{Beat, HEARTBEAT_TOPIC};
use peerlink::services::{EchoModule, HeartbeatModule};
use peerlink::utils::bootstrap::init_tracing;
use peerlink::ProcessContext;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "peerlink-node")]
#[command(about = "Process registry node with cross-process event relay")]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Server id to serve (runs in the web role if unset)
    #[arg(long, env = SERVE_ENV_VAR)]
    serve: Option<String>,
}

impl Args {
    fn serve_id(&self) -> Option<String> {
        self.serve
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// Logs heartbeats received from peers.
struct PeerBeatLogger;

impl EventHandler for PeerBeatLogger {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), BusError>> {
        Box::pin(async move {
            let Origin::Peer(peer_id) = &envelope.origin else {
                return Ok(());
            };
            let beat: Beat = envelope.json()?;
            info!(
                peer_id = %peer_id,
                source = %beat.source,
                sequence = beat.sequence,
                "Peer heartbeat"
            );
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load(args.config.as_deref())?;
    let serve_id = args.serve_id();
    let identity = serve_id
        .clone()
        .unwrap_or_else(|| config.node.resolve_id());

    let emitter = peerlink::bus::EventEmitter::new(config.limits.event_channel_capacity);
    let heartbeat = Arc::new(HeartbeatModule::new(
        identity,
        emitter.clone(),
        HEARTBEAT_INTERVAL,
    ));
    heartbeat.start();

    let ctx = ProcessContext::builder(config)
        .emitter(emitter)
        .module(heartbeat)
        .module(Arc::new(EchoModule::new()))
        .build();
    ctx.subscribe(HEARTBEAT_TOPIC, Box::new(PeerBeatLogger)).await;

    if let Some(server_id) = serve_id {
        ctx.serve(&server_id).await?;
    }

    if let Err(e) = ctx.connect_all(true).await {
        warn!(error = %e, "Not every peer could be connected");
    }

    info!(server_id = %ctx.server_id(), "peerlink-node started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    ctx.shutdown().await;

    Ok(())
}
