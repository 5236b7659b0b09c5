//! Registry step definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when, World};
use peerlink::bus::{Envelope, Origin};
use peerlink::services::Singleton;
use peerlink::transport::MemoryTransport;
use peerlink::Error;
use tokio::sync::broadcast;

use crate::common::*;

const WINDOW: Duration = Duration::from_millis(200);

/// Test context for registry scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct RegistryWorld {
    network: MemoryTransport,
    nodes: HashMap<String, Node>,
    receivers: HashMap<String, broadcast::Receiver<Arc<Envelope>>>,
    /// Dial counts per server address when each process started.
    dials_at_start: HashMap<String, HashMap<String, usize>>,
    last_result: Option<Result<(), Error>>,
    /// Whether rpc-2 serves heartbeat too.
    shared_heartbeat: bool,
}

impl fmt::Debug for RegistryWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<&String> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("RegistryWorld")
            .field("nodes", &nodes)
            .field("last_result", &self.last_result)
            .finish()
    }
}

impl RegistryWorld {
    fn new() -> Self {
        Self {
            network: MemoryTransport::new(),
            nodes: HashMap::new(),
            receivers: HashMap::new(),
            dials_at_start: HashMap::new(),
            last_result: None,
            shared_heartbeat: false,
        }
    }

    fn config(&self, id: &str) -> peerlink::config::Config {
        if self.shared_heartbeat {
            shared_heartbeat_deployment(id)
        } else {
            deployment(id)
        }
    }

    fn node(&self, id: &str) -> &Node {
        self.nodes
            .get(id)
            .unwrap_or_else(|| panic!("process {} not started", id))
    }

    fn add(&mut self, id: &str, node: Node) {
        let dials = [RPC_1, RPC_2]
            .iter()
            .map(|server| {
                let addr = memory_addr(server);
                let count = self.network.dial_count(&addr);
                (addr, count)
            })
            .collect();
        self.dials_at_start.insert(id.to_string(), dials);
        self.receivers
            .insert(id.to_string(), node.ctx.emitter().receiver());
        self.nodes.insert(id.to_string(), node);
    }

    fn last_error(&self) -> &Error {
        match &self.last_result {
            Some(Err(e)) => e,
            other => panic!("expected the last connect to fail, got {:?}", other),
        }
    }

    async fn serve(&mut self, id: &str) {
        let node = Node::serving_with(&self.network, self.config(id), id).await;
        self.add(id, node);
    }

    async fn connect(&mut self, from: &str, to: &str, defer: bool) {
        let result = self.node(from).ctx.connect(to, defer).await;
        self.last_result = Some(result);
    }

    async fn received(&mut self, id: &str, topic: &str) -> Vec<(Origin, Vec<u8>)> {
        let rx = self
            .receivers
            .get_mut(id)
            .unwrap_or_else(|| panic!("process {} not started", id));
        collect(rx, topic, WINDOW).await
    }
}

// ==========================================================================
// Deployment
// ==========================================================================

#[given("an in-memory network")]
async fn given_network(world: &mut RegistryWorld) {
    world.network = MemoryTransport::new();
}

#[given("every RPC server serves the heartbeat")]
async fn every_server_serves_heartbeat(world: &mut RegistryWorld) {
    world.shared_heartbeat = true;
}

#[given(expr = "RPC server {string} is serving")]
async fn given_rpc_server_serving(world: &mut RegistryWorld, id: String) {
    world.serve(&id).await;
}

#[when(expr = "RPC server {string} is serving")]
async fn when_rpc_server_serving(world: &mut RegistryWorld, id: String) {
    world.serve(&id).await;
}

#[given(expr = "web process {string} is running")]
async fn web_process_running(world: &mut RegistryWorld, id: String) {
    let node = Node::with_config(&world.network, world.config(&id));
    world.add(&id, node);
}

#[when(expr = "{string} shuts down")]
async fn shuts_down(world: &mut RegistryWorld, id: String) {
    world.node(&id).ctx.shutdown().await;
}

// ==========================================================================
// Connections
// ==========================================================================

#[when(expr = "{string} connects to {string}")]
async fn connects(world: &mut RegistryWorld, from: String, to: String) {
    world.connect(&from, &to, false).await;
}

#[when(expr = "{string} connects to {string} deferred")]
async fn connects_deferred(world: &mut RegistryWorld, from: String, to: String) {
    world.connect(&from, &to, true).await;
}

#[when(expr = "{string} connects to every peer deferred")]
async fn connects_all_deferred(world: &mut RegistryWorld, from: String) {
    let result = world.node(&from).ctx.connect_all(true).await;
    world.last_result = Some(result);
}

#[then("the last connect succeeded")]
async fn last_connect_succeeded(world: &mut RegistryWorld) {
    assert!(
        matches!(world.last_result, Some(Ok(()))),
        "got {:?}",
        world.last_result
    );
}

#[then("the last connect failed with a connection error")]
async fn failed_with_connection_error(world: &mut RegistryWorld) {
    assert!(matches!(world.last_error(), Error::Connection { .. }));
}

#[then("the last connect failed with a configuration error")]
async fn failed_with_configuration_error(world: &mut RegistryWorld) {
    assert!(matches!(world.last_error(), Error::Configuration(_)));
}

#[then(expr = "{string} is connected to {string}")]
async fn is_connected(world: &mut RegistryWorld, from: String, to: String) {
    assert!(world.node(&from).ctx.has_connect(&to).await);
}

#[then(expr = "{string} is eventually connected to {string}")]
async fn eventually_connected(world: &mut RegistryWorld, from: String, to: String) {
    assert!(until_connected(&world.node(&from).ctx, &to).await);
}

#[then(expr = "{string} is eventually disconnected from {string}")]
async fn eventually_disconnected(world: &mut RegistryWorld, from: String, to: String) {
    let ctx = &world.node(&from).ctx;
    let to = to.as_str();
    assert!(eventually(WAIT, || async move { !ctx.has_connect(to).await }).await);
}

#[then(expr = "{string} has a retry task for {string}")]
async fn has_retry_task(world: &mut RegistryWorld, from: String, to: String) {
    assert!(world.node(&from).ctx.retry_task(&to).await.is_some());
}

#[then(expr = "{string} has no retry task for {string}")]
async fn has_no_retry_task(world: &mut RegistryWorld, from: String, to: String) {
    assert!(world.node(&from).ctx.retry_task(&to).await.is_none());
}

#[then(expr = "{string} eventually has no retry task for {string}")]
async fn eventually_no_retry_task(world: &mut RegistryWorld, from: String, to: String) {
    let ctx = &world.node(&from).ctx;
    let to = to.as_str();
    assert!(eventually(WAIT, || async move { ctx.retry_task(to).await.is_none() }).await);
}

#[then(expr = "{string} was dialled once since {string} started")]
async fn dialled_once(world: &mut RegistryWorld, server: String, process: String) {
    let addr = memory_addr(&server);
    let before = world.dials_at_start[&process][&addr];
    assert_eq!(world.network.dial_count(&addr) - before, 1);
}

// ==========================================================================
// Arbitration
// ==========================================================================

#[then(expr = "the heartbeat of {string} is stopped")]
async fn heartbeat_stopped(world: &mut RegistryWorld, id: String) {
    assert!(!world.node(&id).heartbeat.is_running());
}

#[then(expr = "the heartbeat of {string} is suspended by {string}")]
async fn heartbeat_suspended_by(world: &mut RegistryWorld, id: String, peer: String) {
    let owner = world.node(&id).ctx.arbiter().suspended_by("heartbeat").await;
    assert_eq!(owner.as_deref(), Some(peer.as_str()));
}

#[then(expr = "the heartbeat of {string} is running")]
async fn heartbeat_running(world: &mut RegistryWorld, id: String) {
    assert!(world.node(&id).heartbeat.is_running());
}

// ==========================================================================
// Events
// ==========================================================================

#[when(expr = "{string} publishes {string}")]
async fn publishes(world: &mut RegistryWorld, id: String, topic: String) {
    // Wait for every peer holding a connection with the publisher to link it.
    for (peer_id, peer) in &world.nodes {
        if *peer_id == id {
            continue;
        }
        let connected = world.node(&id).ctx.has_connect(peer_id).await
            || peer.ctx.has_connect(&id).await;
        if connected {
            assert!(until_linked(&peer.ctx, &id).await, "{} never linked {}", peer_id, id);
        }
    }
    world.node(&id).ctx.publish(topic, id.clone().into_bytes());
}

#[then(expr = "{string} receives {string} from {string} exactly once")]
async fn receives_once(world: &mut RegistryWorld, id: String, topic: String, from: String) {
    let seen = world.received(&id, &topic).await;
    assert_eq!(seen, vec![(Origin::Peer(from.clone()), from.into_bytes())]);
}

#[then(expr = "{string} receives no {string} events")]
async fn receives_none(world: &mut RegistryWorld, id: String, topic: String) {
    assert!(world.received(&id, &topic).await.is_empty());
}
