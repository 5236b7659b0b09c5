//! Singleton arbitration with the built-in heartbeat module.

use std::time::Duration;

use peerlink::bus::Origin;
use peerlink::services::heartbeat::{Beat, HEARTBEAT_TOPIC};
use peerlink::services::Singleton;
use peerlink::transport::MemoryTransport;

use crate::common::*;

#[tokio::test]
async fn test_peer_heartbeat_replaces_local_one() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    assert!(web.heartbeat.is_running());

    web.ctx.connect(RPC_1, false).await.unwrap();

    assert!(!web.heartbeat.is_running());
    assert!(rpc1.heartbeat.is_running());
    assert_eq!(
        web.ctx.arbiter().suspended_by("heartbeat").await.as_deref(),
        Some(RPC_1)
    );

    assert!(until_linked(&rpc1.ctx, "web-1").await);
    let mut rx = web.ctx.emitter().receiver();
    let beats = collect(&mut rx, HEARTBEAT_TOPIC, Duration::from_millis(200)).await;

    assert!(!beats.is_empty());
    for (origin, payload) in beats {
        assert_eq!(origin, Origin::Peer(RPC_1.to_string()));
        let beat: Beat = serde_json::from_slice(&payload).unwrap();
        assert_eq!(beat.source, RPC_1);
    }
}

#[tokio::test]
async fn test_peer_without_singleton_leaves_local_running() {
    let network = MemoryTransport::new();
    let _rpc2 = Node::serving(&network, RPC_2).await;
    let web = Node::new(&network, "web-1");

    web.ctx.connect(RPC_2, false).await.unwrap();

    assert!(web.heartbeat.is_running());
    assert!(web.ctx.arbiter().suspended_by("heartbeat").await.is_none());
}

#[tokio::test]
async fn test_serving_process_keeps_its_own_singleton() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;

    // The self-connection binds heartbeat but never arbitrates.
    assert!(rpc1.ctx.has_connect(RPC_1).await);
    assert!(rpc1.heartbeat.is_running());
}

#[tokio::test]
async fn test_released_singleton_is_not_restarted() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    web.ctx.connect(RPC_1, false).await.unwrap();
    assert!(!web.heartbeat.is_running());

    rpc1.ctx.shutdown().await;

    let ctx = &web.ctx;
    assert!(eventually(WAIT, || async move {
        ctx.arbiter().suspended_by("heartbeat").await.is_none()
    })
    .await);
    tokio::time::sleep(BEAT * 3).await;
    assert!(!web.heartbeat.is_running());
}
