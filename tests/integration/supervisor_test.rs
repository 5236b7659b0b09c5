//! Connection supervision across processes.

use peerlink::transport::{MemoryTransport, TransportError};
use peerlink::Error;

use crate::common::*;

#[tokio::test]
async fn test_web_and_rpc_converge_regardless_of_start_order() {
    let network = MemoryTransport::new();

    // The web process starts first and defers both peers.
    let web = Node::new(&network, "web-1");
    web.ctx.connect_all(true).await.unwrap();
    assert!(web.ctx.retry_task(RPC_1).await.is_some());
    assert!(web.ctx.retry_task(RPC_2).await.is_some());

    let rpc1 = Node::serving(&network, RPC_1).await;
    let rpc2 = Node::serving(&network, RPC_2).await;
    rpc1.ctx.connect_all(true).await.unwrap();
    rpc2.ctx.connect_all(true).await.unwrap();

    assert!(until_connected(&web.ctx, RPC_1).await);
    assert!(until_connected(&web.ctx, RPC_2).await);
    assert!(until_connected(&rpc1.ctx, RPC_2).await);
    assert!(until_connected(&rpc2.ctx, RPC_1).await);

    let ctx = &web.ctx;
    assert!(eventually(WAIT, || async move {
        ctx.retry_task(RPC_1).await.is_none() && ctx.retry_task(RPC_2).await.is_none()
    })
    .await);
    assert_eq!(
        web.ctx.registry().connected_ids().await,
        vec![RPC_1.to_string(), RPC_2.to_string()]
    );
}

#[tokio::test]
async fn test_repeated_connect_dials_once() {
    let network = MemoryTransport::new();
    let _rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    let before = network.dial_count(&memory_addr(RPC_1));

    for _ in 0..5 {
        web.ctx.connect(RPC_1, false).await.unwrap();
    }
    web.ctx.connect_all(true).await.unwrap();

    assert_eq!(network.dial_count(&memory_addr(RPC_1)) - before, 1);
}

#[tokio::test]
async fn test_failed_non_deferred_connect_leaves_no_retry() {
    let network = MemoryTransport::new();
    let web = Node::new(&network, "web-1");

    let err = web.ctx.connect(RPC_2, false).await.unwrap_err();
    match err {
        Error::Connection { server_id, source } => {
            assert_eq!(server_id, RPC_2);
            assert!(matches!(source, TransportError::Unreachable(_)));
        }
        other => panic!("expected connection error, got {other}"),
    }

    tokio::time::sleep(BEAT * 3).await;
    assert_eq!(network.dial_count(&memory_addr(RPC_2)), 1);
    assert!(web.ctx.retry_task(RPC_2).await.is_none());
}

#[tokio::test]
async fn test_connect_all_reports_each_failed_peer() {
    let network = MemoryTransport::new();
    let web = Node::new(&network, "web-1");

    let err = web.ctx.connect_all(false).await.unwrap_err();

    let mut failed = err.failed_peers();
    failed.sort();
    assert_eq!(failed, vec![RPC_1, RPC_2]);
    assert!(err.to_string().contains("2 peer connection(s) failed"));
}

#[tokio::test]
async fn test_unconfigured_peer_is_never_retried() {
    let network = MemoryTransport::new();
    let web = Node::new(&network, "web-1");

    let err = web.ctx.connect("rpc-404", true).await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(web.ctx.scheduler().stats().created, 0);
}

#[tokio::test]
async fn test_dropped_peer_is_forgotten_and_can_reconnect() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    web.ctx.connect(RPC_1, false).await.unwrap();
    let first = web.ctx.connection_id(RPC_1).await.unwrap();

    rpc1.ctx.shutdown().await;
    let ctx = &web.ctx;
    assert!(eventually(WAIT, || async move { !ctx.has_connect(RPC_1).await }).await);
    assert!(web.ctx.binder().providers("echo").await.is_empty());
    let net = &network;
    assert!(eventually(WAIT, || async move { !net.is_listening(&memory_addr(RPC_1)) }).await);

    let _rpc1 = Node::serving(&network, RPC_1).await;
    web.ctx.connect(RPC_1, false).await.unwrap();
    let second = web.ctx.connection_id(RPC_1).await.unwrap();
    assert_ne!(first, second);
}
