//! The same supervision flow over real loopback sockets.

use std::sync::Arc;

use bytes::Bytes;
use peerlink::config::{Config, ServerDescriptor};
use peerlink::services::{EchoModule, ModuleTable};
use peerlink::transport::{TransportError, TransportOptions};
use peerlink::{Error, ProcessContext};

use crate::common::*;

fn tcp_config(node_id: &str, port: u16, secret: &str) -> Config {
    let mut config = Config::for_test().with_server(
        ServerDescriptor::new(
            RPC_1,
            TransportOptions::at("127.0.0.1", port).with_secret(secret),
        )
        .with_module("echo"),
    );
    config.node.id = Some(node_id.to_string());
    config
}

fn tcp_process(config: Config) -> ProcessContext {
    ProcessContext::builder(config)
        .modules(ModuleTable::new().with(Arc::new(EchoModule::new())))
        .build()
}

#[tokio::test]
async fn test_connect_and_invoke_over_tcp() {
    let port = free_port();
    let rpc = tcp_process(tcp_config(RPC_1, port, "s3cret"));
    rpc.serve(RPC_1).await.unwrap();
    assert_eq!(rpc.dsn().await, Some(format!("tcp://127.0.0.1:{}", port)));

    let web = tcp_process(tcp_config("web-1", port, "s3cret"));
    web.connect(RPC_1, false).await.unwrap();

    let reply = web
        .invoke("echo", "echo", Bytes::from_static(b"over the wire"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"over the wire");

    assert!(until_linked(&rpc, "web-1").await);
    let mut at_web = web.emitter().receiver();
    rpc.publish("news", b"hello".to_vec());
    let seen = collect(&mut at_web, "news", std::time::Duration::from_millis(200)).await;
    assert_eq!(seen.len(), 1);

    rpc.shutdown().await;
    let ctx = &web;
    assert!(eventually(WAIT, || async move { !ctx.has_connect(RPC_1).await }).await);
}

#[tokio::test]
async fn test_wrong_secret_is_refused() {
    let port = free_port();
    let rpc = tcp_process(tcp_config(RPC_1, port, "s3cret"));
    rpc.serve(RPC_1).await.unwrap();

    let web = tcp_process(tcp_config("web-1", port, "guess"));
    let err = web.connect(RPC_1, false).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Connection {
            source: TransportError::Refused { .. },
            ..
        }
    ));
    assert!(!web.has_connect(RPC_1).await);
}

#[tokio::test]
async fn test_deferred_tcp_connect_retries_until_listener_appears() {
    let port = free_port();
    let web = tcp_process(tcp_config("web-1", port, "s3cret"));

    web.connect(RPC_1, true).await.unwrap();
    assert!(web.retry_task(RPC_1).await.is_some());

    let rpc = tcp_process(tcp_config(RPC_1, port, "s3cret"));
    rpc.serve(RPC_1).await.unwrap();

    assert!(until_connected(&web, RPC_1).await);
    web.shutdown().await;
    rpc.shutdown().await;
}

#[tokio::test]
async fn test_oversized_event_keeps_tcp_peer_connected() {
    let port = free_port();
    let limited = |node_id: &str| {
        let mut config = tcp_config(node_id, port, "s3cret");
        config.limits.max_frame_bytes = 1024;
        tcp_process(config)
    };
    let rpc = limited(RPC_1);
    rpc.serve(RPC_1).await.unwrap();
    let web = limited("web-1");
    web.connect(RPC_1, false).await.unwrap();
    assert!(until_linked(&rpc, "web-1").await);
    let mut at_web = web.emitter().receiver();

    rpc.publish("big", vec![0u8; 4096]);
    rpc.publish("small", b"fits".to_vec());

    let seen = collect(&mut at_web, "small", std::time::Duration::from_millis(200)).await;
    assert_eq!(seen.len(), 1);
    assert!(web.has_connect(RPC_1).await);
    assert_eq!(
        web.registry().get(RPC_1).await.map(|c| c.is_closed()),
        Some(false)
    );
}
