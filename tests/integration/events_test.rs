//! Event relay between processes.

use std::time::Duration;

use futures::StreamExt;
use peerlink::bus::Origin;
use peerlink::transport::MemoryTransport;

use crate::common::*;

const WINDOW: Duration = Duration::from_millis(250);

/// rpc-1, rpc-2 and web-1, with the RPC servers connected to each other in
/// both directions.
async fn mesh(network: &MemoryTransport) -> (Node, Node, Node) {
    let rpc1 = Node::serving(network, RPC_1).await;
    let rpc2 = Node::serving(network, RPC_2).await;
    let web = Node::new(network, "web-1");

    rpc1.ctx.connect_all(false).await.unwrap();
    rpc2.ctx.connect_all(false).await.unwrap();
    web.ctx.connect_all(false).await.unwrap();

    for (ctx, peers) in [
        (&rpc1.ctx, ["rpc-2", "web-1"]),
        (&rpc2.ctx, ["rpc-1", "web-1"]),
        (&web.ctx, ["rpc-1", "rpc-2"]),
    ] {
        for peer in peers {
            assert!(until_linked(ctx, peer).await, "{} not linked", peer);
        }
    }
    (rpc1, rpc2, web)
}

#[tokio::test]
async fn test_publish_reaches_every_peer_exactly_once() {
    let network = MemoryTransport::new();
    let (rpc1, rpc2, web) = mesh(&network).await;
    let mut at_rpc1 = rpc1.ctx.emitter().receiver();
    let mut at_rpc2 = rpc2.ctx.emitter().receiver();
    let mut at_web = web.ctx.emitter().receiver();

    web.ctx.publish("orders", b"from-web".to_vec());

    let web_origin = Origin::Peer("web-1".to_string());
    assert_eq!(
        collect(&mut at_rpc1, "orders", WINDOW).await,
        vec![(web_origin.clone(), b"from-web".to_vec())]
    );
    assert_eq!(
        collect(&mut at_rpc2, "orders", WINDOW).await,
        vec![(web_origin, b"from-web".to_vec())]
    );
    assert_eq!(
        collect(&mut at_web, "orders", WINDOW).await,
        vec![(Origin::Local, b"from-web".to_vec())]
    );
}

#[tokio::test]
async fn test_mutual_connections_do_not_duplicate_events() {
    let network = MemoryTransport::new();
    let (rpc1, rpc2, _web) = mesh(&network).await;
    let mut at_rpc2 = rpc2.ctx.emitter().receiver();

    rpc1.ctx.publish("jobs", b"1".to_vec());

    let seen = collect(&mut at_rpc2, "jobs", WINDOW).await;
    assert_eq!(seen, vec![(Origin::Peer(RPC_1.to_string()), b"1".to_vec())]);
}

#[tokio::test]
async fn test_relayed_events_are_not_forwarded_again() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let rpc2 = Node::serving(&network, RPC_2).await;
    let web = Node::new(&network, "web-1");

    // Only web-1 is connected to both servers.
    web.ctx.connect_all(false).await.unwrap();
    assert!(until_linked(&rpc1.ctx, "web-1").await);
    assert!(until_linked(&rpc2.ctx, "web-1").await);
    let mut at_rpc2 = rpc2.ctx.emitter().receiver();
    let mut at_web = web.ctx.emitter().receiver();

    rpc1.ctx.publish("jobs", b"1".to_vec());

    assert_eq!(
        collect(&mut at_web, "jobs", WINDOW).await,
        vec![(Origin::Peer(RPC_1.to_string()), b"1".to_vec())]
    );
    assert!(collect(&mut at_rpc2, "jobs", WINDOW).await.is_empty());
}

#[tokio::test]
async fn test_events_from_one_peer_arrive_in_order() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    web.ctx.connect(RPC_1, false).await.unwrap();
    assert!(until_linked(&rpc1.ctx, "web-1").await);
    let mut at_rpc1 = rpc1.ctx.emitter().receiver();

    for i in 0..100u8 {
        web.ctx.publish("seq", vec![i]);
    }

    let payloads: Vec<Vec<u8>> = collect(&mut at_rpc1, "seq", WINDOW)
        .await
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    let expected: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i]).collect();
    assert_eq!(payloads, expected);
}

#[tokio::test]
async fn test_subscribers_see_local_and_remote_events() {
    let network = MemoryTransport::new();
    let rpc1 = Node::serving(&network, RPC_1).await;
    let web = Node::new(&network, "web-1");
    web.ctx.connect(RPC_1, false).await.unwrap();
    assert!(until_linked(&rpc1.ctx, "web-1").await);

    let mut stream = Box::pin(web.ctx.emitter().stream("audit"));
    web.ctx.publish("audit.login", b"local".to_vec());
    rpc1.ctx.publish("audit.logout", b"remote".to_vec());

    let mut topics = Vec::new();
    for _ in 0..2 {
        let envelope = tokio::time::timeout(WAIT, stream.next())
            .await
            .unwrap()
            .unwrap();
        topics.push(envelope.topic.clone());
    }
    topics.sort();
    assert_eq!(topics, vec!["audit.login", "audit.logout"]);
}
