//! End-to-end relay nodes over the in-memory transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mesh_relay::transport::memory::MemoryNetwork;
use mesh_relay::{Endpoint, FileKeyring, KeyStore, Message, PeerId, RelayConfig, RelayNode};

fn endpoint(port: u16) -> Endpoint {
    Endpoint::parse(&format!("mem:{port}")).unwrap()
}

async fn start(net: &MemoryNetwork, name: &str, port: u16, dir: &Path) -> RelayNode {
    let keyring_dir = dir.join(name);
    let config = RelayConfig {
        identity: Some(PeerId::from(name)),
        keyring_dir: keyring_dir.clone(),
        poll_interval: Duration::from_millis(200),
        ..RelayConfig::default()
    };
    let (transport, channels) = net.bind(PeerId::from(name), &endpoint(port));
    RelayNode::start(
        PeerId::from(name),
        config,
        Arc::new(transport),
        channels,
        Arc::new(net.clone()),
        Arc::new(FileKeyring::new(keyring_dir)),
    )
    .await
    .unwrap()
}

/// Connect each adjacent pair in both directions.
async fn link_line(nodes: &[&RelayNode], ports: &[u16]) {
    for i in 0..nodes.len() - 1 {
        nodes[i].connect(&endpoint(ports[i + 1])).await.unwrap();
        nodes[i + 1].connect(&endpoint(ports[i])).await.unwrap();
    }
}

/// Poll until `want` messages arrived or `deadline` passed.
async fn collect(node: &mut RelayNode, want: usize, deadline: Duration) -> Vec<Message> {
    let start = tokio::time::Instant::now();
    let mut got = Vec::new();
    while got.len() < want && start.elapsed() < deadline {
        got.extend(node.poll(Duration::from_millis(100)).await.unwrap());
    }
    got
}

#[tokio::test]
async fn broadcast_crosses_a_line() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1000, dir.path()).await;
    let mut b = start(&net, "b", 2000, dir.path()).await;
    let mut c = start(&net, "c", 3000, dir.path()).await;
    link_line(&[&a, &b, &c], &[1000, 2000, 3000]).await;

    a.publish("* enter").await.unwrap();

    let at_b = collect(&mut b, 1, Duration::from_secs(2)).await;
    let at_c = collect(&mut c, 1, Duration::from_secs(2)).await;
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].text(), "* enter");
    assert_eq!(at_c[0].origin(), "a");

    // Nothing else trickles in afterwards.
    assert!(c.poll(Duration::from_millis(200)).await.unwrap().is_empty());

    for node in [a, b, c] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn routed_message_reaches_only_its_destination() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1000, dir.path()).await;
    let mut b = start(&net, "b", 2000, dir.path()).await;
    let mut c = start(&net, "c", 3000, dir.path()).await;
    link_line(&[&a, &b, &c], &[1000, 2000, 3000]).await;

    a.route_to(&PeerId::from("c"), "for c only").await.unwrap();

    let at_c = collect(&mut c, 1, Duration::from_secs(5)).await;
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].text(), "for c only");
    assert_eq!(at_c[0].origin(), "a");

    let at_b = b.poll(Duration::from_millis(200)).await.unwrap();
    assert!(at_b.iter().all(|m| m.text() != "for c only"));

    for node in [a, b, c] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn bootstrap_persists_peer_keys() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1000, dir.path()).await;
    let b = start(&net, "b", 2000, dir.path()).await;

    assert_eq!(a.connect(&endpoint(2000)).await.unwrap(), PeerId::from("b"));

    let keyring = FileKeyring::new(dir.path().join("a"));
    let learned = keyring.load_peer_key(&PeerId::from("b")).unwrap().unwrap();
    let own = FileKeyring::new(dir.path().join("b"))
        .load_or_create_keypair(&PeerId::from("b"))
        .unwrap();
    assert_eq!(learned.public_key, own.public_key);
    assert_eq!(learned.address, "mem:2000");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn dead_peer_failures_are_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1000, dir.path()).await;
    let b = start(&net, "b", 2000, dir.path()).await;
    b.connect(&endpoint(1000)).await.unwrap();
    a.shutdown().await.unwrap();

    // The peer's channels to `a` are dead; sends are absorbed, not surfaced.
    b.publish("still here").await.unwrap();
    b.route_to(&PeerId::from("a"), "hello?").await.unwrap();
    b.shutdown().await.unwrap();
}
