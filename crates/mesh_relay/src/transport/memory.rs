//! In-process transport: every node on one [`MemoryNetwork`] hub.
//!
//! Nodes register under their endpoint's address key (`host:pub_port`) and
//! exchange frames over tokio channels. A node whose receivers are gone
//! (shut down, or never bound) is unreachable, exactly like a dead socket.
//!
//! Sends never wait on a full event queue. Publishing drops the copy for
//! that subscriber, the way a saturated broadcast socket would, and a
//! point-to-point send reports the peer unreachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    CleartextRequest, CleartextRequester, EVENT_CHANNEL_CAPACITY, Transport, TransportChannels,
    TransportEvent,
};
use crate::endpoint::{ChannelRole, Endpoint};
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::keyring::PeerKey;
use crate::message::Frames;

type Subscribers = Arc<Mutex<Vec<(PeerId, mpsc::Sender<TransportEvent>)>>>;

/// What the hub knows about a bound node.
#[derive(Clone)]
struct Station {
    events: mpsc::Sender<TransportEvent>,
    requests: mpsc::Sender<CleartextRequest>,
    subscribers: Subscribers,
}

/// Shared registry of in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    stations: Arc<Mutex<HashMap<String, Station>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a node at `endpoint`. Rebinding an address replaces the old node.
    pub fn bind(&self, identity: PeerId, endpoint: &Endpoint) -> (MemoryTransport, TransportChannels) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let subscribers: Subscribers = Arc::default();
        let address = endpoint.address_key();

        self.stations.lock().insert(
            address.clone(),
            Station {
                events: event_tx.clone(),
                requests: request_tx,
                subscribers: subscribers.clone(),
            },
        );
        debug!("Bound in-memory node {identity} at {address}");

        let transport = MemoryTransport {
            network: self.clone(),
            identity,
            address,
            events: event_tx,
            subscribers,
            direct: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        let channels = TransportChannels {
            events: event_rx,
            requests: request_rx,
        };
        (transport, channels)
    }

    fn station(&self, endpoint: &Endpoint) -> Option<Station> {
        self.stations.lock().get(&endpoint.address_key()).cloned()
    }

    fn unbind(&self, address: &str) {
        self.stations.lock().remove(address);
    }
}

#[async_trait]
impl CleartextRequester for MemoryNetwork {
    async fn request(&self, endpoint: &Endpoint, frames: Frames) -> Result<Frames, TransportError> {
        let station = self
            .station(endpoint)
            .ok_or_else(|| TransportError::Unreachable(endpoint.format(ChannelRole::Reply)))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        station
            .requests
            .send(CleartextRequest {
                frames,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    identity: PeerId,
    address: String,
    events: mpsc::Sender<TransportEvent>,
    subscribers: Subscribers,
    direct: Mutex<HashMap<PeerId, mpsc::Sender<TransportEvent>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Hand `frames` to a connected peer as if they arrived on its `role`
    /// channel.
    fn send_to_peer(&self, peer: &PeerId, role: ChannelRole, frames: Frames) -> Result<(), TransportError> {
        self.ensure_open()?;
        let tx = self
            .direct
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        let event = TransportEvent {
            role,
            from: self.identity.clone(),
            frames,
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(TransportError::Unreachable(format!("{peer} ({} queue full)", role.name())))
            }
            Err(TrySendError::Closed(_)) => {
                self.direct.lock().remove(peer);
                Err(TransportError::Unreachable(peer.to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, frames: Frames) -> Result<(), TransportError> {
        self.ensure_open()?;
        let subscribers = self.subscribers.lock().clone();
        let mut gone = Vec::new();
        for (peer, tx) in subscribers {
            let event = TransportEvent {
                role: ChannelRole::Subscribe,
                from: self.identity.clone(),
                frames: frames.clone(),
            };
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Subscriber {peer} is saturated, dropping one publish"),
                Err(TrySendError::Closed(_)) => gone.push(peer),
            }
        }
        if !gone.is_empty() {
            self.subscribers.lock().retain(|(peer, _)| !gone.contains(peer));
        }
        Ok(())
    }

    async fn send_direct(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError> {
        self.send_to_peer(peer, ChannelRole::Pull, frames)
    }

    async fn send_directed(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError> {
        self.send_to_peer(peer, ChannelRole::Router, frames)
    }

    fn direct_peers(&self) -> Vec<PeerId> {
        self.direct.lock().keys().cloned().collect()
    }

    async fn connect(&self, endpoint: &Endpoint, peer: &PeerKey) -> Result<(), TransportError> {
        self.ensure_open()?;
        let station = self
            .network
            .station(endpoint)
            .ok_or_else(|| TransportError::Unreachable(endpoint.format(ChannelRole::Subscribe)))?;

        {
            let mut subs = station.subscribers.lock();
            subs.retain(|(id, _)| *id != self.identity);
            subs.push((self.identity.clone(), self.events.clone()));
        }
        self.direct.lock().insert(peer.identity.clone(), station.events);
        debug!("{} connected to {} at {}", self.identity, peer.identity, endpoint);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unbind(&self.address);
        self.subscribers.lock().clear();
        self.direct.lock().clear();
    }
}

#[async_trait]
impl CleartextRequester for MemoryTransport {
    async fn request(&self, endpoint: &Endpoint, frames: Frames) -> Result<Frames, TransportError> {
        self.network.request(endpoint, frames).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::parse(&format!("mem:{port}")).unwrap()
    }

    fn key(name: &str) -> PeerKey {
        PeerKey::new(PeerId::from(name), vec![0; 32], "mem")
    }

    fn frames(parts: &[&str]) -> Frames {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.bind(PeerId::from("a"), &endpoint(1000));
        let (b, mut b_rx) = net.bind(PeerId::from("b"), &endpoint(2000));

        b.connect(&endpoint(1000), &key("a")).await.unwrap();
        a.publish(frames(&["hello"])).await.unwrap();

        let event = b_rx.events.recv().await.unwrap();
        assert_eq!(event.role, ChannelRole::Subscribe);
        assert_eq!(event.from, PeerId::from("a"));
        assert_eq!(event.frames, frames(&["hello"]));
    }

    #[tokio::test]
    async fn test_send_direct_needs_connection() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.bind(PeerId::from("a"), &endpoint(1000));
        let (b, mut b_rx) = net.bind(PeerId::from("b"), &endpoint(2000));

        let err = a.send_direct(&PeerId::from("b"), frames(&["x"])).await;
        assert!(matches!(err, Err(TransportError::Unreachable(_))));

        a.connect(&endpoint(2000), &key("b")).await.unwrap();
        assert_eq!(a.direct_peers(), vec![PeerId::from("b")]);
        a.send_direct(&PeerId::from("b"), frames(&["x"])).await.unwrap();
        let event = b_rx.events.recv().await.unwrap();
        assert_eq!(event.role, ChannelRole::Pull);

        a.send_directed(&PeerId::from("b"), frames(&["b", "<a:1.0>", "routed"]))
            .await
            .unwrap();
        let event = b_rx.events.recv().await.unwrap();
        assert_eq!(event.role, ChannelRole::Router);
        assert_eq!(event.from, PeerId::from("a"));

        drop(b_rx);
        b.close().await;
        let err = a.send_direct(&PeerId::from("b"), frames(&["y"])).await;
        assert!(matches!(err, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks_the_sender() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.bind(PeerId::from("a"), &endpoint(1000));
        let (_b, mut b_rx) = net.bind(PeerId::from("b"), &endpoint(2000));
        a.connect(&endpoint(2000), &key("b")).await.unwrap();

        for i in 0..EVENT_CHANNEL_CAPACITY {
            a.send_direct(&PeerId::from("b"), frames(&[i.to_string().as_str()])).await.unwrap();
        }
        let err = a.send_directed(&PeerId::from("b"), frames(&["overflow"])).await;
        assert!(matches!(err, Err(TransportError::Unreachable(_))));

        // Draining one slot makes the peer reachable again.
        b_rx.events.recv().await.unwrap();
        a.send_directed(&PeerId::from("b"), frames(&["fits"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_saturated_subscriber_drops_publish() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.bind(PeerId::from("a"), &endpoint(1000));
        let (b, mut b_rx) = net.bind(PeerId::from("b"), &endpoint(2000));
        b.connect(&endpoint(1000), &key("a")).await.unwrap();

        let sent = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            for i in 0..EVENT_CHANNEL_CAPACITY + 10 {
                a.publish(frames(&[i.to_string().as_str()])).await.unwrap();
            }
        })
        .await;
        assert!(sent.is_ok(), "publish blocked on a full subscriber");

        let mut received = 0;
        while b_rx.events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_cleartext_request_reply() {
        let net = MemoryNetwork::new();
        let (_b, mut b_rx) = net.bind(PeerId::from("b"), &endpoint(2000));

        tokio::spawn(async move {
            let req = b_rx.requests.recv().await.unwrap();
            assert_eq!(req.frames, frames(&["who are you?"]));
            let _ = req.reply.send(frames(&["b", "key"]));
        });

        let reply = net.request(&endpoint(2000), frames(&["who are you?"])).await.unwrap();
        assert_eq!(reply, frames(&["b", "key"]));

        let err = net.request(&endpoint(3000), frames(&["who are you?"])).await;
        assert!(matches!(err, Err(TransportError::Unreachable(_))));
    }
}
