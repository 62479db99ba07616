//! Transport contract between a relay node and the network.
//!
//! A transport offers four kinds of channel, each bound to one port of an
//! [`Endpoint`](crate::endpoint::Endpoint):
//!
//! - a broadcast publisher every connected peer subscribes to
//! - point-to-point push channels to connected peers, carrying flood copies
//! - directed dealer channels to connected peers' routers, carrying
//!   identity-addressed routed messages
//! - a one-shot cleartext request channel (for bootstrap)
//! - a cleartext reply service answering those requests
//!
//! Inbound traffic is multiplexed onto a single [`TransportEvent`] stream
//! tagged with the [`ChannelRole`] it arrived on; the reactor selects over
//! it. Reply-service requests arrive on a separate [`CleartextRequest`]
//! stream so bootstrap answers never wait behind relay traffic.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::{ChannelRole, Endpoint};
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::keyring::PeerKey;
use crate::message::Frames;

/// Capacity of the inbound event and request channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Frames that arrived on one of the node's channels.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// The role of the local channel the frames arrived on.
    pub role: ChannelRole,
    /// Identity of the sending peer.
    pub from: PeerId,
    pub frames: Frames,
}

/// A cleartext request awaiting exactly one reply.
#[derive(Debug)]
pub struct CleartextRequest {
    pub frames: Frames,
    pub reply: oneshot::Sender<Frames>,
}

/// Receiving halves handed out when a transport is bound.
#[derive(Debug)]
pub struct TransportChannels {
    pub events: mpsc::Receiver<TransportEvent>,
    pub requests: mpsc::Receiver<CleartextRequest>,
}

/// The relay-facing half of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `frames` to every subscriber of this node.
    async fn publish(&self, frames: Frames) -> Result<(), TransportError>;

    /// Send `frames` to one directly connected peer.
    ///
    /// Fails with [`TransportError::Unreachable`] when no channel to `peer`
    /// exists or the send does not go through.
    async fn send_direct(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError>;

    /// Send an encoded routed message to `peer`'s router.
    ///
    /// Fails like [`Transport::send_direct`]; the relay queues the message
    /// for retry when it does.
    async fn send_directed(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError>;

    /// Identities reachable through an open point-to-point channel.
    fn direct_peers(&self) -> Vec<PeerId>;

    /// Subscribe to `peer`'s broadcasts and open push and dealer channels
    /// to it.
    async fn connect(&self, endpoint: &Endpoint, peer: &PeerKey) -> Result<(), TransportError>;

    /// Stop accepting traffic and drop every channel.
    async fn close(&self);
}

/// One-shot cleartext request/reply, used before a peer's key is known.
#[async_trait]
pub trait CleartextRequester: Send + Sync {
    async fn request(&self, endpoint: &Endpoint, frames: Frames) -> Result<Frames, TransportError>;
}
