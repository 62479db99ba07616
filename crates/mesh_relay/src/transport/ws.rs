//! WebSocket transport: one listener per bound channel role.
//!
//! A node binds four WebSocket servers on its endpoint:
//!
//! - `pub` port: peers connect to subscribe; every publish is written to
//!   each subscriber connection
//! - `pull` port: peers connect to push flood copies; the first message on
//!   such a connection is a text frame naming the sender
//! - `router` port: peers connect as dealers to hand over routed messages,
//!   introduced the same way
//! - `rep` port: one cleartext request and one reply per connection
//!
//! Each logical multipart message travels as one binary WebSocket message
//! whose frames are each prefixed by a big-endian `u32` length. Every
//! connection has a single writer task fed by an unbounded channel, so
//! frames on one channel keep their order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use super::{
    CleartextRequest, CleartextRequester, EVENT_CHANNEL_CAPACITY, Transport, TransportChannels,
    TransportEvent,
};
use crate::endpoint::{ChannelRole, Endpoint};
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::keyring::PeerKey;
use crate::message::{Frame, Frames};
use crate::shutdown::Shutdown;

const LENGTH_PREFIX: usize = 4;

type Outbound = mpsc::UnboundedSender<Frames>;

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Pack a multipart message into one length-prefixed buffer.
pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let total = frames.iter().map(|f| f.len() + LENGTH_PREFIX).sum();
    let mut buf = Vec::with_capacity(total);
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Unpack a buffer produced by [`encode_frames`].
pub fn decode_frames(mut data: &[u8]) -> Result<Frames, TransportError> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        if data.len() < LENGTH_PREFIX {
            return Err(TransportError::Codec(format!(
                "truncated length prefix ({} bytes)",
                data.len()
            )));
        }
        let (prefix, rest) = data.split_at(LENGTH_PREFIX);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if rest.len() < len {
            return Err(TransportError::Codec(format!(
                "frame of {len} bytes but only {} remain",
                rest.len()
            )));
        }
        let (frame, tail) = rest.split_at(len);
        frames.push(frame.to_vec());
        data = tail;
    }
    Ok(frames)
}

// ---------------------------------------------------------------------------
// WsTransport
// ---------------------------------------------------------------------------

/// State shared between the transport handle and its background tasks.
struct Shared {
    identity: PeerId,
    events: mpsc::Sender<TransportEvent>,
    requests: mpsc::Sender<CleartextRequest>,
    subscribers: Mutex<HashMap<u64, Outbound>>,
    /// Push channels, keyed by the peer they reach.
    direct: Mutex<HashMap<PeerId, Outbound>>,
    /// Dealer channels, keyed by the peer they reach.
    directed: Mutex<HashMap<PeerId, Outbound>>,
    next_conn: AtomicU64,
    shutdown: Shutdown,
}

/// A [`Transport`] over WebSocket connections.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Bind the `pub`, `pull`, `router` and `rep` listeners of `endpoint`.
    pub async fn bind(
        identity: PeerId,
        endpoint: &Endpoint,
    ) -> Result<(Self, TransportChannels), TransportError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            identity,
            events: event_tx,
            requests: request_tx,
            subscribers: Mutex::new(HashMap::new()),
            direct: Mutex::new(HashMap::new()),
            directed: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            shutdown: Shutdown::new(),
        });

        for role in [
            ChannelRole::Publish,
            ChannelRole::Pull,
            ChannelRole::Router,
            ChannelRole::Reply,
        ] {
            let addr = endpoint.bind_addr(role);
            let listener = TcpListener::bind(&addr).await?;
            info!("{} listening for {} connections on {addr}", shared.identity, role.name());
            tokio::spawn(accept_loop(listener, role, shared.clone()));
        }

        let channels = TransportChannels {
            events: event_rx,
            requests: request_rx,
        };
        Ok((Self { shared }, channels))
    }

    pub fn identity(&self) -> &PeerId {
        &self.shared.identity
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, frames: Frames) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared
            .subscribers
            .lock()
            .retain(|_, tx| tx.send(frames.clone()).is_ok());
        Ok(())
    }

    async fn send_direct(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError> {
        self.ensure_open()?;
        send_on(&self.shared.direct, peer, frames)
    }

    async fn send_directed(&self, peer: &PeerId, frames: Frames) -> Result<(), TransportError> {
        self.ensure_open()?;
        send_on(&self.shared.directed, peer, frames)
    }

    fn direct_peers(&self) -> Vec<PeerId> {
        self.shared.direct.lock().keys().cloned().collect()
    }

    async fn connect(&self, endpoint: &Endpoint, peer: &PeerKey) -> Result<(), TransportError> {
        self.ensure_open()?;
        let shared = &self.shared;

        // Broadcast subscription.
        let (sub_ws, _) = connect_async(ws_url(endpoint, ChannelRole::Subscribe))
            .await
            .map_err(|e| TransportError::WebSocket(format!("Subscribe to {endpoint} failed: {e}")))?;
        tokio::spawn(subscribe_loop(sub_ws, peer.identity.clone(), shared.clone()));

        open_sender(shared, endpoint, ChannelRole::Push, &peer.identity).await?;
        open_sender(shared, endpoint, ChannelRole::Dealer, &peer.identity).await?;

        info!("{} connected to {} at {endpoint}", shared.identity, peer.identity);
        Ok(())
    }

    async fn close(&self) {
        self.shared.shutdown.trigger();
        self.shared.subscribers.lock().clear();
        self.shared.direct.lock().clear();
        self.shared.directed.lock().clear();
    }
}

#[async_trait]
impl CleartextRequester for WsTransport {
    async fn request(&self, endpoint: &Endpoint, frames: Frames) -> Result<Frames, TransportError> {
        WsRequester.request(endpoint, frames).await
    }
}

/// A stand-alone [`CleartextRequester`] that dials a fresh connection per
/// request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsRequester;

#[async_trait]
impl CleartextRequester for WsRequester {
    async fn request(&self, endpoint: &Endpoint, frames: Frames) -> Result<Frames, TransportError> {
        let url = ws_url(endpoint, ChannelRole::Request);
        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| TransportError::WebSocket(format!("Connect to {url} failed: {e}")))?;
        ws.send(WsMessage::Binary(encode_frames(&frames).into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg.map_err(|e| TransportError::WebSocket(e.to_string()))? {
                WsMessage::Binary(data) => {
                    let reply = decode_frames(&data)?;
                    let _ = ws.close(None).await;
                    return Ok(reply);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Err(TransportError::Closed)
    }
}

fn ws_url(endpoint: &Endpoint, role: ChannelRole) -> String {
    format!("ws://{}", endpoint.dial_addr(role))
}

impl Shared {
    /// Outbound channels opened for a connecting-side `role`.
    fn senders(&self, role: ChannelRole) -> &Mutex<HashMap<PeerId, Outbound>> {
        match role {
            ChannelRole::Dealer => &self.directed,
            _ => &self.direct,
        }
    }
}

fn send_on(senders: &Mutex<HashMap<PeerId, Outbound>>, peer: &PeerId, frames: Frames) -> Result<(), TransportError> {
    let mut senders = senders.lock();
    let tx = senders
        .get(peer)
        .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
    if tx.send(frames).is_err() {
        senders.remove(peer);
        return Err(TransportError::Unreachable(peer.to_string()));
    }
    Ok(())
}

/// Dial `peer`'s listener for `role`, introduce ourselves, and register a
/// writer task for the connection.
async fn open_sender(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    role: ChannelRole,
    peer: &PeerId,
) -> Result<(), TransportError> {
    let (mut ws, _) = connect_async(ws_url(endpoint, role))
        .await
        .map_err(|e| TransportError::WebSocket(format!("{} to {endpoint} failed: {e}", role.name())))?;
    ws.send(WsMessage::Text(shared.identity.to_string().into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    shared.senders(role).lock().insert(peer.clone(), tx.clone());
    let task_shared = shared.clone();
    let peer_id = peer.clone();
    tokio::spawn(async move {
        let label = format!("{} to {peer_id}", role.name());
        pump_outbound(ws, rx, &task_shared.shutdown, &label).await;
        let mut senders = task_shared.senders(role).lock();
        if senders.get(&peer_id).is_some_and(|cur| cur.same_channel(&tx)) {
            senders.remove(&peer_id);
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, role: ChannelRole, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted {} connection from {peer_addr}", role.name());
                        tokio::spawn(serve_connection(stream, role, shared.clone()));
                    }
                    Err(e) => error!("TCP accept failed on {} listener: {e}", role.name()),
                }
            }
            _ = shared.shutdown.cancelled() => {
                debug!("{} listener shutting down", role.name());
                break;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, role: ChannelRole, shared: Arc<Shared>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed on {} port: {e}", role.name());
            return;
        }
    };

    match role {
        ChannelRole::Publish => {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
            shared.subscribers.lock().insert(conn, tx);
            pump_outbound(ws, rx, &shared.shutdown, "subscriber").await;
            shared.subscribers.lock().remove(&conn);
        }
        ChannelRole::Pull | ChannelRole::Router => collect_loop(ws, role, &shared).await,
        ChannelRole::Reply => reply_once(ws, &shared).await,
        other => error!("No listener behaviour for channel role {other:?}"),
    }
}

/// Write queued messages to `ws` until the queue closes, the peer goes
/// away, or shutdown.
async fn pump_outbound<S>(
    mut ws: S,
    mut rx: mpsc::UnboundedReceiver<Frames>,
    shutdown: &Shutdown,
    label: &str,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(frames) = queued else { break };
                if let Err(e) = ws.send(WsMessage::Binary(encode_frames(&frames).into())).await {
                    debug!("Write to {label} failed: {e}");
                    return;
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("{label} closed");
                        return;
                    }
                    Some(Err(e)) => {
                        debug!("Read error on {label}: {e}");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    let _ = ws.send(WsMessage::Close(None)).await;
}

/// Read point-to-point traffic from one pushing or dealing peer.
async fn collect_loop<S>(mut ws: S, role: ChannelRole, shared: &Shared)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let from = loop {
        tokio::select! {
            first = ws.next() => match first {
                Some(Ok(WsMessage::Text(name))) => break PeerId::from(name.as_str()),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Ok(_)) => {
                    debug!("{} connection did not introduce itself, closing", role.name());
                    return;
                }
                Some(Err(_)) | None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        }
    };
    debug!("{} accepted {} channel from {from}", shared.identity, role.name());
    forward_inbound(ws, role, from, shared).await;
}

async fn subscribe_loop<S>(ws: S, from: PeerId, shared: Arc<Shared>)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    forward_inbound(ws, ChannelRole::Subscribe, from, &shared).await;
}

/// Decode every binary message on `ws` into a [`TransportEvent`].
async fn forward_inbound<S>(mut ws: S, role: ChannelRole, from: PeerId, shared: &Shared)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            msg = ws.next() => msg,
            _ = shared.shutdown.cancelled() => return,
        };
        match msg {
            Some(Ok(WsMessage::Binary(data))) => match decode_frames(&data) {
                Ok(frames) => {
                    let event = TransportEvent {
                        role,
                        from: from.clone(),
                        frames,
                    };
                    if shared.events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!("Dropping undecodable {} message from {from}: {e}", role.name()),
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("{} channel from {from} closed", role.name());
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Read error on {} channel from {from}: {e}", role.name());
                return;
            }
        }
    }
}

/// Answer one cleartext request through the reply service.
async fn reply_once<S>(mut ws: S, shared: &Shared)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let frames = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => match decode_frames(&data) {
                Ok(frames) => break frames,
                Err(e) => {
                    debug!("Dropping undecodable request: {e}");
                    return;
                }
            },
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = CleartextRequest {
        frames,
        reply: reply_tx,
    };
    if shared.requests.send(request).await.is_err() {
        debug!("Reply service is gone, dropping request");
        return;
    }
    match reply_rx.await {
        Ok(reply) => {
            if let Err(e) = ws.send(WsMessage::Binary(encode_frames(&reply).into())).await {
                debug!("Failed to send reply: {e}");
            }
        }
        Err(_) => debug!("Reply service dropped the request"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
