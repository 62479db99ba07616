//! RelayNode: the running node and its reactor.
//!
//! [`RelayNode`] is the public API of mesh_relay. Starting a node spawns two
//! tasks:
//! - the reactor, which owns the [`Relay`] state and multiplexes transport
//!   events, local publish/route commands and a housekeeping tick
//! - the who-are-you reply service
//!
//! Messages surfaced by the relay are collected with [`RelayNode::poll`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::bootstrap::{learn_or_load_peer_key, run_reply_service};
use crate::config::RelayConfig;
use crate::endpoint::{ChannelRole, Endpoint};
use crate::error::RelayError;
use crate::identity::PeerId;
use crate::keyring::{FileKeyring, KeyStore};
use crate::message::Message;
use crate::relay::{Action, Input, Relay};
use crate::shutdown::Shutdown;
use crate::transport::ws::{WsRequester, WsTransport};
use crate::transport::{CleartextRequester, Transport, TransportChannels, TransportEvent};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// A running relay node.
pub struct RelayNode {
    identity: PeerId,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    requester: Arc<dyn CleartextRequester>,
    keystore: Arc<dyn KeyStore>,
    commands: mpsc::Sender<Input>,
    delivered: mpsc::UnboundedReceiver<Message>,
    shutdown: Shutdown,
    reactor: JoinHandle<Result<(), RelayError>>,
    reply_service: JoinHandle<()>,
}

impl RelayNode {
    /// Start a node over an already-bound transport.
    pub async fn start(
        identity: PeerId,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        channels: TransportChannels,
        requester: Arc<dyn CleartextRequester>,
        keystore: Arc<dyn KeyStore>,
    ) -> Result<Self, RelayError> {
        let keypair = keystore.load_or_create_keypair(&identity)?;
        let shutdown = Shutdown::new();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();

        let reply_service = tokio::spawn(
            run_reply_service(
                identity.clone(),
                keypair.public_key,
                channels.requests,
                shutdown.clone(),
            )
            .instrument(info_span!("reply", node = %identity)),
        );

        let reactor = Reactor {
            relay: Relay::new(identity.clone(), config.relay_settings()),
            transport: transport.clone(),
            events: channels.events,
            commands: command_rx,
            delivered: delivered_tx,
            poll_interval: config.poll_interval,
            shutdown: shutdown.clone(),
        };
        let reactor = tokio::spawn(reactor.run().instrument(info_span!("relay", node = %identity)));

        info!("Relay node {identity} started");
        Ok(Self {
            identity,
            config,
            transport,
            requester,
            keystore,
            commands: command_tx,
            delivered: delivered_rx,
            shutdown,
            reactor,
            reply_service,
        })
    }

    /// Bind WebSocket listeners on the configured local address and start a
    /// node with a file keyring.
    pub async fn start_ws(config: RelayConfig) -> Result<Self, RelayError> {
        let local = config.local_endpoint()?;
        let identity = config.resolved_identity(&local);
        let (transport, channels) = WsTransport::bind(identity.clone(), &local).await?;
        let keystore = FileKeyring::new(config.keyring_dir.clone());
        Self::start(
            identity,
            config,
            Arc::new(transport),
            channels,
            Arc::new(WsRequester),
            Arc::new(keystore),
        )
        .await
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Flood `text` to every reachable node.
    pub async fn publish(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.submit(Input::Publish(vec![text.into()])).await
    }

    /// Send `text` to `dest` only, discovering a route if needed.
    pub async fn route_to(&self, dest: &PeerId, text: impl Into<String>) -> Result<(), RelayError> {
        self.submit(Input::Route {
            dest: dest.clone(),
            parts: vec![text.into()],
        })
        .await
    }

    async fn submit(&self, input: Input) -> Result<(), RelayError> {
        self.commands
            .send(input)
            .await
            .map_err(|_| RelayError::NotRunning)
    }

    /// Wait up to `timeout` for delivered messages and return every one
    /// available. Returns an empty list on timeout, and
    /// [`RelayError::NotRunning`] once the reactor has stopped and every
    /// delivered message was drained. The reactor's own error is reported by
    /// [`RelayNode::shutdown`].
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<Message>, RelayError> {
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, self.delivered.recv()).await {
            Ok(Some(msg)) => out.push(msg),
            Ok(None) => return Err(RelayError::NotRunning),
            Err(_) => return Ok(out),
        }
        while let Ok(msg) = self.delivered.try_recv() {
            out.push(msg);
        }
        Ok(out)
    }

    /// Bootstrap with the node at `endpoint` and open channels to it.
    /// Returns the peer's declared identity.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<PeerId, RelayError> {
        let key = learn_or_load_peer_key(
            self.requester.as_ref(),
            self.keystore.as_ref(),
            endpoint,
            self.config.bootstrap_timeout,
        )
        .await?;
        self.transport.connect(endpoint, &key).await?;
        info!("{} connected to {} at {endpoint}", self.identity, key.identity);
        Ok(key.identity)
    }

    /// Stop both tasks and close the transport. Surfaces the reactor's
    /// fatal error, if it had one.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        self.shutdown.trigger();

        let mut reply_service = self.reply_service;
        if tokio::time::timeout(self.config.shutdown_timeout, &mut reply_service)
            .await
            .is_err()
        {
            warn!("Reply service did not stop within {:?}, aborting", self.config.shutdown_timeout);
            reply_service.abort();
        }

        let outcome = match self.reactor.await {
            Ok(result) => result,
            Err(e) => {
                error!("Reactor task failed: {e}");
                Ok(())
            }
        };
        self.transport.close().await;
        info!("Relay node {} stopped", self.identity);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

struct Reactor {
    relay: Relay,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Input>,
    delivered: mpsc::UnboundedSender<Message>,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl Reactor {
    async fn run(mut self) -> Result<(), RelayError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let input = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.events.recv() => match classify_event(event) {
                    Ok(input) => input,
                    Err(e) => {
                        error!("Reactor stopping: {e}");
                        return Err(e);
                    }
                },
                Some(input) = self.commands.recv() => input,
                _ = ticker.tick() => Input::Housekeeping,
            };
            self.dispatch(input).await;
        }

        // Local commands submitted before shutdown still go out.
        while let Ok(input) = self.commands.try_recv() {
            self.dispatch(input).await;
        }
        debug!("Reactor stopped");
        Ok(())
    }

    /// React to `input`, execute the resulting actions, and feed failed
    /// routed sends back in until nothing is pending.
    async fn dispatch(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for action in self.relay.react(input) {
                match action {
                    Action::Publish(frames) => {
                        if let Err(e) = self.transport.publish(frames).await {
                            debug!("Publish failed: {e}");
                        }
                    }
                    Action::SendToPeers { except, frames } => {
                        for peer in self.transport.direct_peers() {
                            if except.as_ref() == Some(&peer) {
                                continue;
                            }
                            if let Err(e) = self.transport.send_direct(&peer, frames.clone()).await {
                                debug!("Relay to {peer} failed: {e}");
                            }
                        }
                    }
                    Action::SendRouted(msg) => {
                        let Some(hop) = msg.next_hop().cloned() else {
                            continue;
                        };
                        match self.transport.send_directed(&hop, msg.encode()).await {
                            Ok(()) => trace!("Sent {msg} via {hop}"),
                            Err(e) => {
                                debug!("Routed send via {hop} failed: {e}");
                                pending.push_back(Input::SendFailed(msg));
                            }
                        }
                    }
                    Action::Deliver(msg) => {
                        if self.delivered.send(msg).is_err() {
                            trace!("Delivery receiver dropped");
                        }
                    }
                }
            }
        }
    }
}

/// Map an inbound transport event onto a relay input by channel role.
fn classify_event(event: TransportEvent) -> Result<Input, RelayError> {
    let TransportEvent { role, from, frames } = event;
    match role {
        ChannelRole::Subscribe => Ok(Input::Broadcast { from, frames }),
        ChannelRole::Pull | ChannelRole::Router => Ok(Input::Direct { from, frames }),
        other => Err(RelayError::UnhandledChannel(other)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;

    fn test_config(dir: &std::path::Path) -> RelayConfig {
        RelayConfig {
            keyring_dir: dir.to_path_buf(),
            poll_interval: Duration::from_millis(50),
            ..RelayConfig::default()
        }
    }

    async fn start_node(net: &MemoryNetwork, name: &str, port: u16, dir: &std::path::Path) -> RelayNode {
        let endpoint = Endpoint::parse(&format!("mem:{port}")).unwrap();
        let (transport, channels) = net.bind(PeerId::from(name), &endpoint);
        RelayNode::start(
            PeerId::from(name),
            test_config(&dir.join(name)),
            Arc::new(transport),
            channels,
            Arc::new(net.clone()),
            Arc::new(FileKeyring::new(dir.join(name))),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_classify_event_roles() {
        let event = |role| TransportEvent {
            role,
            from: PeerId::from("p"),
            frames: vec![],
        };
        assert!(matches!(classify_event(event(ChannelRole::Subscribe)), Ok(Input::Broadcast { .. })));
        assert!(matches!(classify_event(event(ChannelRole::Pull)), Ok(Input::Direct { .. })));
        assert!(matches!(classify_event(event(ChannelRole::Router)), Ok(Input::Direct { .. })));
        assert!(matches!(
            classify_event(event(ChannelRole::Reply)),
            Err(RelayError::UnhandledChannel(ChannelRole::Reply))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_publish() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = start_node(&net, "a", 1000, dir.path()).await;
        let mut b = start_node(&net, "b", 2000, dir.path()).await;

        let peer = b.connect(&Endpoint::parse("mem:1000").unwrap()).await.unwrap();
        assert_eq!(peer, PeerId::from("a"));

        a.publish("hello b").await.unwrap();
        let got = b.poll(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text(), "hello b");
        assert_eq!(got[0].origin(), "a");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let mut a = start_node(&net, "a", 1000, dir.path()).await;
        assert!(a.poll(Duration::from_millis(50)).await.unwrap().is_empty());
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_role_stops_reactor() {
        let dir = tempfile::tempdir().unwrap();
        let (event_tx, event_rx) = mpsc::channel(4);
        let (_request_tx, request_rx) = mpsc::channel(4);
        let net = MemoryNetwork::new();
        let (transport, _unused) = net.bind(PeerId::from("a"), &Endpoint::parse("mem:1").unwrap());

        let mut node = RelayNode::start(
            PeerId::from("a"),
            test_config(dir.path()),
            Arc::new(transport),
            TransportChannels {
                events: event_rx,
                requests: request_rx,
            },
            Arc::new(net.clone()),
            Arc::new(FileKeyring::new(dir.path())),
        )
        .await
        .unwrap();

        event_tx
            .send(TransportEvent {
                role: ChannelRole::Publish,
                from: PeerId::from("x"),
                frames: vec![b"<x:1.0>".to_vec(), b"hi".to_vec()],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Polling a dead reactor fails at once instead of reporting silence.
        let started = tokio::time::Instant::now();
        let polled = node.poll(Duration::from_secs(5)).await;
        assert!(matches!(polled, Err(RelayError::NotRunning)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(node.publish("late").await, Err(RelayError::NotRunning)));

        let err = node.shutdown().await.unwrap_err();
        assert!(matches!(err, RelayError::UnhandledChannel(ChannelRole::Publish)));
    }

    #[tokio::test]
    async fn test_connect_to_missing_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let a = start_node(&net, "a", 1000, dir.path()).await;
        let err = a.connect(&Endpoint::parse("mem:9999").unwrap()).await.unwrap_err();
        assert!(matches!(err, RelayError::Bootstrap { .. }));
        a.shutdown().await.unwrap();
    }
}
