//! Identity bootstrap: the cleartext "who are you?" handshake.
//!
//! Before a node can subscribe to a peer it must learn the peer's declared
//! identity and public key. It asks over the peer's cleartext reply port and
//! expects exactly `[identity, public_key]` back. Learned keys are persisted,
//! and a key already learned from the same address is reused without asking.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{RelayError, TransportError};
use crate::identity::PeerId;
use crate::keyring::{KeyStore, PeerKey};
use crate::message::Frames;
use crate::shutdown::Shutdown;
use crate::transport::{CleartextRequest, CleartextRequester};

/// The only request the reply service understands.
pub const WHO_ARE_YOU: &str = "who are you?";

/// Default bound on a who-are-you round trip.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Learn the identity and key of the node at `endpoint`, preferring the
/// keyring over the network.
pub async fn learn_or_load_peer_key<R, K>(
    requester: &R,
    keystore: &K,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<PeerKey, RelayError>
where
    R: CleartextRequester + ?Sized,
    K: KeyStore + ?Sized,
{
    let address = endpoint.address_key();
    if let Some(key) = keystore.find_peer_key_by_address(&address)? {
        debug!("Using cached key for {} at {address}", key.identity);
        return Ok(key);
    }

    let fail = |reason: String| RelayError::Bootstrap {
        endpoint: endpoint.to_string(),
        reason,
    };

    let request = vec![WHO_ARE_YOU.as_bytes().to_vec()];
    let reply = tokio::time::timeout(timeout, requester.request(endpoint, request))
        .await
        .unwrap_or(Err(TransportError::Timeout(timeout)))
        .map_err(|e| fail(e.to_string()))?;

    let key = parse_reply(reply, &address).map_err(fail)?;
    keystore.persist_peer_key(&key)?;
    info!("Learned identity {} at {address}", key.identity);
    Ok(key)
}

fn parse_reply(mut reply: Frames, address: &str) -> Result<PeerKey, String> {
    if reply.len() != 2 {
        return Err(format!("expected 2 reply frames, got {}", reply.len()));
    }
    let public_key = reply.pop().unwrap_or_default();
    let identity = reply.pop().unwrap_or_default();
    let identity = String::from_utf8(identity).map_err(|_| "identity is not UTF-8".to_string())?;
    if identity.is_empty() {
        return Err("empty identity".to_string());
    }
    if public_key.is_empty() {
        return Err(format!("empty public key for {identity}"));
    }
    Ok(PeerKey::new(PeerId(identity), public_key, address))
}

/// Answer every cleartext request with `[identity, public_key]` until
/// shutdown. A request already received is always answered before the
/// service observes shutdown.
pub async fn run_reply_service(
    identity: PeerId,
    public_key: Vec<u8>,
    mut requests: mpsc::Receiver<CleartextRequest>,
    shutdown: Shutdown,
) {
    debug!(node = %identity, "Reply service started");
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.frames.first().map(Vec::as_slice) != Some(WHO_ARE_YOU.as_bytes()) {
            debug!(node = %identity, "Answering unexpected cleartext request anyway");
        }
        let reply = vec![identity.as_str().as_bytes().to_vec(), public_key.clone()];
        if request.reply.send(reply).is_err() {
            debug!(node = %identity, "Requester went away before the reply");
        }
    }
    debug!(node = %identity, "Reply service stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
