//! Mesh Relay: peer-to-peer message relay with route discovery.
//!
//! Every node floods broadcast messages to its neighbours, suppressing
//! duplicates by tag, and routes addressed messages hop by hop along paths
//! learned from gossip. Routed messages with no usable path wait in a
//! bounded retry queue while the node asks the network where their
//! destination is.
//!
//! # Architecture
//!
//! - **Message model**: multipart frames with a `<origin:seconds>` tag.
//! - **Relay**: a pure state machine turning inputs into actions.
//! - **Node**: a tokio reactor executing those actions over a transport.
//! - **Transport**: WebSocket (via `tokio-tungstenite`) or in-memory.
//! - **Bootstrap**: a cleartext "who are you?" handshake, with learned keys
//!   kept in a file keyring.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mesh_relay::{Endpoint, RelayConfig, RelayNode};
//!
//! # async fn example() -> Result<(), mesh_relay::RelayError> {
//! let config = RelayConfig::default();
//! let mut node = RelayNode::start_ws(config).await?;
//!
//! node.connect(&Endpoint::parse("peer-host")?).await?;
//! node.publish("hello").await?;
//! for msg in node.poll(Duration::from_millis(500)).await? {
//!     println!("{}: {msg}", msg.origin());
//! }
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod keyring;
pub mod message;
pub mod node;
pub mod recent;
pub mod relay;
pub mod retry;
pub mod routes;
pub mod shutdown;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::RelayConfig;
pub use endpoint::{ChannelRole, Endpoint};
pub use error::{KeyringError, RelayError, TransportError};
pub use identity::PeerId;
pub use keyring::{FileKeyring, KeyStore, PeerKey};
pub use message::{Message, RoutedMessage, Tag};
pub use node::RelayNode;
pub use relay::{Action, Input, Relay, RelaySettings};
pub use shutdown::Shutdown;
