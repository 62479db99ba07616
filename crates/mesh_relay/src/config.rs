//! Relay node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::DEFAULT_BOOTSTRAP_TIMEOUT;
use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::identity::PeerId;
use crate::keyring::FileKeyring;
use crate::recent::DEFAULT_DUP_TIME;
use crate::relay::RelaySettings;
use crate::retry::{DEFAULT_MAX_FAILURES, DEFAULT_RETRY_CAPACITY};

/// Configuration for one relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Declared identity. Defaults to `<hostname>-<pub port>`.
    pub identity: Option<PeerId>,

    /// Endpoint description to bind, e.g. `*` or `*:6000`.
    pub local_address: String,

    /// Endpoint descriptions of peers to bootstrap with on startup.
    pub remote_addresses: Vec<String>,

    /// Directory holding this node's keypair and learned peer keys.
    pub keyring_dir: PathBuf,

    /// Duplicate-suppression window in seconds.
    pub dup_time: f64,

    /// Maximum number of routed messages awaiting a route.
    pub retry_capacity: usize,

    /// Failed sends after which a routed message is dropped.
    pub max_failures: u32,

    /// Reactor wake-up interval for housekeeping.
    #[serde(with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Bound on one who-are-you round trip.
    #[serde(with = "duration_ms_serde")]
    pub bootstrap_timeout: Duration,

    /// Bound on waiting for the reply service at shutdown.
    #[serde(with = "duration_ms_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            identity: None,
            local_address: "*".to_string(),
            remote_addresses: Vec::new(),
            keyring_dir: FileKeyring::default_dir(),
            dup_time: DEFAULT_DUP_TIME,
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            max_failures: DEFAULT_MAX_FAILURES,
            poll_interval: Duration::from_millis(500),
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl RelayConfig {
    /// Parsed local endpoint.
    pub fn local_endpoint(&self) -> Result<Endpoint, RelayError> {
        Endpoint::parse(&self.local_address)
    }

    /// Parsed remote endpoints, in configuration order.
    pub fn remote_endpoints(&self) -> Result<Vec<Endpoint>, RelayError> {
        self.remote_addresses.iter().map(|a| Endpoint::parse(a)).collect()
    }

    /// The configured identity, or the default one for `local`.
    pub fn resolved_identity(&self, local: &Endpoint) -> PeerId {
        self.identity
            .clone()
            .unwrap_or_else(|| PeerId::default_for(local))
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            dup_time: self.dup_time,
            retry_capacity: self.retry_capacity,
            max_failures: self.max_failures,
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), RelayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<RelayConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
