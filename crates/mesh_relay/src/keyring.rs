//! Key persistence: the node's own keypair and the public keys of peers it
//! has bootstrapped with.
//!
//! [`FileKeyring`] keeps one JSON file per identity in a directory:
//!
//! - `<identity>.secret.json`: this node's keypair
//! - `<identity>.key.json`: a peer's public key and the address it was
//!   learned from
//!
//! The file stem is the identity scrubbed by [`PeerId::file_stem`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::error::KeyringError;
use crate::identity::PeerId;

const SECRET_SUFFIX: &str = ".secret.json";
const PEER_SUFFIX: &str = ".key.json";

/// This node's long-term keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub secret_key: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh Ed25519 keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        Self {
            public_key: signing.verifying_key().to_bytes().to_vec(),
            secret_key: signing.to_bytes().to_vec(),
        }
    }

    /// Check that the secret is a 32-byte Ed25519 seed matching the stored
    /// public key.
    pub fn verify(&self) -> Result<(), KeyringError> {
        let seed: [u8; 32] = self.secret_key.as_slice().try_into().map_err(|_| {
            KeyringError::InvalidKey(format!("secret key is {} bytes, expected 32", self.secret_key.len()))
        })?;
        let derived = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        if derived.as_slice() != self.public_key.as_slice() {
            return Err(KeyringError::InvalidKey("public key does not match secret".to_string()));
        }
        Ok(())
    }
}

/// A public key learned from a peer during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKey {
    pub identity: PeerId,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// `host:pub_port` of the endpoint the key was learned from.
    pub address: String,
    pub learned_at: DateTime<Utc>,
}

impl PeerKey {
    pub fn new(identity: PeerId, public_key: Vec<u8>, address: impl Into<String>) -> Self {
        Self {
            identity,
            public_key,
            address: address.into(),
            learned_at: Utc::now(),
        }
    }
}

/// Storage for key material, keyed by identity.
pub trait KeyStore: Send + Sync {
    /// This node's keypair, generated and persisted on first use.
    fn load_or_create_keypair(&self, identity: &PeerId) -> Result<Keypair, KeyringError>;

    /// A previously persisted peer key, if any.
    fn load_peer_key(&self, identity: &PeerId) -> Result<Option<PeerKey>, KeyringError>;

    /// A previously persisted peer key learned from `address`, if any.
    fn find_peer_key_by_address(&self, address: &str) -> Result<Option<PeerKey>, KeyringError>;

    fn persist_peer_key(&self, key: &PeerKey) -> Result<(), KeyringError>;
}

// ---------------------------------------------------------------------------
// FileKeyring
// ---------------------------------------------------------------------------

/// A [`KeyStore`] backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct FileKeyring {
    dir: PathBuf,
}

impl FileKeyring {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/mesh-relay/keyring`.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mesh-relay")
            .join("keyring")
    }

    fn secret_path(&self, identity: &PeerId) -> PathBuf {
        self.dir.join(format!("{}{SECRET_SUFFIX}", identity.file_stem()))
    }

    fn peer_path(&self, identity: &PeerId) -> PathBuf {
        self.dir.join(format!("{}{PEER_SUFFIX}", identity.file_stem()))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), KeyringError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, KeyringError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

impl KeyStore for FileKeyring {
    fn load_or_create_keypair(&self, identity: &PeerId) -> Result<Keypair, KeyringError> {
        let path = self.secret_path(identity);
        match Self::read_json::<Keypair>(&path).and_then(|found| {
            found.map(|keypair| keypair.verify().map(|()| keypair)).transpose()
        }) {
            Ok(Some(keypair)) => return Ok(keypair),
            Ok(None) => {}
            Err(e @ (KeyringError::Serialization(_) | KeyringError::InvalidKey(_))) => {
                tracing::warn!("Corrupt keypair file {}, generating new: {e}", path.display());
            }
            Err(e) => return Err(e),
        }

        let keypair = Keypair::generate();
        self.write_json(&path, &keypair)?;
        tracing::info!("Generated keypair for {identity} in {}", path.display());
        Ok(keypair)
    }

    fn load_peer_key(&self, identity: &PeerId) -> Result<Option<PeerKey>, KeyringError> {
        Self::read_json(&self.peer_path(identity))
    }

    fn find_peer_key_by_address(&self, address: &str) -> Result<Option<PeerKey>, KeyringError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let is_peer_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(PEER_SUFFIX));
            if !is_peer_file {
                continue;
            }
            match Self::read_json::<PeerKey>(&path) {
                Ok(Some(key)) if key.address == address => return Ok(Some(key)),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable key file {}: {e}", path.display()),
            }
        }
        Ok(None)
    }

    fn persist_peer_key(&self, key: &PeerKey) -> Result<(), KeyringError> {
        if key.public_key.is_empty() {
            return Err(KeyringError::InvalidKey(format!("empty public key for {}", key.identity)));
        }
        self.write_json(&self.peer_path(&key.identity), key)
    }
}

/// Serde adapter storing byte strings as lowercase hex.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        let id = PeerId::from("tarch(A):5555");

        let first = keyring.load_or_create_keypair(&id).unwrap();
        assert_eq!(first.public_key.len(), 32);
        assert!(dir.path().join("tarch_A_5555.secret.json").exists());

        let second = keyring.load_or_create_keypair(&id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_keypair_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        let id = PeerId::from("node");
        std::fs::write(dir.path().join("node.secret.json"), "not json").unwrap();

        let keypair = keyring.load_or_create_keypair(&id).unwrap();
        assert_eq!(keyring.load_or_create_keypair(&id).unwrap(), keypair);
    }

    #[test]
    fn test_mismatched_keypair_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        let id = PeerId::from("node");
        let mut tampered = Keypair::generate();
        tampered.public_key = Keypair::generate().public_key;
        assert!(matches!(tampered.verify(), Err(KeyringError::InvalidKey(_))));
        keyring.write_json(&keyring.secret_path(&id), &tampered).unwrap();

        let keypair = keyring.load_or_create_keypair(&id).unwrap();
        assert_ne!(keypair, tampered);
        assert!(keypair.verify().is_ok());
    }

    #[test]
    fn test_empty_peer_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        let key = PeerKey::new(PeerId::from("b"), Vec::new(), "host-b:5555");
        assert!(matches!(keyring.persist_peer_key(&key), Err(KeyringError::InvalidKey(_))));
        assert!(keyring.load_peer_key(&PeerId::from("b")).unwrap().is_none());
    }

    #[test]
    fn test_peer_key_persists_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        let key = PeerKey::new(PeerId::from("peer-id"), b"pubkey-bytes".to_vec(), "10.0.0.2:5555");

        keyring.persist_peer_key(&key).unwrap();
        let loaded = keyring.load_peer_key(&PeerId::from("peer-id")).unwrap().unwrap();
        assert_eq!(loaded.public_key, b"pubkey-bytes");
        assert_eq!(loaded, key);
    }

    #[test]
    fn test_find_by_address() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path());
        keyring
            .persist_peer_key(&PeerKey::new(PeerId::from("b"), vec![1, 2], "host-b:5555"))
            .unwrap();
        keyring
            .persist_peer_key(&PeerKey::new(PeerId::from("c"), vec![3, 4], "host-c:5555"))
            .unwrap();
        keyring.load_or_create_keypair(&PeerId::from("a")).unwrap();

        let found = keyring.find_peer_key_by_address("host-c:5555").unwrap().unwrap();
        assert_eq!(found.identity, PeerId::from("c"));
        assert!(keyring.find_peer_key_by_address("host-z:5555").unwrap().is_none());
    }

    #[test]
    fn test_missing_dir_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = FileKeyring::new(dir.path().join("absent"));
        assert!(keyring.find_peer_key_by_address("x:1").unwrap().is_none());
        assert!(keyring.load_peer_key(&PeerId::from("x")).unwrap().is_none());
    }
}
