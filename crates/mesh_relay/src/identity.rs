//! Peer identity: the declared name every node routes by.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

static FILENAME_UNSAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("valid filename regex"));

/// The declared identity of a relay node.
///
/// Identities are opaque strings; route paths, tags and certificate files
/// are all keyed by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Default identity for a node bound at `endpoint`: `<hostname>-<pub port>`.
    pub fn default_for(endpoint: &Endpoint) -> Self {
        let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{host}-{}", endpoint.pub_port()))
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity rewritten so it is safe to use as a file basename.
    pub fn file_stem(&self) -> String {
        scrub_for_filename(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Collapse every run of characters outside `[A-Za-z0-9_-]` into `_`.
pub fn scrub_for_filename(name: &str) -> String {
    FILENAME_UNSAFE.replace_all(name, "_").into_owned()
}
