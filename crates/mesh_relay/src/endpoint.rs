//! Endpoint descriptions and the logical channel roles that use them.
//!
//! A node listens on up to four ports. An address string names the host and
//! some prefix of those ports; the rest are filled in by counting up from the
//! last one given:
//!
//! - `host`: all default ports
//! - `host:80`: `80, 81, 82, 83`
//! - `udp://host:80,85`: `80, 85, 86, 87` over `udp`

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::RelayError;

pub const DEFAULT_PROTO: &str = "tcp";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PUBLISH_PORT: u16 = 5555;
pub const DEFAULT_COLLECTOR_PORT: u16 = 5556;
pub const DEFAULT_DIRECTED_PORT: u16 = 5557;
pub const DEFAULT_CLEARTEXT_PORT: u16 = 5558;

/// Number of ports an endpoint occupies.
pub const PORT_COUNT: usize = 4;

static ENDPOINT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<proto>.+)://)?(?P<host>[^:/]+|\[?[a-fA-F0-9:]+\]?)(?:$|:(?P<ports>.+?)$)")
        .expect("valid endpoint regex")
});

static NON_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D+").expect("valid separator regex"));

/// The logical role of a channel. Each role is served by one endpoint port;
/// roles come in pairs (binding side, connecting side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Broadcast sender (bound).
    Publish,
    /// Broadcast receiver, one per connected peer.
    Subscribe,
    /// Point-to-point sender towards a peer's collector.
    Push,
    /// Collector receiving point-to-point traffic (bound).
    Pull,
    /// Directed listener receiving identity-addressed traffic (bound).
    Router,
    /// Directed sender towards a peer's router.
    Dealer,
    /// Cleartext who-are-you reply service (bound).
    Reply,
    /// One-shot cleartext who-are-you request.
    Request,
}

impl ChannelRole {
    /// Short lowercase name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Publish => "pub",
            Self::Subscribe => "sub",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Router => "router",
            Self::Dealer => "dealer",
            Self::Reply => "rep",
            Self::Request => "req",
        }
    }
}

/// A parsed address: host, protocol, and the four logical ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    proto: String,
    ports: [u16; PORT_COUNT],
}

impl Endpoint {
    /// Parse `[proto://]host[:port[,port...]]`.
    pub fn parse(description: &str) -> Result<Self, RelayError> {
        let caps = ENDPOINT_PATTERN
            .captures(description.trim())
            .ok_or_else(|| RelayError::Endpoint(description.to_string()))?;

        let host = caps
            .name("host")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let proto = caps
            .name("proto")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_PROTO.to_string());

        let mut explicit = Vec::new();
        if let Some(ports) = caps.name("ports") {
            for piece in NON_DIGITS.split(ports.as_str()).filter(|p| !p.is_empty()) {
                let port = piece
                    .parse::<u16>()
                    .map_err(|_| RelayError::Endpoint(description.to_string()))?;
                explicit.push(port);
            }
        }

        let mut ports = [
            DEFAULT_PUBLISH_PORT,
            DEFAULT_COLLECTOR_PORT,
            DEFAULT_DIRECTED_PORT,
            DEFAULT_CLEARTEXT_PORT,
        ];
        if let Some(&last) = explicit.last() {
            for (i, slot) in ports.iter_mut().enumerate() {
                *slot = match explicit.get(i) {
                    Some(&p) => p,
                    None => {
                        let step = (i + 1 - explicit.len()) as u16;
                        last.checked_add(step)
                            .ok_or_else(|| RelayError::Endpoint(description.to_string()))?
                    }
                };
            }
        }

        Ok(Self { host, proto, ports })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    pub fn pub_port(&self) -> u16 {
        self.ports[0]
    }

    pub fn pull_port(&self) -> u16 {
        self.ports[1]
    }

    pub fn router_port(&self) -> u16 {
        self.ports[2]
    }

    pub fn rep_port(&self) -> u16 {
        self.ports[3]
    }

    /// The port serving `role`.
    pub fn port(&self, role: ChannelRole) -> u16 {
        match role {
            ChannelRole::Publish | ChannelRole::Subscribe => self.pub_port(),
            ChannelRole::Push | ChannelRole::Pull => self.pull_port(),
            ChannelRole::Router | ChannelRole::Dealer => self.router_port(),
            ChannelRole::Reply | ChannelRole::Request => self.rep_port(),
        }
    }

    /// `proto://host:port` for the port serving `role`.
    pub fn format(&self, role: ChannelRole) -> String {
        format!("{}://{}:{}", self.proto, self.host, self.port(role))
    }

    /// `host:port` suitable for binding a listener; `*` binds all interfaces.
    pub fn bind_addr(&self, role: ChannelRole) -> String {
        let host = if self.host == "*" { "0.0.0.0" } else { self.host.as_str() };
        format!("{host}:{}", self.port(role))
    }

    /// `host:port` suitable for dialing; `*` dials the loopback interface.
    pub fn dial_addr(&self, role: ChannelRole) -> String {
        let host = if self.host == "*" { "127.0.0.1" } else { self.host.as_str() };
        format!("{host}:{}", self.port(role))
    }

    /// Stable key naming this endpoint, used to remember which address a peer
    /// key was learned from.
    pub fn address_key(&self) -> String {
        format!("{}:{}", self.host, self.pub_port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:[pub={} pull={} router={} rep={}]",
            self.host, self.ports[0], self.ports[1], self.ports[2], self.ports[3]
        )
    }
}

impl std::str::FromStr for Endpoint {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_no_ports() {
        let host = Endpoint::parse("host").unwrap();
        assert_eq!(host.host(), "host");
        assert_eq!(host.proto(), "tcp");
        assert_eq!(host.pub_port(), DEFAULT_PUBLISH_PORT);
        assert_eq!(host.pull_port(), DEFAULT_COLLECTOR_PORT);
        assert_eq!(host.router_port(), DEFAULT_DIRECTED_PORT);
        assert_eq!(host.rep_port(), DEFAULT_CLEARTEXT_PORT);
    }

    #[test]
    fn test_host_one_port() {
        let host = Endpoint::parse("host:80").unwrap();
        assert_eq!(host.host(), "host");
        assert_eq!(host.pub_port(), 80);
        assert_eq!(host.pull_port(), 81);
        assert_eq!(host.router_port(), 82);
        assert_eq!(host.rep_port(), 83);
    }

    #[test]
    fn test_url_with_port_list() {
        let endpoint = Endpoint::parse("udp://blah:123,456").unwrap();
        assert_eq!(endpoint.proto(), "udp");
        assert_eq!(endpoint.host(), "blah");
        assert_eq!(endpoint.pub_port(), 123);
        assert_eq!(endpoint.pull_port(), 456);
        assert_eq!(endpoint.router_port(), 457);
        assert_eq!(endpoint.rep_port(), 458);
    }

    #[test]
    fn test_wildcard_host() {
        let endpoint = Endpoint::parse("*:7000").unwrap();
        assert_eq!(endpoint.bind_addr(ChannelRole::Publish), "0.0.0.0:7000");
        assert_eq!(endpoint.dial_addr(ChannelRole::Reply), "127.0.0.1:7003");
    }

    #[test]
    fn test_format_per_role() {
        let endpoint = Endpoint::parse("tcp://localhost:6000").unwrap();
        assert_eq!(endpoint.format(ChannelRole::Subscribe), "tcp://localhost:6000");
        assert_eq!(endpoint.format(ChannelRole::Push), "tcp://localhost:6001");
        assert_eq!(endpoint.format(ChannelRole::Dealer), "tcp://localhost:6002");
        assert_eq!(endpoint.format(ChannelRole::Request), "tcp://localhost:6003");
    }

    #[test]
    fn test_rejects_out_of_range_ports() {
        assert!(Endpoint::parse("host:70000").is_err());
        assert!(Endpoint::parse("host:65535").is_err());
        assert!(Endpoint::parse("").is_err());
    }
}
