//! Dialer settings, loaded once and shared read-only for the process lifetime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default DNS-over-HTTPS endpoint (JSON API).
pub const DEFAULT_DOH_URL: &str = "https://cloudflare-dns.com/dns-query";

/// A `host:port` pair used for the relay and egress overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Configuration for [`crate::TunnelDialer`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Relay domain. Used for TLS SNI, the `Host` header, and as the TCP
    /// target (port 443) when no `relay_endpoint` is set.
    pub domain: String,
    /// Shared secret sent in the control message.
    pub secret: String,
    /// Connect to this address instead of `domain:443`. When set, every
    /// destination goes through the relay.
    pub relay_endpoint: Option<Endpoint>,
    /// Destination substituted into the control message for relayed
    /// target-network hosts.
    pub egress: Option<Endpoint>,
    /// Hostnames always treated as target-network members.
    pub member_hosts: Vec<String>,
    /// Validate the relay's certificate against the webpki roots.
    /// Off by default: the relay is commonly reached by bare IP behind the CDN.
    pub verify_tls: bool,
    /// DNS-over-HTTPS endpoint.
    pub doh_url: String,
    /// Per-request timeout for DNS-over-HTTPS lookups.
    pub dns_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            domain: String::new(),
            secret: String::new(),
            relay_endpoint: None,
            egress: None,
            member_hosts: Vec::new(),
            verify_tls: false,
            doh_url: DEFAULT_DOH_URL.to_string(),
            dns_timeout: Duration::from_secs(10),
        }
    }
}

impl RelaySettings {
    pub fn new(domain: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// TCP address of the relay: the override if configured, else `domain:443`.
    pub fn relay_target(&self) -> Endpoint {
        self.relay_endpoint
            .clone()
            .unwrap_or_else(|| Endpoint::new(self.domain.clone(), 443))
    }
}
