//! Proxy configuration: TOML file + CLI overrides.
//!
//! The file is required; a missing or malformed file stops the process.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use edgetun_client::settings::DEFAULT_DOH_URL;
use edgetun_client::{Endpoint, RelaySettings};
use serde::Deserialize;
use tracing::{info, warn};

/// On-disk config structure. Keys of the older JSON format are accepted as
/// aliases (`psw`, `sbind`, `sport`, `cfhs`) or, for the flat override pairs
/// (`wkip`/`wkport`, `proxyip`/`proxyport`), folded into the tables.
/// Unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub domain: String,
    #[serde(default, alias = "psw")]
    pub secret: String,
    #[serde(default = "default_bind", alias = "sbind")]
    pub bind: String,
    #[serde(default = "default_port", alias = "sport")]
    pub port: u16,
    #[serde(default)]
    pub relay_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub egress: Option<Endpoint>,
    #[serde(default, alias = "cfhs")]
    pub member_hosts: Vec<String>,
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub wkip: Option<String>,
    #[serde(default)]
    pub wkport: Option<u16>,
    #[serde(default)]
    pub proxyip: Option<String>,
    #[serde(default)]
    pub proxyport: Option<u16>,
}

/// Merge a flat legacy `host`/`port` pair into an override table.
fn legacy_endpoint(
    table: Option<Endpoint>,
    host: Option<String>,
    port: Option<u16>,
    keys: (&str, &str),
) -> Result<Option<Endpoint>> {
    match (table, host, port) {
        (table, None, None) => Ok(table),
        (Some(_), _, _) => bail!("`{}`/`{}` conflict with the table form", keys.0, keys.1),
        (None, Some(host), port) => Ok(Some(Endpoint::new(host, port.unwrap_or(443)))),
        (None, None, Some(_)) => bail!("`{}` requires `{}`", keys.1, keys.0),
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1080
}
fn default_doh_url() -> String {
    DEFAULT_DOH_URL.to_string()
}
fn default_dns_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    30
}

/// Resolved proxy configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on one whole dial (classification + connect/upgrade).
    pub connect_timeout: Duration,
    pub relay: RelaySettings,
}

impl ProxyConfig {
    /// Load the TOML file at `path`, then apply CLI overrides.
    pub fn load(path: &Path, cli_bind: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Self::from_file(file, cli_bind, cli_port)
    }

    pub fn from_file(file: ConfigFile, cli_bind: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        if file.domain.trim().is_empty() {
            bail!("`domain` must name the relay");
        }
        if file.secret.is_empty() {
            warn!("`secret` is empty; the relay will likely reject sessions");
        }

        let bind = cli_bind.unwrap_or(&file.bind);
        let ip: IpAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
        let port = cli_port.unwrap_or(file.port);

        let relay_endpoint =
            legacy_endpoint(file.relay_endpoint, file.wkip, file.wkport, ("wkip", "wkport"))?;
        let egress = legacy_endpoint(file.egress, file.proxyip, file.proxyport, ("proxyip", "proxyport"))?;

        Ok(Self {
            listen_addr: SocketAddr::new(ip, port),
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            relay: RelaySettings {
                domain: file.domain,
                secret: file.secret,
                relay_endpoint,
                egress,
                member_hosts: file.member_hosts,
                verify_tls: file.verify_tls,
                doh_url: file.doh_url,
                dns_timeout: Duration::from_secs(file.dns_timeout_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config("domain = \"relay.example.com\"\nsecret = \"pw\"\n");
        let config = ProxyConfig::load(file.path(), None, None).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.relay.domain, "relay.example.com");
        assert_eq!(config.relay.secret, "pw");
        assert!(config.relay.relay_endpoint.is_none());
        assert!(config.relay.egress.is_none());
        assert!(!config.relay.verify_tls);
        assert_eq!(config.relay.doh_url, DEFAULT_DOH_URL);
    }

    #[test]
    fn full_config() {
        let file = write_config(
            r#"
domain = "relay.example.com"
secret = "pw"
bind = "0.0.0.0"
port = 1081
member_hosts = ["a.example", "b.example"]
verify_tls = true
doh_url = "https://dns.example/dns-query"
dns_timeout_secs = 3
connect_timeout_secs = 12

[relay_endpoint]
host = "203.0.113.7"
port = 8443

[egress]
host = "198.51.100.2"
port = 443
"#,
        );
        let config = ProxyConfig::load(file.path(), None, None).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:1081".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(12));
        assert_eq!(config.relay.relay_endpoint, Some(Endpoint::new("203.0.113.7", 8443)));
        assert_eq!(config.relay.egress, Some(Endpoint::new("198.51.100.2", 443)));
        assert_eq!(config.relay.member_hosts, vec!["a.example", "b.example"]);
        assert!(config.relay.verify_tls);
        assert_eq!(config.relay.dns_timeout, Duration::from_secs(3));
    }

    #[test]
    fn legacy_key_aliases() {
        let file = write_config(
            "domain = \"relay.example.com\"\npsw = \"pw\"\nsbind = \"::1\"\nsport = 2080\ncfhs = [\"x.example\"]\n",
        );
        let config = ProxyConfig::load(file.path(), None, None).unwrap();
        assert_eq!(config.relay.secret, "pw");
        assert_eq!(config.listen_addr, "[::1]:2080".parse().unwrap());
        assert_eq!(config.relay.member_hosts, vec!["x.example"]);
    }

    #[test]
    fn legacy_flat_overrides() {
        let file = write_config(
            "domain = \"relay.example.com\"\nwkip = \"203.0.113.7\"\nwkport = 8443\nproxyip = \"198.51.100.2\"\n",
        );
        let config = ProxyConfig::load(file.path(), None, None).unwrap();
        assert_eq!(config.relay.relay_endpoint, Some(Endpoint::new("203.0.113.7", 8443)));
        assert_eq!(config.relay.egress, Some(Endpoint::new("198.51.100.2", 443)));
    }

    #[test]
    fn legacy_flat_overrides_must_be_consistent() {
        let port_only = write_config("domain = \"d\"\nproxyport = 443\n");
        assert!(ProxyConfig::load(port_only.path(), None, None).is_err());

        let both = write_config(
            "domain = \"d\"\nwkip = \"203.0.113.7\"\n\n[relay_endpoint]\nhost = \"203.0.113.8\"\nport = 443\n",
        );
        assert!(ProxyConfig::load(both.path(), None, None).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("domain = \"d\"\nrelay_endpont = { host = \"h\", port = 1 }\n");
        assert!(ProxyConfig::load(file.path(), None, None).is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let file = write_config("domain = \"relay.example.com\"\nport = 1080\n");
        let config = ProxyConfig::load(file.path(), Some("127.0.0.2"), Some(9999)).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.2:9999".parse().unwrap());
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProxyConfig::load(&dir.path().join("absent.toml"), None, None).is_err());
    }

    #[test]
    fn malformed_config_is_fatal() {
        assert!(ProxyConfig::load(write_config("domain = ").path(), None, None).is_err());
        // domain is required
        assert!(ProxyConfig::load(write_config("secret = \"pw\"\n").path(), None, None).is_err());
        assert!(ProxyConfig::load(write_config("domain = \"\"\n").path(), None, None).is_err());
        assert!(
            ProxyConfig::load(write_config("domain = \"d\"\nbind = \"localhost\"\n").path(), None, None)
                .is_err()
        );
    }
}
