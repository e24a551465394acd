//! A-record lookups over DNS-over-HTTPS (JSON API).
//!
//! One HTTPS GET per lookup, `?name=<host>&type=A` with
//! `Accept: application/dns-json`. No retries; a failed lookup is the
//! caller's to handle.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use edgetun_core::{EdgeError, EdgeResult};
use serde::Deserialize;
use tracing::debug;

/// DNS record type number for `A`.
const RECORD_TYPE_A: u16 = 1;

/// Resolves a hostname to a single IPv4 address.
///
/// Object-safe so [`crate::ReachabilityCache`] can hold any implementation
/// behind an `Arc<dyn Resolve>`.
pub trait Resolve: Send + Sync {
    fn resolve_a<'a>(
        &'a self,
        hostname: &'a str,
    ) -> Pin<Box<dyn Future<Output = EdgeResult<Ipv4Addr>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i64,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DoH resolver backed by a reusable `reqwest` client.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    url: String,
}

impl DohResolver {
    pub fn new(url: impl Into<String>, timeout: Duration) -> EdgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EdgeError::Lookup(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn lookup(&self, hostname: &str) -> EdgeResult<Ipv4Addr> {
        debug!(hostname = %hostname, url = %self.url, "DoH lookup");
        let response = self
            .client
            .get(&self.url)
            .query(&[("name", hostname), ("type", "A")])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| EdgeError::Lookup(format!("DoH request for {hostname} failed: {e}")))?
            .error_for_status()
            .map_err(|e| EdgeError::Lookup(format!("DoH request for {hostname} failed: {e}")))?;

        let answer: DohResponse = response
            .json()
            .await
            .map_err(|e| EdgeError::Lookup(format!("malformed DoH response for {hostname}: {e}")))?;

        first_a_record(hostname, &answer)
    }
}

impl Resolve for DohResolver {
    fn resolve_a<'a>(
        &'a self,
        hostname: &'a str,
    ) -> Pin<Box<dyn Future<Output = EdgeResult<Ipv4Addr>> + Send + 'a>> {
        Box::pin(self.lookup(hostname))
    }
}

/// Pick the first valid A answer out of a decoded DoH response.
fn first_a_record(hostname: &str, response: &DohResponse) -> EdgeResult<Ipv4Addr> {
    if response.status != 0 {
        return Err(EdgeError::Lookup(format!(
            "DoH status {} for {hostname}",
            response.status
        )));
    }

    response
        .answer
        .iter()
        .filter(|a| a.record_type == RECORD_TYPE_A)
        .find_map(|a| a.data.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| EdgeError::Lookup(format!("no valid IPv4 address found for {hostname}")))
}
