//! Memoized "is this host on the target network?" classification.
//!
//! Entries are created on first use and never expire. Each hostname gets its
//! own `OnceCell`: the first caller performs the lookup, concurrent callers
//! for the same hostname wait on it, and unrelated hostnames proceed in
//! parallel. The map lock is only held to fetch or insert a cell.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use edgetun_core::cidr::parse_ip_literal;
use edgetun_core::AddressClassifier;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::resolver::Resolve;

/// Outcome of classifying one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The host belongs to the target network.
    pub is_member: bool,
    /// Address to connect to directly: the resolved IPv4 for hostnames, the
    /// host itself for literals, allow-listed names, and failed lookups.
    pub effective_ip: String,
}

impl Classification {
    fn new(is_member: bool, effective_ip: impl Into<String>) -> Self {
        Self {
            is_member,
            effective_ip: effective_ip.into(),
        }
    }
}

/// Process-wide reachability cache shared by all dial attempts.
pub struct ReachabilityCache {
    classifier: Arc<AddressClassifier>,
    resolver: Arc<dyn Resolve>,
    member_hosts: HashSet<String>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Classification>>>>,
}

impl ReachabilityCache {
    pub fn new(
        classifier: Arc<AddressClassifier>,
        resolver: Arc<dyn Resolve>,
        member_hosts: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            classifier,
            resolver,
            member_hosts: member_hosts.into_iter().collect(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Classify `host`, performing at most one lookup per hostname for the
    /// lifetime of the cache.
    ///
    /// Lookup failures fail open: the host is recorded as a non-member and
    /// is never looked up again.
    pub async fn classify(&self, host: &str) -> Classification {
        if self.member_hosts.contains(host) {
            debug!(host = %host, "host is allow-listed");
            return Classification::new(true, host);
        }

        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.entry(host.to_string()).or_default().clone()
        };

        if let Some(hit) = cell.get() {
            debug!(host = %host, member = hit.is_member, "classification cache hit");
            return hit.clone();
        }

        cell.get_or_init(|| self.lookup(host)).await.clone()
    }

    async fn lookup(&self, host: &str) -> Classification {
        if let Some(ip) = parse_ip_literal(host) {
            let is_member = self.classifier.is_member(ip);
            debug!(host = %host, member = is_member, "classified literal address");
            return Classification::new(is_member, ip.to_string());
        }

        match self.resolver.resolve_a(host).await {
            Ok(ip) => {
                let is_member = self.classifier.is_member(ip.into());
                debug!(host = %host, ip = %ip, member = is_member, "classified resolved host");
                Classification::new(is_member, ip.to_string())
            }
            Err(e) => {
                warn!(host = %host, error = %e, "DNS lookup failed, treating as non-member");
                Classification::new(false, host)
            }
        }
    }

    /// Number of hostnames with a cache slot (completed or in flight).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
