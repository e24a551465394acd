//! The outbound hook called once per SOCKS client.
//!
//! Non-members of the target network are dialed directly unless a relay
//! endpoint override forces everything through the relay. Everything else
//! gets a TLS WebSocket session to the relay followed by one JSON control
//! message naming the far-side destination.

use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use edgetun_core::transport::Deadlined;
use edgetun_core::{AddressClassifier, Connection, ControlMessage, EdgeError, EdgeResult};
use futures_util::SinkExt;
use rand::seq::SliceRandom;
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::cache::ReachabilityCache;
use crate::resolver::DohResolver;
use crate::settings::{Endpoint, RelaySettings};
use crate::stream::RelayStream;
use crate::tls;

/// Bounds of the randomized relay handshake timeout.
pub const HANDSHAKE_TIMEOUT: Range<Duration> = Duration::from_secs(5)..Duration::from_secs(15);

/// User-Agent pool for the upgrade request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.101 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/91.0.4472.80 Mobile/15E148 Safari/604.1",
];

type RelaySession = WebSocketStream<TlsStream<TcpStream>>;

/// Draw a handshake timeout uniformly from [`HANDSHAKE_TIMEOUT`].
pub fn handshake_timeout() -> Duration {
    rand::thread_rng().gen_range(HANDSHAKE_TIMEOUT)
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(addr: &str) -> EdgeResult<(String, u16)> {
    let invalid = || EdgeError::InvalidAddress(addr.to_string());

    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        }
        None => {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// The connection handed back to the SOCKS layer.
///
/// Enum dispatch over the two paths so callers get one concrete type.
pub enum DialedStream {
    Direct(Deadlined<TcpStream>),
    Relay(RelayStream<TlsStream<TcpStream>>),
}

impl DialedStream {
    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::Relay(_))
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_read(cx, buf),
            Self::Relay(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_write(cx, buf),
            Self::Relay(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_flush(cx),
            Self::Relay(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_shutdown(cx),
            Self::Relay(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for DialedStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Direct(s) => s.local_addr(),
            Self::Relay(s) => s.local_addr(),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Direct(s) => s.peer_addr(),
            Self::Relay(s) => s.peer_addr(),
        }
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        match self {
            Self::Direct(s) => s.set_read_deadline(deadline),
            Self::Relay(s) => s.set_read_deadline(deadline),
        }
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        match self {
            Self::Direct(s) => s.set_write_deadline(deadline),
            Self::Relay(s) => s.set_write_deadline(deadline),
        }
    }
}

/// Decides per destination between a direct connection and the relay.
pub struct TunnelDialer {
    settings: Arc<RelaySettings>,
    cache: Arc<ReachabilityCache>,
    tls: TlsConnector,
    server_name: ServerName<'static>,
}

impl TunnelDialer {
    /// Dialer over the published edge ranges, resolving through DoH.
    pub fn new(settings: RelaySettings) -> EdgeResult<Self> {
        let resolver = DohResolver::new(settings.doh_url.clone(), settings.dns_timeout)?;
        let cache = ReachabilityCache::new(
            Arc::new(AddressClassifier::cloudflare()),
            Arc::new(resolver),
            settings.member_hosts.clone(),
        );
        Self::with_cache(settings, Arc::new(cache))
    }

    /// Dialer over a prepared cache. `settings.member_hosts` is not consulted;
    /// the cache carries its own allow-list.
    pub fn with_cache(settings: RelaySettings, cache: Arc<ReachabilityCache>) -> EdgeResult<Self> {
        if settings.domain.is_empty() {
            return Err(EdgeError::Config("relay domain is empty".into()));
        }
        let tls = tls::connector(settings.verify_tls)?;
        let server_name = tls::server_name(&settings.domain)?;
        Ok(Self {
            settings: Arc::new(settings),
            cache,
            tls,
            server_name,
        })
    }

    pub fn cache(&self) -> &ReachabilityCache {
        &self.cache
    }

    /// Dial a `host:port` string. Malformed input fails before any network
    /// access.
    pub async fn dial_addr(&self, addr: &str) -> EdgeResult<DialedStream> {
        let (host, port) = split_host_port(addr)?;
        self.dial(&host, port).await
    }

    /// Open a connection to `host:port`, directly or through the relay.
    ///
    /// Exactly one attempt on exactly one path; nothing is retried. Dropping
    /// the future cancels the attempt.
    pub async fn dial(&self, host: &str, port: u16) -> EdgeResult<DialedStream> {
        if host.is_empty() {
            return Err(EdgeError::InvalidAddress(format!(":{port}")));
        }

        let classification = self.cache.classify(host).await;

        if !classification.is_member && self.settings.relay_endpoint.is_none() {
            info!(host = %host, ip = %classification.effective_ip, port, "connecting directly");
            let stream = TcpStream::connect((classification.effective_ip.as_str(), port)).await?;
            return Ok(DialedStream::Direct(Deadlined::new(stream)));
        }

        // The relay is told the classified address, not the name the
        // client asked for, unless egress substitution applies.
        let destination = match &self.settings.egress {
            Some(egress) if classification.is_member => egress.clone(),
            _ => Endpoint::new(classification.effective_ip.clone(), port),
        };
        info!(
            host = %host,
            port,
            member = classification.is_member,
            destination = %destination,
            "connecting via relay"
        );

        let stream = self.dial_relay(&destination).await?;
        Ok(DialedStream::Relay(stream))
    }

    async fn dial_relay(&self, destination: &Endpoint) -> EdgeResult<RelayStream<TlsStream<TcpStream>>> {
        let timeout = handshake_timeout();
        let (mut ws, local, peer) = tokio::time::timeout(timeout, self.upgrade())
            .await
            .map_err(|_| EdgeError::Timeout)??;

        let control = ControlMessage::new(
            destination.host.clone(),
            destination.port,
            self.settings.secret.clone(),
        );
        let json = control.to_json()?;
        if let Err(e) = ws.send(Message::Text(json.into())).await {
            warn!(error = %e, "relay control message failed, closing session");
            let _ = ws.close(None).await;
            return Err(EdgeError::Control(format!("cannot send control message: {e}")));
        }

        Ok(RelayStream::new(ws, local, peer))
    }

    /// TCP connect, TLS with SNI = relay domain, then the WebSocket upgrade.
    async fn upgrade(&self) -> EdgeResult<(RelaySession, Option<SocketAddr>, Option<SocketAddr>)> {
        let target = self.settings.relay_target();
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| EdgeError::Handshake(format!("cannot reach relay {target}: {e}")))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "cannot set TCP_NODELAY on relay socket");
        }
        let local = tcp.local_addr().ok();
        let peer = tcp.peer_addr().ok();

        let tls_stream = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| EdgeError::Tls(format!("TLS handshake with {target} failed: {e}")))?;

        let request = relay_request(&self.settings.domain)?;
        let (ws, _response) = client_async(request, tls_stream)
            .await
            .map_err(|e| EdgeError::Handshake(format!("websocket upgrade to {target} failed: {e}")))?;

        debug!(relay = %target, "relay session established");
        Ok((ws, local, peer))
    }
}

/// Upgrade request with `Host` pinned to the relay domain and a random
/// User-Agent.
fn relay_request(domain: &str) -> EdgeResult<Request> {
    let mut request = format!("wss://{domain}/")
        .into_client_request()
        .map_err(|e| EdgeError::Handshake(format!("invalid relay URL for {domain}: {e}")))?;

    let host = HeaderValue::from_str(domain)
        .map_err(|e| EdgeError::Handshake(format!("invalid Host header {domain}: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(header::HOST, host);
    headers.insert(header::USER_AGENT, HeaderValue::from_static(random_user_agent()));
    Ok(request)
}
