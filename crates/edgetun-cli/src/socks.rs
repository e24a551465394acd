//! SOCKS5 listener (RFC 1928, CONNECT only, NO AUTH).
//!
//! Each accepted client gets its own task: the handshake is read, the
//! destination handed to [`TunnelDialer::dial`] once, and bytes are then
//! piped both ways until either side closes.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use edgetun_client::TunnelDialer;
use edgetun_core::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 front-end over a [`TunnelDialer`].
pub struct Socks5Server {
    listener: TcpListener,
    dialer: Arc<TunnelDialer>,
    connect_timeout: Duration,
}

impl Socks5Server {
    pub async fn bind(
        listen_addr: SocketAddr,
        dialer: Arc<TunnelDialer>,
        connect_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self {
            listener,
            dialer,
            connect_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the task is dropped.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "SOCKS5 server started");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "SOCKS5 connection");
                    let dialer = self.dialer.clone();
                    let connect_timeout = self.connect_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, dialer, connect_timeout).await {
                            debug!(peer = %peer_addr, error = %e, "SOCKS5 connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "SOCKS5 accept error");
                }
            }
        }
    }
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT` with an all-zero IPv4 bind address.
fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

async fn handle_client(
    mut client: TcpStream,
    dialer: Arc<TunnelDialer>,
    connect_timeout: Duration,
) -> Result<()> {
    // Greeting: VER | NMETHODS | METHODS
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version: {}", header[0]);
    }
    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        bail!("client does not offer NO AUTH");
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        bail!("invalid SOCKS5 request version: {}", request[0]);
    }
    if request[1] != CMD_CONNECT {
        client.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
        bail!("unsupported SOCKS5 command: {}", request[1]);
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            client.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| anyhow!("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            client.write_all(&reply(REPLY_ADDRESS_NOT_SUPPORTED)).await?;
            bail!("unsupported address type: {other}");
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    debug!(host = %host, port, "SOCKS5 CONNECT");

    let dialed = match tokio::time::timeout(connect_timeout, dialer.dial(&host, port)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(host = %host, port, error = %e, "dial failed");
            client.write_all(&reply(REPLY_CONNECTION_REFUSED)).await?;
            return Err(e.into());
        }
        Err(_) => {
            warn!(host = %host, port, "dial timed out");
            client.write_all(&reply(REPLY_CONNECTION_REFUSED)).await?;
            bail!("dial to {host}:{port} timed out");
        }
    };
    client.write_all(&reply(REPLY_SUCCEEDED)).await?;

    let mut upstream = dialed;
    debug!(
        host = %host,
        port,
        relayed = upstream.is_relayed(),
        upstream = ?upstream.peer_addr().ok(),
        "piping"
    );
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(host = %host, port, up, down, "connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetun_client::RelaySettings;

    async fn spawn_proxy() -> SocketAddr {
        let dialer = Arc::new(TunnelDialer::new(RelaySettings::new("relay.test", "pw")).unwrap());
        let server = Socks5Server::bind("127.0.0.1:0".parse().unwrap(), dialer, Duration::from_secs(5))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn greet(proxy: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);
        client
    }

    fn connect_v4(target: SocketAddr, cmd: u8) -> Vec<u8> {
        let SocketAddr::V4(v4) = target else {
            panic!("expected an IPv4 target");
        };
        let mut req = vec![0x05, cmd, 0x00, ATYP_IPV4];
        req.extend_from_slice(&v4.ip().octets());
        req.extend_from_slice(&v4.port().to_be_bytes());
        req
    }

    #[tokio::test]
    async fn connect_direct_and_pipe() {
        let proxy = spawn_proxy().await;
        let echo = spawn_echo().await;

        let mut client = greet(proxy).await;
        client.write_all(&connect_v4(echo, CMD_CONNECT)).await.unwrap();
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep, reply(REPLY_SUCCEEDED));

        client.write_all(b"over socks").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over socks");
    }

    #[tokio::test]
    async fn dial_failure_is_connection_refused() {
        let proxy = spawn_proxy().await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let mut client = greet(proxy).await;
        client.write_all(&connect_v4(closed, CMD_CONNECT)).await.unwrap();
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[1], REPLY_CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let proxy = spawn_proxy().await;
        let echo = spawn_echo().await;

        let mut client = greet(proxy).await;
        client.write_all(&connect_v4(echo, 0x02)).await.unwrap();
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn unknown_address_type_is_rejected() {
        let proxy = spawn_proxy().await;
        let mut client = greet(proxy).await;
        client.write_all(&[0x05, CMD_CONNECT, 0x00, 0x09]).await.unwrap();
        let mut rep = [0u8; 10];
        client.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[1], REPLY_ADDRESS_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn auth_only_clients_are_turned_away() {
        let proxy = spawn_proxy().await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, METHOD_NONE_ACCEPTABLE]);
    }
}
