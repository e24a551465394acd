//! Byte-stream view over a relay WebSocket session.
//!
//! Each `poll_write` becomes exactly one binary message. Each completed read
//! consumes exactly one message: when the caller's buffer is smaller than
//! the message, the excess bytes of that message are dropped. Consumers are
//! expected to read with buffers at least as large as the relay's frames.
//!
//! Close frames and close codes from the peer never surface as errors; the
//! reader just sees EOF.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use edgetun_core::{Connection, Deadlines};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// A relay session presented as `AsyncRead + AsyncWrite`.
pub struct RelayStream<S> {
    ws: WebSocketStream<S>,
    deadlines: Deadlines,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    eof: bool,
}

impl<S> RelayStream<S> {
    /// Wrap an upgraded session. The socket addresses are taken from the
    /// underlying TCP connection before it was handed to TLS.
    pub fn new(
        ws: WebSocketStream<S>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            ws,
            deadlines: Deadlines::new(),
            local_addr,
            peer_addr,
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.ws
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }
}

/// Closed-connection errors are how tungstenite reports a finished session.
fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn to_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

fn addr_or_err(addr: Option<SocketAddr>) -> io::Result<SocketAddr> {
    addr.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "address unavailable"))
}

impl<S> AsyncRead for RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_read_expired(cx) {
            return Poll::Ready(Err(e));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }

        loop {
            let payload = match ready!(Pin::new(&mut this.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec().into(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "relay closed the session");
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) if is_closed(&e) => {
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
                None => {
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
            };

            // An empty message would read as EOF.
            if payload.is_empty() {
                continue;
            }

            let n = payload.len().min(buf.remaining());
            if n < payload.len() {
                trace!(dropped = payload.len() - n, "relay message truncated to read buffer");
            }
            buf.put_slice(&payload[..n]);
            return Poll::Ready(Ok(()));
        }
    }
}

impl<S> AsyncWrite for RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_write_expired(cx) {
            return Poll::Ready(Err(e));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(Pin::new(&mut this.ws).poll_ready(cx)).map_err(to_io)?;
        Pin::new(&mut this.ws)
            .start_send(Message::Binary(buf.to_vec().into()))
            .map_err(to_io)?;

        // The frame is queued; try to push it out now. A pending flush is
        // completed by the next poll_ready or poll_flush.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.ws).poll_flush(cx) {
            return Poll::Ready(Err(to_io(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_write_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.ws).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().ws).poll_close(cx)) {
            Err(e) if !is_closed(&e) => Poll::Ready(Err(to_io(e))),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl<S> Connection for RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        addr_or_err(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        addr_or_err(self.peer_addr)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.deadlines.set_write(deadline);
    }
}
