//! Stream abstractions handed to the proxy layer.
//!
//! Both the direct TCP path and the relayed WebSocket path satisfy
//! [`Connection`], so the SOCKS side pipes bytes without caring which one it
//! got back from the dialer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

/// A byte-stream connection with independent read and write deadlines.
///
/// A deadline is an absolute instant; once it passes, pending and future
/// operations in that direction fail with [`io::ErrorKind::TimedOut`] until
/// the deadline is moved or cleared with `None`.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Set both deadlines at once.
    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

/// Read/write deadline timers shared by the stream implementations.
#[derive(Debug, Default)]
pub struct Deadlines {
    read: Option<Pin<Box<Sleep>>>,
    write: Option<Pin<Box<Sleep>>>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read(&mut self, deadline: Option<Instant>) {
        self.read = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    pub fn set_write(&mut self, deadline: Option<Instant>) {
        self.write = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// `Ready(Err)` once the read deadline has passed, `Pending` otherwise.
    /// Registers the waker so a blocked read is woken when the timer fires.
    pub fn poll_read_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        poll_expired(&mut self.read, cx, "read deadline exceeded")
    }

    pub fn poll_write_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        poll_expired(&mut self.write, cx, "write deadline exceeded")
    }
}

fn poll_expired(
    timer: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
    what: &'static str,
) -> Poll<io::Error> {
    match timer {
        // A fresh `Sleep` stays pending until the next timer tick, even when
        // its deadline has already passed.
        Some(sleep) if sleep.deadline() <= Instant::now() => {
            Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, what))
        }
        Some(sleep) => match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, what)),
            Poll::Pending => Poll::Pending,
        },
        None => Poll::Pending,
    }
}

/// Any `AsyncRead + AsyncWrite` with [`Deadlines`] enforced around it.
///
/// The direct path wraps its `TcpStream` in this.
#[derive(Debug)]
pub struct Deadlined<T> {
    inner: T,
    deadlines: Deadlines,
}

impl<T> Deadlined<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            deadlines: Deadlines::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Deadlined<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_read_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Deadlined<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_write_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.deadlines.poll_write_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for Deadlined<TcpStream> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.deadlines.set_write(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Loopback pair: (deadlined client side, raw server side).
    async fn pair() -> (Deadlined<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (Deadlined::new(client.unwrap()), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn no_deadline_passes_through() {
        let (mut a, mut b) = pair().await;
        b.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_deadline_wakes_blocked_read() {
        let (mut a, _b) = pair().await;
        a.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn deadline_at_now_fails_even_with_data_ready() {
        let (mut a, mut b) = pair().await;
        b.write_all(b"queued").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.set_read_deadline(Some(Instant::now()));
        let mut buf = [0u8; 6];
        let err = a.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn read_deadline_leaves_writes_alone() {
        let (mut a, mut b) = pair().await;
        a.set_read_deadline(Some(Instant::now()));
        a.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn expired_write_deadline_fails_write() {
        let (mut a, _b) = pair().await;
        a.set_write_deadline(Some(Instant::now()));
        let err = a.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(a.flush().await.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn set_deadline_covers_both_directions() {
        let (mut a, _b) = pair().await;
        a.set_deadline(Some(Instant::now()));
        let mut buf = [0u8; 1];
        assert!(a.read(&mut buf).await.is_err());
        assert!(a.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn clearing_deadline_restores_reads() {
        let (mut a, mut b) = pair().await;
        a.set_read_deadline(Some(Instant::now()));
        let mut buf = [0u8; 3];
        assert!(a.read(&mut buf).await.is_err());

        a.set_read_deadline(None);
        b.write_all(b"abc").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn reports_socket_addresses() {
        let (a, b) = pair().await;
        assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
        assert_eq!(a.local_addr().unwrap(), b.peer_addr().unwrap());
    }
}
