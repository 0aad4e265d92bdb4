use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use strum_macros::{AsRefStr, Display};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Whether bytes travel in the clear or over an encrypted session.
#[derive(AsRefStr, Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum Transport {
    #[default]
    #[strum(serialize = "")]
    Plain,
    #[strum(serialize = "ssl")]
    Tls,
}

/// DER encoded certificate presented by the peer during the TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate(pub Bytes);

/// A socket-like byte stream a connection can own.
///
/// The accept loop decides what the stream is when it hands it over, so nothing here inspects
/// the concrete type.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + 'static {
    fn transport(&self) -> Transport {
        Transport::Plain
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        None
    }
}

impl Stream for TcpStream {}

#[cfg(unix)]
impl Stream for tokio::net::UnixStream {}

impl Stream for DuplexStream {}

/// A stream that already went through a TLS handshake.
///
/// TLS itself happens outside this crate: the acceptor wraps its session here along with the
/// certificate it validated, if client certificates were requested.
#[derive(Debug)]
pub struct Secured<S> {
    inner: S,
    peer_certificate: Option<PeerCertificate>,
}

impl<S> Secured<S> {
    pub fn new(inner: S, peer_certificate: Option<PeerCertificate>) -> Self {
        Secured {
            inner,
            peer_certificate,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Secured<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Secured<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + 'static> Stream for Secured<S> {
    fn transport(&self) -> Transport {
        Transport::Tls
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        self.peer_certificate.clone()
    }
}
