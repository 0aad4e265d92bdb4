use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::{Chunks, FrameError, Protocol};
use crate::stream::{PeerCertificate, Transport};

#[derive(Debug, ThisError)]
pub enum RequestError {
    /// The response was already flushed; a request answers exactly once.
    #[error("write after finish")]
    Finished,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// What a request asks of its connection, in the order it asked.
#[derive(Debug)]
pub(crate) enum Outbound {
    Write {
        chunks: Chunks,
        flushed: oneshot::Sender<Result<(), RequestError>>,
    },
    Finish {
        keep_alive: Option<bool>,
    },
}

/// Resolves once a written response has been handed to the socket.
#[derive(Debug)]
pub struct Flushed(oneshot::Receiver<Result<(), RequestError>>);

impl Future for Flushed {
    type Output = Result<(), RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RequestError::ConnectionClosed)))
    }
}

/// One request/response exchange on a connection.
///
/// The handler receives the decoded frame as [`Request::body`] and answers with
/// [`Request::write`], optionally preceded by any number of [`Request::write_chunk`] calls. All
/// segments go out as a single frame. [`Request::finish`] completes a request that has nothing
/// (more) to say; [`Request::finish_with`] also overrides the connection's keep-alive policy.
///
/// A request may be moved into a task and answered later, but it is tied to the exchange it was
/// created for: once the connection is done with it every write fails.
pub struct Request<P> {
    body: Bytes,
    remote_addr: SocketAddr,
    transport: Transport,
    peer_certificate: Option<PeerCertificate>,
    start_time: Instant,
    finish_time: Option<Instant>,
    // `None` once flushed.
    response: Option<Chunks>,
    outbound: UnboundedSender<Outbound>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> Request<P> {
    pub(crate) fn new(
        body: Bytes,
        remote_addr: SocketAddr,
        transport: Transport,
        peer_certificate: Option<PeerCertificate>,
        outbound: UnboundedSender<Outbound>,
    ) -> Self {
        Request {
            body,
            remote_addr,
            transport,
            peer_certificate,
            start_time: Instant::now(),
            finish_time: None,
            response: Some(Chunks::new()),
            outbound,
            _protocol: PhantomData,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The client certificate, if the stream is TLS and the acceptor asked for one.
    pub fn peer_certificate(&self) -> Option<&PeerCertificate> {
        self.peer_certificate.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }

    /// Time from creation until finish, or until now for a request still in progress.
    pub fn request_time(&self) -> Duration {
        self.finish_time.unwrap_or_else(Instant::now) - self.start_time
    }

    /// Buffers a segment of the response without sending anything.
    pub fn write_chunk(&mut self, chunk: impl Into<Bytes>) -> Result<(), RequestError> {
        let chunk = chunk.into();
        let response = self.response.as_mut().ok_or(RequestError::Finished)?;

        P::validate(&chunk)?;
        response.push(chunk);

        Ok(())
    }

    /// Sends everything buffered plus `chunk` as one frame and finishes the request.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<Flushed, RequestError> {
        self.write_chunk(chunk)?;
        let flushed = self.flush()?;
        self.finish()?;

        Ok(flushed)
    }

    /// Finishes the request, keeping the connection open or not as the server was configured.
    pub fn finish(&mut self) -> Result<(), RequestError> {
        self.complete(None)
    }

    /// Finishes the request and decides whether the connection survives it.
    ///
    /// Calling this right after [`Request::write`], in the same scheduling turn, overrides the
    /// keep-alive decision `write` made on its own. Once the connection has moved on, finishing
    /// again fails with [`RequestError::Finished`].
    pub fn finish_with(&mut self, keep_alive: bool) -> Result<(), RequestError> {
        self.complete(Some(keep_alive))
    }

    fn flush(&mut self) -> Result<Flushed, RequestError> {
        let chunks = self.response.take().ok_or(RequestError::Finished)?;
        let (tx, rx) = oneshot::channel();

        self.outbound
            .send(Outbound::Write {
                chunks,
                flushed: tx,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;

        Ok(Flushed(rx))
    }

    fn complete(&mut self, keep_alive: Option<bool>) -> Result<(), RequestError> {
        if self.response.as_ref().is_some_and(|r| r.segments() > 0) {
            self.flush()?;
        }
        self.response = None;

        let already_finished = self.finish_time.is_some();
        if !already_finished {
            self.finish_time = Some(Instant::now());
        }

        // Nobody listens once the connection is done with this exchange.
        if self.outbound.send(Outbound::Finish { keep_alive }).is_err() && already_finished {
            return Err(RequestError::Finished);
        }

        Ok(())
    }
}

impl<P: Protocol> fmt::Display for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} request from {} ({}), body: {}",
            P::NAME,
            self.remote_ip(),
            self.transport,
            String::from_utf8_lossy(&self.body)
        )
    }
}

impl<P> fmt::Debug for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("body", &self.body)
            .field("remote_addr", &self.remote_addr)
            .field("transport", &self.transport)
            .field("finished", &self.finish_time.is_some())
            .finish()
    }
}
