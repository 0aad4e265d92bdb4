use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};
use uuid::Uuid;

use crate::codec::{FrameError, Protocol};
use crate::request::{Outbound, Request, RequestError};
use crate::stream::{PeerCertificate, Stream, Transport};

/// Request handler shared by every connection of a server.
pub type Handler<P> = Rc<dyn Fn(Request<P>)>;

/// Where a connection is in its read/write cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Between requests.
    Idle,
    /// Decoding the next frame from the stream.
    AwaitingFrame,
    /// The handler owns the current request.
    Dispatched,
    /// Writing a response to the stream.
    Flushing,
    /// The stream is shut down. Terminal.
    Closed,
}

// What to do once a request is over.
#[derive(Debug, PartialEq)]
enum Next {
    Read,
    Close,
}

/// Drives one stream through repeated request/response cycles.
///
/// A new frame is only decoded after the response to the previous one has been flushed, so
/// pipelined requests are answered strictly in order, one at a time.
pub struct Connection<S, P> {
    pub id: Uuid,
    framed: Framed<S, P>,
    remote_addr: SocketAddr,
    transport: Transport,
    peer_certificate: Option<PeerCertificate>,
    keep_alive: bool,
    handler: Handler<P>,
    state: State,
    requests: u64,
}

impl<S: Stream, P: Protocol> Connection<S, P> {
    pub fn new(stream: S, remote_addr: SocketAddr, handler: Handler<P>, keep_alive: bool) -> Self {
        let transport = stream.transport();
        let peer_certificate = stream.peer_certificate();

        Connection {
            id: Uuid::new_v4(),
            // Data is read from the socket into the codec's buffer. When a frame is decoded, the
            // corresponding bytes are removed from it.
            framed: Framed::new(stream, P::default()),
            remote_addr,
            transport,
            peer_certificate,
            keep_alive,
            handler,
            state: State::Idle,
            requests: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Serves requests until the peer goes away, a request ends with keep-alive off, or something
    /// goes wrong. The stream is shut down on the way out.
    #[instrument(name = "connection", skip_all, fields(connection_id, client_address))]
    pub async fn run(mut self) {
        tracing::Span::current()
            .record("connection_id", self.id.to_string())
            .record("client_address", self.remote_addr.to_string());

        debug!(protocol = P::NAME, "connection opened");

        loop {
            let span = info_span!("request", seq = self.requests);
            match self.serve_request().instrument(span).await {
                Next::Read => self.state = State::Idle,
                Next::Close => break,
            }
        }

        self.close().await;
        info!(requests = self.requests, "connection closed");
    }

    async fn serve_request(&mut self) -> Next {
        self.state = State::AwaitingFrame;

        let body = match self.read_frame().await {
            Some(body) => body,
            None => return Next::Close,
        };
        self.requests += 1;

        // Every request gets its own channel: whatever a previous request still holds can't reach
        // this exchange.
        let (tx, rx) = mpsc::unbounded_channel();
        let request = Request::new(
            body.clone(),
            self.remote_addr,
            self.transport,
            self.peer_certificate.clone(),
            tx,
        );

        self.state = State::Dispatched;
        let handler = Rc::clone(&self.handler);
        if panic::catch_unwind(AssertUnwindSafe(|| handler(request))).is_err() {
            error!(
                body = %String::from_utf8_lossy(&body),
                "request handler panicked, closing connection"
            );
            return Next::Close;
        }

        self.respond(rx).await
    }

    async fn read_frame(&mut self) -> Option<Bytes> {
        match self.framed.next().await {
            Some(Ok(body)) => {
                trace!(?body, "received frame");
                Some(body.freeze())
            }
            Some(Err(FrameError::Io(e))) => {
                debug!(error = %e, "failed to read from stream");
                None
            }
            Some(Err(e)) => {
                warn!(error = %e, "malformed frame, closing connection");
                None
            }
            None => {
                debug!("stream closed by peer");
                None
            }
        }
    }

    /// Carries out what the request asks for until it is finished.
    async fn respond(&mut self, mut rx: UnboundedReceiver<Outbound>) -> Next {
        let mut finished = false;
        let mut keep_alive = self.keep_alive;

        while !finished {
            let Some(outbound) = rx.recv().await else {
                warn!("request dropped without finishing, closing connection");
                return Next::Close;
            };
            if !self.apply(outbound, &mut finished, &mut keep_alive).await {
                return Next::Close;
            }
        }

        // A handler may queue more right behind the finish, e.g. a keep-alive override.
        while let Ok(outbound) = rx.try_recv() {
            if !self.apply(outbound, &mut finished, &mut keep_alive).await {
                return Next::Close;
            }
        }

        match keep_alive {
            true => Next::Read,
            false => {
                debug!("request finished without keep-alive");
                Next::Close
            }
        }
    }

    async fn apply(
        &mut self,
        outbound: Outbound,
        finished: &mut bool,
        keep_alive: &mut bool,
    ) -> bool {
        match outbound {
            Outbound::Write { chunks, flushed } => {
                self.state = State::Flushing;
                trace!(bytes = chunks.len(), "writing response");

                match self.framed.send(chunks).await {
                    Ok(()) => {
                        let _ = flushed.send(Ok(()));
                        self.state = State::Dispatched;
                        true
                    }
                    Err(e) => {
                        debug!(error = %e, "failed to write response");
                        let _ = flushed.send(Err(RequestError::ConnectionClosed));
                        false
                    }
                }
            }
            Outbound::Finish {
                keep_alive: override_,
            } => {
                *finished = true;
                if let Some(value) = override_ {
                    *keep_alive = value;
                }
                true
            }
        }
    }

    async fn close(&mut self) {
        self.state = State::Closed;
        if let Err(e) = self.framed.get_mut().shutdown().await {
            trace!(error = %e, "failed to shut down stream");
        }
    }
}
