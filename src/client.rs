use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::{Chunks, FrameError, Protocol};

/// Reacts to the frames a server sends back.
pub trait Receive {
    /// Called once per frame. Returning a payload sends it as the next request; `None` ends the
    /// exchange.
    fn receive(&mut self, data: Bytes) -> Option<Bytes>;
}

/// The calling side of a framed connection.
///
/// Frames requests with the same codec a [`Server`](crate::server::Server) decodes them with, and
/// decodes its responses the same way. A malformed frame from the server is an error.
pub struct Client<S, P> {
    framed: Framed<S, P>,
}

impl<P: Protocol> Client<TcpStream, P> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, FrameError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Client::new(stream))
    }
}

impl<S, P> Client<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Protocol,
{
    pub fn new(stream: S) -> Self {
        Client {
            framed: Framed::new(stream, P::default()),
        }
    }

    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<(), FrameError> {
        let data = data.into();
        debug!(bytes = data.len(), "client write");

        self.framed.send(Chunks::from(data)).await
    }

    /// Waits for the next frame. `None` means the server closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, FrameError> {
        let frame = self.framed.next().await.transpose()?;
        if let Some(data) = &frame {
            debug!(bytes = data.len(), "client read");
        }

        Ok(frame.map(BytesMut::freeze))
    }

    /// Sends a request and waits for its response.
    pub async fn call(&mut self, data: impl Into<Bytes>) -> Result<Bytes, FrameError> {
        self.send(data).await?;
        self.recv().await?.ok_or_else(closed)
    }

    /// Sends `first`, then feeds every response to `receiver` and sends whatever it returns until
    /// it returns `None`. Returns the number of responses received.
    pub async fn drive<R: Receive>(
        &mut self,
        first: impl Into<Bytes>,
        receiver: &mut R,
    ) -> Result<usize, FrameError> {
        let mut received = 0;
        self.send(first).await?;

        loop {
            let data = self.recv().await?.ok_or_else(closed)?;
            received += 1;

            match receiver.receive(data) {
                Some(next) => self.send(next).await?,
                None => return Ok(received),
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.framed.get_mut()
    }

    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

fn closed() -> FrameError {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server").into()
}
