use futures::future;
use std::cell::Cell;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::Protocol;
use crate::connection::{Connection, Handler};
use crate::request::Request;
use crate::stream::Stream;
use crate::Error;

/// Accepts connections and serves every one of them with the same handler and codec.
///
/// Everything runs on the current thread: [`Server::run`] and [`Server::handle_stream`] must be
/// called from within a [`tokio::task::LocalSet`].
///
/// ```ignore
/// use netline::{codec::NetstringCodec, Request, Server};
///
/// fn handle(mut request: Request<NetstringCodec>) {
///     let body = request.body().clone();
///     let _ = request.write(body);
/// }
///
/// let mut server = Server::new(handle).keep_alive(false);
/// server.listen("127.0.0.1:8888").await?;
/// server.run().await?;
/// ```
pub struct Server<P> {
    handler: Handler<P>,
    keep_alive: bool,
    listeners: Vec<TcpListener>,
    connections: Rc<Cell<usize>>,
}

impl<P: Protocol> Server<P> {
    pub fn new(handler: impl Fn(Request<P>) + 'static) -> Self {
        debug!(protocol = P::NAME, "server initialized");

        Server {
            handler: Rc::new(handler),
            keep_alive: true,
            listeners: Vec::new(),
            connections: Rc::default(),
        }
    }

    /// Whether connections stay open after a request finishes. Defaults to `true`; a request can
    /// still decide otherwise with [`Request::finish_with`].
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Binds one more listening socket and returns its address.
    pub async fn listen(&mut self, addr: impl ToSocketAddrs) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        self.listeners.push(listener);
        Ok(local_addr)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Number of connections currently being served.
    pub fn connections(&self) -> usize {
        self.connections.get()
    }

    /// Serves a stream accepted elsewhere, e.g. from a Unix socket or after a TLS handshake.
    pub fn handle_stream<S: Stream>(&self, stream: S, remote_addr: SocketAddr) -> JoinHandle<()> {
        info!(%remote_addr, "accepted connection");

        let conn = Connection::new(
            stream,
            remote_addr,
            Rc::clone(&self.handler),
            self.keep_alive,
        );
        let connections = Rc::clone(&self.connections);
        connections.set(connections.get() + 1);

        tokio::task::spawn_local(async move {
            conn.run().await;
            connections.set(connections.get() - 1);
        })
    }

    /// Accepts connections on every bound socket, forever.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(future::pending()).await
    }

    /// Accepts connections until `shutdown` completes. Connections already being served keep
    /// running on the local set.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        if self.listeners.is_empty() {
            return Err("server is not listening on any address".into());
        }

        for addr in self.local_addrs() {
            info!(%addr, protocol = P::NAME, "listening");
        }

        tokio::pin!(shutdown);

        loop {
            let accept = future::select_all(
                self.listeners
                    .iter()
                    .map(|listener| Box::pin(listener.accept())),
            );

            tokio::select! {
                _ = &mut shutdown => {
                    info!("stopped accepting connections");
                    return Ok(());
                }
                (accepted, _, _) = accept => match accepted {
                    Ok((socket, remote_addr)) => {
                        self.handle_stream(socket, remote_addr);
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NewlineCodec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::LocalSet;

    fn shout(mut req: Request<NewlineCodec>) {
        let loud = req.body().to_ascii_uppercase();
        req.write(loud).unwrap();
    }

    #[tokio::test]
    async fn listens_on_several_addresses() {
        let mut server = Server::new(shout);
        let first = server.listen("127.0.0.1:0").await.unwrap();
        let second = server.listen("127.0.0.1:0").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(server.local_addrs(), vec![first, second]);
    }

    #[tokio::test]
    async fn run_without_listeners_fails() {
        let server = Server::new(shout);

        assert!(server.run().await.is_err());
    }

    #[tokio::test]
    async fn accepts_on_every_listener() {
        LocalSet::new()
            .run_until(async {
                let mut server = Server::new(shout);
                let addrs = vec![
                    server.listen("127.0.0.1:0").await.unwrap(),
                    server.listen("127.0.0.1:0").await.unwrap(),
                ];
                tokio::task::spawn_local(server.run());

                for addr in addrs {
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    stream.write_all(b"hey\n").await.unwrap();

                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(&buf, b"HEY\n");
                }
            })
            .await;
    }

    #[tokio::test]
    async fn counts_live_connections() {
        LocalSet::new()
            .run_until(async {
                let server = Server::new(shout).keep_alive(false);
                let (mut client, stream) = tokio::io::duplex(64);

                let conn = server.handle_stream(stream, "127.0.0.1:9".parse().unwrap());
                assert_eq!(server.connections(), 1);

                client.write_all(b"bye\n").await.unwrap();
                conn.await.unwrap();
                assert_eq!(server.connections(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn run_until_stops_accepting() {
        LocalSet::new()
            .run_until(async {
                let mut server = Server::new(shout);
                server.listen("127.0.0.1:0").await.unwrap();

                let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
                let running = tokio::task::spawn_local(server.run_until(async {
                    let _ = stopped.await;
                }));

                stop.send(()).unwrap();
                assert!(running.await.unwrap().is_ok());
            })
            .await;
    }
}
