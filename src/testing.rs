//! In-memory transports and a miniature server for unit tests.
//!
//! Transports are real WebSocket connections (`tokio-tungstenite` over a
//! `tokio::io::duplex` pipe), so close handshakes behave exactly as they do
//! over TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{duplex, split, AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::transport::{Transport, TransportError, TransportFactory};
use crate::tunnel::connection::{HandoverTimeouts, ProxyConnection};

const PIPE_SIZE: usize = 256 * 1024;

/// A connected (client, server) transport pair.
pub async fn transport_pair() -> (Transport, Transport) {
    let (a, b) = duplex(PIPE_SIZE);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (
        Transport::from_tungstenite(client),
        Transport::from_tungstenite(server),
    )
}

/// Short bounds so timeout tests finish quickly.
pub fn fast_timeouts() -> HandoverTimeouts {
    HandoverTimeouts {
        initiate: Duration::from_millis(1000),
        accept: Duration::from_millis(800),
        peer_closed: Duration::from_millis(300),
    }
}

pub async fn read_exact_string<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> String {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut buf))
        .await
        .expect("timed out reading tunnel output")
        .expect("read failed");
    String::from_utf8(buf).expect("utf-8 output")
}

/// Factory whose server halves are delivered to a [`MemoryServer`].
pub struct MemoryFactory {
    tx: mpsc::UnboundedSender<Transport>,
}

impl MemoryFactory {
    pub fn new(timeouts: HandoverTimeouts) -> (Arc<Self>, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = MemoryServer {
            incoming: Arc::new(Mutex::new(rx)),
            handovers: Arc::new(AtomicUsize::new(0)),
            timeouts,
        };
        (Arc::new(Self { tx }), server)
    }

    /// Factory backed by a server that echoes every byte back.
    pub fn echo(timeouts: HandoverTimeouts) -> (Arc<Self>, MemoryServer) {
        let (factory, server) = Self::new(timeouts);
        let (tunnel_side, echo_side) = duplex(PIPE_SIZE);
        tokio::spawn(async move {
            let (mut r, mut w) = split(echo_side);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        let (local, remote) = split(tunnel_side);
        server.serve(local, remote);
        (factory, server)
    }
}

impl TransportFactory for MemoryFactory {
    fn open<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>> {
        Box::pin(async move {
            let (client, server) = transport_pair().await;
            self.tx
                .send(server)
                .map_err(|_| TransportError::Connect("memory server gone".to_string()))?;
            Ok(client)
        })
    }
}

/// Server end of a [`MemoryFactory`]: the first transport starts a session,
/// later ones are accepted as handovers.
pub struct MemoryServer {
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<Transport>>>,
    handovers: Arc<AtomicUsize>,
    timeouts: HandoverTimeouts,
}

impl MemoryServer {
    /// Next server-side transport, untouched.
    pub async fn next_raw(&self) -> Transport {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .expect("factory dropped")
    }

    pub fn handovers(&self) -> usize {
        self.handovers.load(Ordering::SeqCst)
    }

    pub async fn wait_for_handovers(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.handovers() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server did not complete the expected handovers");
    }

    /// Run a server session bridging `local`/`remote`; returns a handle to
    /// its connection once the first transport arrives.
    pub fn serve<R, W>(&self, local: R, remote: W) -> tokio::task::JoinHandle<Arc<ProxyConnection>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let incoming = self.incoming.clone();
        let handovers = self.handovers.clone();
        let timeouts = self.timeouts;
        tokio::spawn(async move {
            let mut rx = incoming.lock_owned().await;
            let first = rx.recv().await.expect("factory dropped");
            let conn = Arc::new(ProxyConnection::server("memory", timeouts));
            conn.accept(first);
            tokio::spawn({
                let conn = conn.clone();
                async move { conn.start(local, remote).await }
            });
            tokio::spawn({
                let conn = conn.clone();
                async move {
                    while let Some(next) = rx.recv().await {
                        if conn.accept_handover(next).await.is_ok() {
                            handovers.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
            conn
        })
    }

    /// Start a session whose server-side source is the returned pipe.
    pub async fn attach_pipe(&self) -> (DuplexStream, Arc<ProxyConnection>) {
        let (writer, local) = duplex(PIPE_SIZE);
        let conn = self
            .serve(local, tokio::io::sink())
            .await
            .expect("server task panicked");
        (writer, conn)
    }
}
