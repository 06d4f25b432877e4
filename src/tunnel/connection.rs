//! [`ProxyConnection`]: a byte-stream tunnel whose transport can be swapped
//! mid-session.
//!
//! ## Handover
//!
//! ```text
//! client                                        server
//! ──────                                        ──────
//! initiate_handover                             ┆
//!   lock send gate, mark handover               ┆
//!   open new transport (same id) ─────────────▶ accept_handover
//!                                                 lock send gate, mark handover
//!   receive loop ◀──────── close("handover") ──── send close on old transport
//!   reply close, ack ───────────────────────────▶ receive loop sees reply, ack
//!   install new transport                         install new transport
//! ```
//!
//! The send gate is held for the whole window, so nothing is written to a
//! transport that is being retired; the source stream simply backs up. The
//! receive loop reads the old transport until the peer's normal closure, then
//! waits for the new transport to be installed. Every byte written before the
//! handover arrives before every byte written after it.
//!
//! A failed handover has no rollback: by the time it can fail, the old
//! transport is already closing. The connection is marked failed and both I/O
//! loops unwind.
//!
//! ## End of stream
//!
//! EOF on the local source is forwarded as an empty binary frame. The peer
//! drops its destination writer on that frame, so the process behind it sees
//! EOF on stdin, and keeps the opposite direction running. Once a side has
//! both sent and received the marker it closes the transport normally.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HandoverConfig;
use crate::transport::{
    is_normal_close, CloseReason, Frame, Transport, TransportError, TransportFactory, FRAME_SIZE,
};
use crate::util::run_both;

/// Bounds on every blocking wait of the handover path.
#[derive(Debug, Clone, Copy)]
pub struct HandoverTimeouts {
    /// Whole of [`ProxyConnection::initiate_handover`].
    pub initiate: Duration,
    /// Whole of [`ProxyConnection::accept_handover`].
    pub accept: Duration,
    /// Wait for the receive loop to report the old transport closed.
    pub peer_closed: Duration,
}

impl Default for HandoverTimeouts {
    fn default() -> Self {
        Self {
            initiate: Duration::from_secs(30),
            accept: Duration::from_secs(25),
            peer_closed: Duration::from_secs(15),
        }
    }
}

impl From<&HandoverConfig> for HandoverTimeouts {
    fn from(config: &HandoverConfig) -> Self {
        Self {
            initiate: Duration::from_millis(config.initiate_timeout_ms),
            accept: Duration::from_millis(config.accept_timeout_ms),
            peer_closed: Duration::from_millis(config.peer_closed_timeout_ms),
        }
    }
}

/// Lifecycle of a [`ProxyConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    HandingOver,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::HandingOver => "handing_over",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Errors that end (or refuse) a tunnel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// A non-binary data frame arrived.
    ProtocolViolation,
    /// The transport failed or closed.
    Transport(TransportError),
    /// The peer closed the transport with a non-normal status.
    Closed(CloseReason),
    /// Reading the local source or writing the local destination failed.
    LocalIo(String),
    /// A handover wait exceeded its bound. The payload names the stage.
    HandoverTimeout(&'static str),
    /// The handover handshake broke down.
    HandoverFailed(String),
    /// No transport has been installed yet.
    NotConnected,
    /// Handover can only be initiated by the side holding a transport factory.
    NotInitiator,
}

impl TunnelError {
    /// Normal closure or a clean end of stream: the tunnel ended, nothing failed.
    pub fn is_normal_closure(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Eof))
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation => write!(f, "protocol violation: non-binary frame received"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Closed(reason) => write!(f, "transport closed abnormally: {reason}"),
            Self::LocalIo(e) => write!(f, "local stream error: {e}"),
            Self::HandoverTimeout(stage) => write!(f, "handover timed out waiting for {stage}"),
            Self::HandoverFailed(e) => write!(f, "handover failed: {e}"),
            Self::NotConnected => write!(f, "no transport connected"),
            Self::NotInitiator => write!(f, "connection cannot initiate a handover"),
        }
    }
}

impl std::error::Error for TunnelError {}

impl From<TransportError> for TunnelError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

type AckResult = Result<(), TunnelError>;

/// Rendezvous between a handover operation and the receive loop.
///
/// The handover side arms the signal before it lets the receive loop know a
/// handover is running; the receive loop fires it once it has seen the old
/// transport close. Firing with nobody waiting is itself a failure.
struct PeerClosedSignal {
    waiter: StdMutex<Option<oneshot::Sender<AckResult>>>,
}

impl PeerClosedSignal {
    fn new() -> Self {
        Self {
            waiter: StdMutex::new(None),
        }
    }

    fn arm(&self) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn fire(&self, result: AckResult) -> Result<(), TunnelError> {
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tx) = waiter else {
            return Err(TunnelError::HandoverFailed(
                "no handover is waiting for the peer closure".to_string(),
            ));
        };
        tx.send(result).map_err(|_| {
            TunnelError::HandoverFailed("handover abandoned before the peer closed".to_string())
        })
    }
}

/// A handover-capable duplex tunnel identified by a correlation id.
///
/// Share it behind an `Arc`: [`start`](Self::start) runs the I/O loops while
/// handover operations are invoked from other tasks.
pub struct ProxyConnection {
    id: String,
    /// Current transport. Replaced with store-then-broadcast; the receive
    /// loop waits here for a replacement.
    transport: watch::Sender<Option<Arc<Transport>>>,
    /// Serialises outbound frames. Held for the whole of a handover.
    send_gate: Mutex<()>,
    handover_in_progress: AtomicBool,
    peer_closed: PeerClosedSignal,
    factory: Option<Arc<dyn TransportFactory>>,
    timeouts: HandoverTimeouts,
    state: StdMutex<ConnectionState>,
    failure: StdMutex<Option<TunnelError>>,
    cancel: CancellationToken,
    /// Set once the local source hit EOF and the marker was sent.
    source_eof: CancellationToken,
    /// Set once the peer's end-of-stream marker arrived.
    peer_eof: CancellationToken,
}

impl ProxyConnection {
    fn with_factory(
        id: String,
        factory: Option<Arc<dyn TransportFactory>>,
        timeouts: HandoverTimeouts,
    ) -> Self {
        let (transport, _) = watch::channel(None);
        Self {
            id,
            transport,
            send_gate: Mutex::new(()),
            handover_in_progress: AtomicBool::new(false),
            peer_closed: PeerClosedSignal::new(),
            factory,
            timeouts,
            state: StdMutex::new(ConnectionState::Connecting),
            failure: StdMutex::new(None),
            cancel: CancellationToken::new(),
            source_eof: CancellationToken::new(),
            peer_eof: CancellationToken::new(),
        }
    }

    /// Client side: transports are opened through `factory`, which also makes
    /// this side the handover initiator.
    pub fn client(
        id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        timeouts: HandoverTimeouts,
    ) -> Self {
        Self::with_factory(id.into(), Some(factory), timeouts)
    }

    /// Server side: transports are handed in from accepted upgrade requests.
    pub fn server(id: impl Into<String>, timeouts: HandoverTimeouts) -> Self {
        Self::with_factory(id.into(), None, timeouts)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` once the tunnel closed or failed.
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal() || self.cancel.is_cancelled()
    }

    /// Resolves when the tunnel ends for any reason.
    pub async fn terminated(&self) {
        self.cancel.cancelled().await;
    }

    /// Resolves once everything read from the local source has been sent,
    /// or the tunnel ended.
    pub async fn source_drained(&self) {
        tokio::select! {
            () = self.source_eof.cancelled() => {}
            () = self.cancel.cancelled() => {}
        }
    }

    /// Stop both I/O loops without recording a failure (e.g. user interrupt).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Record a fatal error and unwind both loops.
    fn fail(&self, error: TunnelError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.set_state(ConnectionState::Failed);
        self.cancel.cancel();
    }

    /// What a loop returns after observing cancellation.
    fn cancellation_result(&self) -> Result<(), TunnelError> {
        match self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn current_transport(&self) -> Result<Arc<Transport>, TunnelError> {
        self.transport
            .borrow()
            .clone()
            .ok_or(TunnelError::NotConnected)
    }

    /// Store a new transport and wake the receive loop.
    fn install(&self, transport: Transport) {
        self.transport.send_replace(Some(Arc::new(transport)));
        self.handover_in_progress.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Active);
    }

    /// Wait until a transport other than `previous` is installed. `None` when
    /// the connection was cancelled first.
    async fn next_transport(&self, previous: Option<&Arc<Transport>>) -> Option<Arc<Transport>> {
        let mut rx = self.transport.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => None,
            changed = rx.wait_for(|current| match (current, previous) {
                (Some(current), Some(previous)) => !Arc::ptr_eq(current, previous),
                (Some(_), None) => true,
                (None, _) => false,
            }) => changed.ok().and_then(|current| (*current).clone()),
        }
    }

    /// Open the initial transport through the factory (client side).
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let factory = self.factory.as_ref().ok_or(TunnelError::NotInitiator)?;
        let transport = factory.open(&self.id).await?;
        self.install(transport);
        info!(id = %self.id, "tunnel connected");
        Ok(())
    }

    /// Install the initial transport from an accepted upgrade (server side).
    pub fn accept(&self, transport: Transport) {
        self.install(transport);
        info!(id = %self.id, "tunnel accepted");
    }

    /// Bridge `local` → transport and transport → `remote` until the tunnel
    /// ends.
    ///
    /// Returns `Ok` on a normal closure from either direction. Any other
    /// failure cancels the sibling loop and is returned.
    pub async fn start<R, W>(&self, local: R, remote: W) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = run_both(
            &self.cancel,
            self.send_loop(local),
            self.receive_loop(remote),
        )
        .await;
        self.cancel.cancel();
        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Closed);
                info!(id = %self.id, "tunnel closed");
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                if let Ok(transport) = self.current_transport() {
                    transport.shutdown().await;
                }
                warn!(id = %self.id, "tunnel failed: {e}");
                Err(e)
            }
        }
    }

    async fn send_loop<R: AsyncRead + Unpin>(&self, mut local: R) -> Result<(), TunnelError> {
        let mut buf = vec![0u8; FRAME_SIZE];
        loop {
            let read = tokio::select! {
                () = self.cancel.cancelled() => return self.cancellation_result(),
                read = local.read(&mut buf) => read,
            };
            match read {
                Ok(0) => return self.finish_sending().await,
                Ok(n) => {
                    let frame = Frame::Binary(Bytes::copy_from_slice(&buf[..n]));
                    tokio::select! {
                        () = self.cancel.cancelled() => return self.cancellation_result(),
                        sent = self.send_message(frame) => sent?,
                    }
                }
                Err(e) => return Err(TunnelError::LocalIo(e.to_string())),
            }
        }
    }

    /// Send the end-of-stream marker, then close once the peer's marker has
    /// arrived too.
    async fn finish_sending(&self) -> Result<(), TunnelError> {
        debug!(id = %self.id, "local source reached EOF");
        let sent = tokio::select! {
            () = self.cancel.cancelled() => return self.cancellation_result(),
            sent = self.send_message(Frame::Binary(Bytes::new())) => sent,
        };
        match sent {
            Err(e) if e.is_normal_closure() => return Ok(()),
            other => other?,
        }
        self.source_eof.cancel();
        tokio::select! {
            () = self.cancel.cancelled() => self.cancellation_result(),
            () = self.peer_eof.cancelled() => {
                debug!(id = %self.id, "both directions finished, closing");
                self.close_with("eof").await
            }
        }
    }

    async fn receive_loop<W: AsyncWrite + Unpin>(&self, remote: W) -> Result<(), TunnelError> {
        let mut remote = Some(remote);
        let Some(mut transport) = self.next_transport(None).await else {
            return self.cancellation_result();
        };
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => return self.cancellation_result(),
                received = transport.recv() => received,
            };
            let closure = match received {
                Ok(Frame::Binary(data)) if data.is_empty() => {
                    debug!(id = %self.id, "peer reached EOF");
                    if let Some(mut remote) = remote.take() {
                        shutdown_remote(&self.id, &mut remote).await;
                    }
                    self.peer_eof.cancel();
                    continue;
                }
                Ok(Frame::Binary(data)) => {
                    let Some(remote) = remote.as_mut() else {
                        return Err(TunnelError::LocalIo(
                            "data received after end of stream".to_string(),
                        ));
                    };
                    write_remote(remote, &data).await?;
                    continue;
                }
                Ok(Frame::Text(_)) => return Err(TunnelError::ProtocolViolation),
                Ok(Frame::Close(reason)) if is_normal_close(reason.as_ref()) => Ok(()),
                Ok(Frame::Close(reason)) => Err(TunnelError::Closed(
                    reason.unwrap_or_else(|| CloseReason::normal("")),
                )),
                Err(e) => Err(TunnelError::Transport(e)),
            };

            if !self.handover_in_progress.load(Ordering::SeqCst) {
                match closure {
                    Ok(()) => {
                        debug!(id = %self.id, "peer closed the tunnel");
                        transport.shutdown().await;
                    }
                    Err(e) if e.is_normal_closure() => debug!(id = %self.id, "transport ended"),
                    Err(e) => return Err(e),
                }
                if let Some(mut remote) = remote.take() {
                    shutdown_remote(&self.id, &mut remote).await;
                }
                self.cancel.cancel();
                return Ok(());
            }

            if let Err(e) = closure {
                let _ = self.peer_closed.fire(Err(e.clone()));
                return Err(e);
            }

            // The peer closed the old transport on purpose: acknowledge and
            // switch once the replacement is installed.
            transport.shutdown().await;
            self.peer_closed.fire(Ok(()))?;
            debug!(id = %self.id, "old transport closed, waiting for replacement");
            let Some(next) = self.next_transport(Some(&transport)).await else {
                return self.cancellation_result();
            };
            transport = next;
        }
    }

    /// Write one frame on the current transport, waiting out any handover.
    pub async fn send_message(&self, frame: Frame) -> Result<(), TunnelError> {
        let _gate = self.send_gate.lock().await;
        let transport = self.current_transport()?;
        transport.send(frame).await?;
        Ok(())
    }

    async fn await_peer_closed(&self, ack: oneshot::Receiver<AckResult>) -> AckResult {
        match timeout(self.timeouts.peer_closed, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::HandoverFailed(
                "receive loop stopped before the old transport closed".to_string(),
            )),
            Err(_) => Err(TunnelError::HandoverTimeout("the old transport to close")),
        }
    }

    /// Replace the transport with a freshly opened one (client side).
    ///
    /// Any error is fatal for the tunnel; the connection is already failed
    /// when this returns `Err`.
    pub async fn initiate_handover(&self) -> Result<(), TunnelError> {
        let factory = self.factory.clone().ok_or(TunnelError::NotInitiator)?;
        info!(id = %self.id, "initiating handover");

        let handover = async {
            let _gate = self.send_gate.lock().await;
            self.current_transport()?;
            let ack = self.peer_closed.arm();
            self.handover_in_progress.store(true, Ordering::SeqCst);
            self.set_state(ConnectionState::HandingOver);

            let transport = factory.open(&self.id).await?;
            if let Err(e) = self.await_peer_closed(ack).await {
                transport.shutdown().await;
                return Err(e);
            }
            self.install(transport);
            Ok::<(), TunnelError>(())
        };

        self.finish_handover(timeout(self.timeouts.initiate, handover).await, "initiate")
    }

    /// Swap in `transport`, received as a reconnect for this id (server side).
    ///
    /// Closes the old transport with reason `"handover"`, waits for the
    /// receive loop to see the peer's reply, then installs the new one.
    pub async fn accept_handover(&self, transport: Transport) -> Result<(), TunnelError> {
        info!(id = %self.id, "accepting handover");

        let handover = async {
            let _gate = self.send_gate.lock().await;
            let old = match self.current_transport() {
                Ok(old) => old,
                Err(e) => {
                    transport.shutdown().await;
                    return Err(e);
                }
            };
            let ack = self.peer_closed.arm();
            self.handover_in_progress.store(true, Ordering::SeqCst);
            self.set_state(ConnectionState::HandingOver);

            let closed = old
                .send(Frame::Close(Some(CloseReason::normal("handover"))))
                .await
                .map_err(TunnelError::from);
            if let Err(e) = match closed {
                Ok(()) => self.await_peer_closed(ack).await,
                Err(e) => Err(e),
            } {
                transport.shutdown().await;
                return Err(e);
            }
            self.install(transport);
            Ok::<(), TunnelError>(())
        };

        self.finish_handover(timeout(self.timeouts.accept, handover).await, "accept")
    }

    fn finish_handover(
        &self,
        outcome: Result<Result<(), TunnelError>, tokio::time::error::Elapsed>,
        stage: &'static str,
    ) -> Result<(), TunnelError> {
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(TunnelError::HandoverTimeout(stage)),
        };
        match result {
            Ok(()) => {
                info!(id = %self.id, "handover complete");
                Ok(())
            }
            Err(e) => {
                self.peer_closed.disarm();
                warn!(id = %self.id, "handover failed: {e}");
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Send a normal-closure frame on the current transport. A close that was
    /// already sent counts as success.
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.close_with("").await
    }

    async fn close_with(&self, reason: &str) -> Result<(), TunnelError> {
        match self
            .send_message(Frame::Close(Some(CloseReason::normal(reason))))
            .await
        {
            Err(e) if e.is_normal_closure() => Ok(()),
            other => other,
        }
    }
}

/// Flush and close the destination. The caller drops it afterwards, which is
/// what closes a child's stdin pipe.
async fn shutdown_remote<W: AsyncWrite + Unpin>(id: &str, remote: &mut W) {
    if let Err(e) = remote.shutdown().await {
        debug!(id, "destination shutdown: {e}");
    }
}

async fn write_remote<W: AsyncWrite + Unpin>(remote: &mut W, data: &[u8]) -> Result<(), TunnelError> {
    remote
        .write_all(data)
        .await
        .map_err(|e| TunnelError::LocalIo(e.to_string()))?;
    remote
        .flush()
        .await
        .map_err(|e| TunnelError::LocalIo(e.to_string()))
}
