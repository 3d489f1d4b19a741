//! Inbound side: accepts connections, decodes one message from each and
//! routes it to an [`InboundHandler`].
//!
//! The accept task hands connections to a single dispatch worker through an
//! unbounded queue, so messages are handled one at a time in arrival order.
//! The reader given to [`InboundHandler::handle_file`] still holds any bytes
//! buffered past the message, which is where a PUT payload starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::{Result, TransportError};
use crate::message::{Message, Operation};

/// Receives decoded inbound messages.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Test operations and text messages.
    async fn handle_control(&self, message: Message);

    /// File operations. `payload` is positioned right after the message.
    async fn handle_file(&self, message: Message, payload: &mut (dyn AsyncRead + Send + Unpin));
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    accepted: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl DispatchStats {
    /// Connections accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Messages routed to the handler.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Connections that produced no usable message.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Running inbound listener.
pub struct Dispatcher {
    local_port: u16,
    cancel: CancellationToken,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Starts accepting on `listener`. Both tasks stop when `cancel` fires.
    pub fn spawn(
        listener: TcpListener,
        handler: Arc<dyn InboundHandler>,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
        let stats = Arc::new(DispatchStats::default());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(
            listener,
            tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));
        tokio::spawn(dispatch_loop(
            rx,
            handler,
            read_timeout,
            Arc::clone(&stats),
            cancel.clone(),
        ));
        tracing::info!(port = local_port, "listening for inbound messages");

        Self {
            local_port,
            cancel,
            stats,
        }
    }

    /// Port actually bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Stops accepting and dispatching.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<(TcpStream, String)>,
    stats: Arc<DispatchStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);
                    if tx.send((stream, peer.to_string())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<(TcpStream, String)>,
    handler: Arc<dyn InboundHandler>,
    read_timeout: Duration,
    stats: Arc<DispatchStats>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let mut reader = BufReader::new(stream);
        match dispatch_one(&mut reader, &peer, handler.as_ref(), read_timeout).await {
            Ok(true) => {
                stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(peer = %peer, error = %e, "discarding inbound connection");
            }
        }
    }
    tracing::debug!("dispatch loop stopped");
}

/// Decodes one message from `reader` and routes it.
///
/// Returns `Ok(false)` for a connection that closed before a complete message
/// or carried an operation this side does not handle.
pub async fn dispatch_one<R>(
    reader: &mut R,
    peer: &str,
    handler: &dyn InboundHandler,
    read_timeout: Duration,
) -> Result<bool>
where
    R: AsyncBufRead + Send + Unpin,
{
    let decoded = tokio::time::timeout(read_timeout, codec::decode(reader))
        .await
        .map_err(|_| TransportError::ReadTimeout {
            peer: peer.to_string(),
            timeout_ms: read_timeout.as_millis() as u64,
        })??;

    let Some(message) = decoded else {
        tracing::debug!(peer = %peer, "connection closed before a complete message");
        return Ok(false);
    };
    tracing::debug!(
        peer = %peer,
        sender = %message.sender,
        kind = message.kind().as_str(),
        test = message.test_id().unwrap_or("-"),
        "inbound message"
    );

    match &message.operation {
        Operation::Test(_) | Operation::Text(_) => {
            handler.handle_control(message).await;
            Ok(true)
        }
        Operation::File(_) => {
            handler.handle_file(message, reader).await;
            Ok(true)
        }
        Operation::Product(_) | Operation::Registry(_) => {
            tracing::debug!(kind = message.kind().as_str(), "operation not handled by clients");
            Ok(false)
        }
    }
}
