//! Outbound message channels.
//!
//! A channel owns a FIFO queue and one worker task. The worker delivers each
//! queued message on a fresh connection, retrying with a fixed backoff, and
//! hands messages that exhaust their attempts to a [`FailureHandler`]. A
//! channel with an [`IdleProbe`] asks the probe for a message whenever its
//! queue stays empty for the idle period; a probe answering `None` stops the
//! channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::health::ContactHealth;
use crate::message::{FileOperationCode, Message, Operation};
use crate::retry::{RetryConfig, RetryExecutor, RetryOutcome};
use crate::tcp::TcpTransport;
use crate::transfer::FileSource;

/// A queued message, optionally followed by file content.
#[derive(Debug)]
pub struct Outbound {
    /// The message to deliver.
    pub message: Message,
    /// Content to stream after a PUT header.
    pub source: Option<FileSource>,
}

impl Outbound {
    /// A plain message.
    pub fn message(message: Message) -> Self {
        Self {
            message,
            source: None,
        }
    }

    /// A PUT message whose payload comes from `source`.
    pub fn with_source(message: Message, source: FileSource) -> Self {
        Self {
            message,
            source: Some(source),
        }
    }

    /// File operation code that actually went out. A PUT whose source
    /// could not be opened was sent as ABORT.
    pub fn sent_file_code(&self) -> Option<FileOperationCode> {
        let op = self.message.as_file()?;
        match &self.source {
            Some(source) if op.code == FileOperationCode::Put && source.is_unavailable() => {
                Some(FileOperationCode::Abort)
            }
            _ => Some(op.code),
        }
    }
}

/// Performs one delivery attempt.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Sends `item` on a fresh connection.
    async fn deliver(&self, item: &Outbound) -> Result<()>;
}

/// Called with a message whose attempts ran out.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// `item` could not be delivered; `error` is the last failure.
    async fn delivery_failed(&self, item: Outbound, error: TransportError);
}

/// Supplies a message when a channel has been idle.
#[async_trait]
pub trait IdleProbe: Send + Sync {
    /// Message to send after an idle period, or `None` to stop the channel.
    async fn probe(&self) -> Option<Message>;
}

/// Sends the encoded message and nothing else.
#[derive(Debug, Clone)]
pub struct MessageDeliverer {
    transport: TcpTransport,
}

impl MessageDeliverer {
    /// Delivers over `transport`.
    pub fn new(transport: TcpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Deliver for MessageDeliverer {
    async fn deliver(&self, item: &Outbound) -> Result<()> {
        self.transport.send(&item.message).await
    }
}

/// Sends file operations, streaming PUT content after the header.
///
/// A PUT whose source cannot be opened goes out as an ABORT for the same
/// file instead.
#[derive(Debug, Clone)]
pub struct FileDeliverer {
    transport: TcpTransport,
}

impl FileDeliverer {
    /// Delivers over `transport`.
    pub fn new(transport: TcpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Deliver for FileDeliverer {
    async fn deliver(&self, item: &Outbound) -> Result<()> {
        let (Some(source), Operation::File(op)) = (&item.source, &item.message.operation) else {
            return self.transport.send(&item.message).await;
        };
        if op.code != FileOperationCode::Put {
            return self.transport.send(&item.message).await;
        }

        let mut put = item.message.clone();
        match source.open().await {
            Ok(mut stream) => {
                if let Operation::File(op) = &mut put.operation {
                    op.file.size = stream.size;
                }
                let written = self
                    .transport
                    .send_with_payload(&put, &mut stream.reader)
                    .await?;
                tracing::debug!(file = source.name(), bytes = written, "PUT sent");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(file = source.name(), error = %e, "file vanished, sending ABORT");
                if let Operation::File(op) = &mut put.operation {
                    op.code = FileOperationCode::Abort;
                    op.file.size = None;
                }
                self.transport.send(&put).await
            }
        }
    }
}

/// Logs dropped messages and does nothing else.
#[derive(Debug, Clone)]
pub struct LogFailures {
    channel: String,
}

impl LogFailures {
    /// Handler for the named channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl FailureHandler for LogFailures {
    async fn delivery_failed(&self, item: Outbound, error: TransportError) {
        tracing::warn!(
            channel = %self.channel,
            receiver = %item.message.receiver,
            kind = item.message.kind().as_str(),
            error = %error,
            "message dropped"
        );
    }
}

/// Channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Name used in logs.
    pub name: String,
    /// Attempts and backoff per message.
    pub retry: RetryConfig,
    /// Idle period before the probe is consulted.
    pub idle_after: Duration,
}

impl ChannelConfig {
    /// Settings with default retry policy and a 900 s idle period.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryConfig::default(),
            idle_after: Duration::from_secs(900),
        }
    }
}

/// Counters of one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
    probes: AtomicU64,
}

impl ChannelStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    /// Messages accepted by `submit`.
    pub queued: u64,
    /// Messages delivered.
    pub delivered: u64,
    /// Delivery attempts that failed, including ones later retried.
    pub failed_attempts: u64,
    /// Messages handed to the failure handler.
    pub dropped: u64,
    /// Messages produced by the idle probe.
    pub probes: u64,
}

/// Handle to a running channel. Clones share the same worker.
#[derive(Clone)]
pub struct OutboundChannel {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    stats: Arc<ChannelStats>,
    health: Arc<ContactHealth>,
}

impl OutboundChannel {
    /// Starts a channel whose worker stops when `parent` is cancelled.
    pub fn spawn(
        config: ChannelConfig,
        deliverer: Arc<dyn Deliver>,
        on_failure: Arc<dyn FailureHandler>,
        probe: Option<Arc<dyn IdleProbe>>,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let stats = Arc::new(ChannelStats::default());
        let health = Arc::new(ContactHealth::new(config.retry.max_attempts));
        let name: Arc<str> = Arc::from(config.name.as_str());

        let worker = Worker {
            name: Arc::clone(&name),
            retry: RetryExecutor::new(config.retry),
            idle_after: config.idle_after,
            deliverer,
            on_failure,
            probe,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            health: Arc::clone(&health),
        };
        tokio::spawn(worker.run(rx));

        Self {
            name,
            tx,
            cancel,
            stats,
            health,
        }
    }

    /// Queues a message; never blocks.
    pub fn submit(&self, item: Outbound) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown(format!("channel {}", self.name)));
        }
        self.tx
            .send(item)
            .map_err(|_| TransportError::Shutdown(format!("channel {}", self.name)))?;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues a plain message.
    pub fn send(&self, message: Message) -> Result<()> {
        self.submit(Outbound::message(message))
    }

    /// Stops the worker. Queued messages are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// True until the channel is shut down or stops itself.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Waits until the worker has been told to stop.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery counters.
    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Contact health of the receiver(s).
    pub fn health(&self) -> &ContactHealth {
        &self.health
    }
}

impl std::fmt::Debug for OutboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundChannel")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

struct Worker {
    name: Arc<str>,
    retry: RetryExecutor,
    idle_after: Duration,
    deliverer: Arc<dyn Deliver>,
    on_failure: Arc<dyn FailureHandler>,
    probe: Option<Arc<dyn IdleProbe>>,
    cancel: CancellationToken,
    stats: Arc<ChannelStats>,
    health: Arc<ContactHealth>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        tracing::debug!(channel = %self.name, "channel worker started");
        let mut idle_deadline = Instant::now() + self.idle_after;

        loop {
            let deadline = idle_deadline;
            let probing = self.probe.is_some();
            let idle = async move {
                if probing {
                    tokio::time::sleep_until(deadline).await
                } else {
                    std::future::pending::<()>().await
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    self.process(item).await;
                    idle_deadline = Instant::now() + self.idle_after;
                }
                _ = idle => {
                    let Some(probe) = &self.probe else { continue };
                    match probe.probe().await {
                        Some(message) => {
                            self.stats.probes.fetch_add(1, Ordering::Relaxed);
                            self.process(Outbound::message(message)).await;
                        }
                        None => {
                            tracing::info!(channel = %self.name, "nothing left to watch, stopping");
                            self.cancel.cancel();
                            break;
                        }
                    }
                    idle_deadline = Instant::now() + self.idle_after;
                }
            }
        }

        tracing::debug!(channel = %self.name, "channel worker stopped");
    }

    async fn process(&self, item: Outbound) {
        let failures_before = self.health.failure_count();
        let outcome = self
            .retry
            .execute_with_health(&self.health, &self.cancel, || {
                self.deliverer.deliver(&item)
            })
            .await;
        let failed = self.health.failure_count().saturating_sub(failures_before);
        self.stats.failed_attempts.fetch_add(failed, Ordering::Relaxed);

        match outcome {
            RetryOutcome::Success(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(channel = %self.name, receiver = %item.message.receiver, "delivered");
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    channel = %self.name,
                    receiver = %item.message.receiver,
                    attempts,
                    error = %last_error,
                    "delivery failed"
                );
                self.on_failure.delivery_failed(item, last_error).await;
            }
            RetryOutcome::Cancelled => {
                tracing::debug!(channel = %self.name, "delivery cancelled");
            }
        }
    }
}
