//! Shared fixtures: a scripted peer that records what the client sends, and a
//! listener that records lifecycle events.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use testfarm_client::codec;
use testfarm_client::tcp::TcpTransport;
use testfarm_client::{Address, ClientConfig, Message, Test, TestListener};

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short timers and an ephemeral loopback port.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        bind_host: "127.0.0.1".to_string(),
        listen_port: 0,
        advertised_host: Some("127.0.0.1".to_string()),
        retry_attempts: 3,
        retry_backoff_ms: 10,
        connect_timeout_ms: 500,
        read_timeout_ms: 2_000,
        idle_check_ms: 60_000,
        ..Default::default()
    }
}

/// One message received by a [`FakePeer`], with any bytes that followed it.
#[derive(Debug, Clone)]
pub struct Received {
    pub message: Message,
    pub payload: Vec<u8>,
}

/// A TCP peer standing in for a scheduling service or a test node.
pub struct FakePeer {
    address: Address,
    rx: mpsc::UnboundedReceiver<Received>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let Ok(Some(message)) = codec::decode(&mut reader).await else {
                        return;
                    };
                    let mut payload = Vec::new();
                    let _ = reader.read_to_end(&mut payload).await;
                    let _ = tx.send(Received { message, payload });
                });
            }
        });
        Self {
            address: Address::new("127.0.0.1", port),
            rx,
            task,
        }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// Next received message, failing the test after [`WAIT`].
    pub async fn next(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("peer stopped")
    }

    /// Next message matching `pred`, skipping others.
    pub async fn next_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Received {
        loop {
            let received = self.next().await;
            if pred(&received.message) {
                return received;
            }
        }
    }

    /// Asserts nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(received)) = tokio::time::timeout(quiet, self.rx.recv()).await {
            panic!("unexpected message: {:?}", received.message);
        }
    }

    /// Stops accepting; later connections are refused.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Sends `message` to `to` from this peer's address.
    pub async fn send(&self, mut message: Message, to: &Address) {
        message.sender = self.address();
        message.receiver = to.clone();
        TcpTransport::default().send(&message).await.unwrap();
    }

    /// Sends `message` followed by `payload`.
    pub async fn send_with_payload(&self, mut message: Message, to: &Address, payload: &[u8]) {
        message.sender = self.address();
        message.receiver = to.clone();
        let mut payload = payload;
        TcpTransport::default()
            .send_with_payload(&message, &mut payload)
            .await
            .unwrap();
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Finished(String),
    Failed(String, String),
    Message(String, String),
}

/// Listener recording every callback in order.
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    async fn record(&self, event: Event) {
        self.events.lock().await.push(event.clone());
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl TestListener for RecordingListener {
    async fn test_started(&self, test: &Test) {
        self.record(Event::Started(test.id().to_string())).await;
    }

    async fn test_finished(&self, test: &Test) {
        self.record(Event::Finished(test.id().to_string())).await;
    }

    async fn test_failed(&self, test: &Test, reason: &str) {
        self.record(Event::Failed(test.id().to_string(), reason.to_string()))
            .await;
    }

    async fn message(&self, test: &Test, text: &str) {
        self.record(Event::Message(test.id().to_string(), text.to_string()))
            .await;
    }
}

/// Next listener event, failing the test after [`WAIT`].
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a listener event")
        .expect("listener dropped")
}

/// A port nothing listens on.
pub async fn refused_address() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", port)
}
