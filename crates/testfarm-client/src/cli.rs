//! The `tfarm` command line.

use crate::client::FarmClient;
use crate::config::ClientConfig;
use crate::listener::TestListener;
use crate::message::{Message, TestOperationCode};
use crate::types::{Address, Test};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Command line of the `tfarm` binary.
#[derive(Parser)]
#[command(name = "tfarm")]
#[command(about = "Test farm client", long_about = None)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Submit a test and follow it until it completes.
    Submit {
        /// Scheduling service, as host:port.
        #[arg(short, long, env = "TFARM_SERVICE")]
        service: Address,
        /// Test description (JSON).
        #[arg(short, long)]
        test: PathBuf,
        /// Client configuration (.toml or .json).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the START message for a test in wire form.
    Encode {
        /// Receiver written into the message.
        #[arg(short, long, default_value = "localhost:9000")]
        service: Address,
        /// Test description (JSON).
        #[arg(short, long)]
        test: PathBuf,
    },
}

/// Final state of a test followed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No terminal event yet.
    Running,
    /// The test finished or was stopped.
    Finished,
    /// The test failed, with the reason.
    Failed(String),
}

/// Logs lifecycle events and publishes the outcome.
pub struct LoggingListener {
    outcome: watch::Sender<Outcome>,
}

impl LoggingListener {
    /// A listener and the receiver its outcome is published on.
    pub fn new() -> (Self, watch::Receiver<Outcome>) {
        let (tx, rx) = watch::channel(Outcome::Running);
        (Self { outcome: tx }, rx)
    }
}

#[async_trait]
impl TestListener for LoggingListener {
    async fn test_started(&self, test: &Test) {
        tracing::info!(test = test.id(), "test started");
    }

    async fn test_finished(&self, test: &Test) {
        tracing::info!(test = test.id(), status = test.status.as_str(), "test finished");
        let _ = self.outcome.send(Outcome::Finished);
    }

    async fn test_failed(&self, test: &Test, reason: &str) {
        tracing::error!(test = test.id(), reason, "test failed");
        let _ = self.outcome.send(Outcome::Failed(reason.to_string()));
    }

    async fn message(&self, test: &Test, text: &str) {
        for line in text.lines() {
            println!("[{}] {}", test.id(), line);
        }
    }
}

/// Reads a JSON test description.
pub fn load_test(path: &Path) -> Result<Test> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading test description {}", path.display()))?;
    let test: Test = serde_json::from_str(&contents)
        .with_context(|| format!("parsing test description {}", path.display()))?;
    Ok(test)
}

impl Cli {
    /// Runs the command; returns false when the test did not succeed.
    pub async fn run(self) -> Result<bool> {
        match self.command {
            Command::Submit {
                service,
                test,
                config,
            } => submit(service, &test, config.as_deref()).await,
            Command::Encode { service, test } => {
                let test = load_test(&test)?;
                let message = Message::test(
                    Address::new(ClientConfig::default().advertised_host(), 0),
                    service,
                    TestOperationCode::Start,
                    test,
                );
                print!("{}", message.encode());
                Ok(true)
            }
        }
    }
}

async fn submit(service: Address, test: &Path, config: Option<&Path>) -> Result<bool> {
    let config = match config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    let test = load_test(test)?;

    let client = FarmClient::start(config).await?;
    let (listener, mut outcome) = LoggingListener::new();
    if let Err(e) = client.submit(test, Arc::new(listener), service).await {
        client.shutdown().await;
        return Err(e).context("submitting test");
    }

    let result = loop {
        if *outcome.borrow() != Outcome::Running {
            break outcome.borrow().clone();
        }
        if outcome.changed().await.is_err() {
            break Outcome::Failed("client stopped".to_string());
        }
    };
    client.shutdown().await;
    Ok(result == Outcome::Finished)
}
