#![warn(missing_docs)]

//! Test farm client transport: line-oriented wire codec, retrying outbound channels,
//! inbound dispatcher, test lifecycle tracking and file transfer

pub mod channel;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod listener;
pub mod message;
pub mod registry;
pub mod retry;
pub mod tcp;
pub mod transfer;
pub mod types;

pub use client::FarmClient;
pub use config::ClientConfig;
pub use error::{Result, TransportError};
pub use listener::{FileSink, FileStream, TestListener};
pub use message::{Message, Operation};
pub use types::{Address, Test, TestStatus};
