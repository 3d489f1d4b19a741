//! Callbacks a submitter registers for one test.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::types::Test;

/// Readable file content supplied by a listener.
pub struct FileStream {
    /// The bytes to send.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Total size, when known up front.
    pub size: Option<u64>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream").field("size", &self.size).finish()
    }
}

/// Writable destination supplied by a listener.
pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives lifecycle events of a submitted test.
///
/// `test_started` fires at most once. Exactly one of `test_finished` or
/// `test_failed` fires when the test leaves the client.
#[async_trait]
pub trait TestListener: Send + Sync {
    /// The service reported the test as running.
    async fn test_started(&self, test: &Test);

    /// The test completed or was stopped.
    async fn test_finished(&self, test: &Test);

    /// The test failed, was rejected, or its service went away.
    async fn test_failed(&self, test: &Test, reason: &str);

    /// Free-form text addressed to the test.
    async fn message(&self, test: &Test, text: &str);

    /// Supplies the content of `name` in `directory` instead of the local
    /// filesystem. `None` falls back to the filesystem.
    async fn read_file(&self, _directory: &Path, _name: &str) -> Option<FileStream> {
        None
    }

    /// Supplies the destination for an incoming `name` in `directory`.
    /// `None` falls back to the filesystem.
    async fn create_file(&self, _directory: &Path, _name: &str) -> Option<FileSink> {
        None
    }
}
