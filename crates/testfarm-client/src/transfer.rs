//! File transfer: PUT payload sources, PUT reception and re-GET accounting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, TransportError};
use crate::listener::{FileSink, FileStream, TestListener};
use crate::message::FileOperation;
use crate::types::validate_file_name;

/// Content of a file to PUT, resolved at send time.
///
/// The listener is asked first; the filesystem is the fallback. A stream
/// opened ahead of time is used for the first attempt only, retries reopen.
pub struct FileSource {
    listener: Option<Arc<dyn TestListener>>,
    directory: PathBuf,
    name: String,
    opened: Mutex<Option<FileStream>>,
    unavailable: AtomicBool,
}

impl FileSource {
    /// A source for `name` under `directory`.
    pub fn new(
        listener: Option<Arc<dyn TestListener>>,
        directory: impl Into<PathBuf>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            listener,
            directory: directory.into(),
            name: name.into(),
            opened: Mutex::new(None),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Directory the file lives in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the last open found nothing.
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    /// Opens the content and keeps it for the first send.
    pub async fn prefetch(&self) -> Result<()> {
        let stream = self.resolve().await?;
        if let Ok(mut slot) = self.opened.lock() {
            *slot = Some(stream);
        }
        Ok(())
    }

    /// Returns the prefetched stream, or opens a new one.
    pub async fn open(&self) -> Result<FileStream> {
        let cached = self.opened.lock().ok().and_then(|mut slot| slot.take());
        match cached {
            Some(stream) => Ok(stream),
            None => self.resolve().await,
        }
    }

    async fn resolve(&self) -> Result<FileStream> {
        let resolved = self.lookup().await;
        self.unavailable.store(resolved.is_none(), Ordering::Relaxed);
        resolved.ok_or_else(|| TransportError::FileUnavailable {
            directory: self.directory.display().to_string(),
            name: self.name.clone(),
        })
    }

    async fn lookup(&self) -> Option<FileStream> {
        if let Err(e) = validate_file_name(&self.name) {
            tracing::warn!(error = %e, "refusing file source");
            return None;
        }
        if let Some(listener) = &self.listener {
            if let Some(stream) = listener.read_file(&self.directory, &self.name).await {
                return Some(stream);
            }
        }
        let path = self.directory.join(&self.name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "file source unavailable");
                return None;
            }
        };
        let metadata = file.metadata().await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(FileStream {
            reader: Box::new(file),
            size: Some(metadata.len()),
        })
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("directory", &self.directory)
            .field("name", &self.name)
            .finish()
    }
}

/// Result of reading a PUT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Where the bytes went; `None` when the listener supplied the sink.
    pub destination: Option<PathBuf>,
    /// Bytes actually received.
    pub received: u64,
    /// Size the sender declared.
    pub declared: Option<u64>,
}

impl ReceiveReport {
    /// True when the received byte count matches the declared size.
    /// Transfers of unknown size are always complete.
    pub fn is_complete(&self) -> bool {
        match self.declared {
            Some(declared) => declared == self.received,
            None => true,
        }
    }
}

/// Reads the payload following a PUT header into its destination.
///
/// Bytes are copied in `chunk_size` pieces until the sender closes the
/// connection. Each read is bounded by `read_timeout`.
pub async fn receive_file<R>(
    reader: &mut R,
    op: &FileOperation,
    workspace: &Path,
    listener: Option<&dyn TestListener>,
    chunk_size: usize,
    read_timeout: Duration,
) -> Result<ReceiveReport>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let directory = op.file.directory(workspace)?;
    let supplied = match listener {
        Some(listener) => listener.create_file(&directory, &op.file.name).await,
        None => None,
    };
    let (mut sink, destination): (FileSink, Option<PathBuf>) = match supplied {
        Some(sink) => (sink, None),
        None => {
            let path = directory.join(&op.file.name);
            tokio::fs::create_dir_all(&directory).await?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let file = tokio::fs::File::create(&path).await?;
            (Box::new(file), Some(path))
        }
    };

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received = 0u64;
    loop {
        let n = tokio::time::timeout(read_timeout, reader.read(&mut buf))
            .await
            .map_err(|_| TransportError::ReadTimeout {
                peer: format!("PUT {}", op.file.name),
                timeout_ms: read_timeout.as_millis() as u64,
            })??;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    sink.flush().await?;
    sink.shutdown().await?;

    Ok(ReceiveReport {
        destination,
        received,
        declared: op.file.size,
    })
}

/// What to do after a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegetDecision {
    /// Ask for the file again; carries the attempt number.
    Retry(u32),
    /// The re-GET budget is spent.
    GiveUp,
}

/// Counts re-GETs per (test, file).
#[derive(Debug, Default)]
pub struct RegetTracker {
    max: u32,
    counts: HashMap<(String, String), u32>,
}

impl RegetTracker {
    /// Allows `max` re-GETs per file.
    pub fn new(max: u32) -> Self {
        Self {
            max,
            counts: HashMap::new(),
        }
    }

    /// Records a failed transfer.
    pub fn record_failure(&mut self, test_id: &str, name: &str) -> RegetDecision {
        let key = (test_id.to_string(), name.to_string());
        let count = self.counts.entry(key.clone()).or_insert(0);
        if *count >= self.max {
            self.counts.remove(&key);
            return RegetDecision::GiveUp;
        }
        *count += 1;
        RegetDecision::Retry(*count)
    }

    /// Forgets a file after a complete transfer or an ABORT.
    pub fn clear(&mut self, test_id: &str, name: &str) {
        self.counts.remove(&(test_id.to_string(), name.to_string()));
    }

    /// Forgets every file of a test.
    pub fn clear_test(&mut self, test_id: &str) {
        self.counts.retain(|(test, _), _| test != test_id);
    }

    /// Re-GETs issued so far for a file.
    pub fn count(&self, test_id: &str, name: &str) -> u32 {
        self.counts
            .get(&(test_id.to_string(), name.to_string()))
            .copied()
            .unwrap_or(0)
    }
}
