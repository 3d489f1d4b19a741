//! TCP transport: one connection per message.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::types::Address;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport: opens connections, binds listeners.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to `addr`.
    pub async fn connect(&self, addr: &Address) -> Result<TcpStream> {
        let target = addr.to_socket_addr_string();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target.as_str()))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: target.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: target.clone(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::debug!(addr = %addr, "TCP connected");
        Ok(stream)
    }

    /// Delivers one message on a fresh connection and closes it.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut stream = self.connect(&message.receiver).await?;
        stream.write_all(message.encode().as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Delivers a message followed by the raw bytes of `payload`.
    ///
    /// Returns the number of payload bytes written.
    pub async fn send_with_payload<R>(&self, message: &Message, payload: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut stream = self.connect(&message.receiver).await?;
        stream.write_all(message.encode().as_bytes()).await?;
        let written = tokio::io::copy(payload, &mut stream).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(written)
    }

    /// Binds a listener on `host`, probing upwards from `port`.
    ///
    /// Ports already in use are skipped, up to `probe_limit` further ports.
    /// Port 0 binds an ephemeral port without probing.
    pub async fn bind(&self, host: &str, port: u16, probe_limit: u16) -> Result<TcpListener> {
        if port == 0 {
            return Ok(TcpListener::bind((host, 0)).await?);
        }
        let mut last_error = None;
        for offset in 0..=probe_limit {
            let Some(candidate) = port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((host, candidate)).await {
                Ok(listener) => {
                    if offset > 0 {
                        tracing::info!(requested = port, bound = candidate, "listen port probed");
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    tracing::debug!(port = candidate, "port in use");
                    last_error = Some(e);
                }
                Err(e) => return Err(TransportError::IoError(e)),
            }
        }
        Err(TransportError::IoError(last_error.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrInUse, "no free port in probe range")
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::message::TestOperationCode;
    use crate::types::Test;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_send_and_decode() {
        let transport = TcpTransport::default();
        let listener = transport.bind("127.0.0.1", 0, 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            codec::decode(&mut reader).await.unwrap().unwrap()
        });

        let message = Message::test(
            Address::new("client", 5451),
            Address::new("127.0.0.1", port),
            TestOperationCode::Start,
            Test::new("T1").unwrap(),
        );
        transport.send(&message).await.unwrap();
        let received = server.await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_send_with_payload() {
        let transport = TcpTransport::default();
        let listener = transport.bind("127.0.0.1", 0, 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let message = codec::decode(&mut reader).await.unwrap().unwrap();
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await.unwrap();
            (message, rest)
        });

        let message = Message::test(
            Address::new("client", 5451),
            Address::new("127.0.0.1", port),
            TestOperationCode::Update,
            Test::new("T1").unwrap(),
        );
        let mut payload: &[u8] = b"hello";
        let written = transport
            .send_with_payload(&message, &mut payload)
            .await
            .unwrap();
        assert_eq!(written, 5);
        let (_, rest) = server.await.unwrap();
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = transport.bind("127.0.0.1", 0, 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = transport
            .connect(&Address::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_bind_probes_next_port() {
        let transport = TcpTransport::default();
        let first = transport.bind("127.0.0.1", 0, 0).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        if taken == u16::MAX {
            return;
        }
        let second = transport.bind("127.0.0.1", taken, 10).await.unwrap();
        assert_ne!(second.local_addr().unwrap().port(), taken);
    }
}
