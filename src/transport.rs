//! Byte-stream transport over a Unix-domain or TCP socket.
//!
//! No protocol knowledge lives here: the transport moves bytes and nothing
//! else. One read and one write may be outstanding concurrently; a second
//! call of the same kind queues FIFO behind the first (the per-direction
//! `tokio::sync::Mutex` hands the lock out in submission order).

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::config::ControlAddress;
use crate::error::{Result, TorError};

const READ_BUF_SIZE: usize = 4096;

enum ReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
}

enum WriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
}

/// A connected byte stream to the daemon's control port.
pub struct Transport {
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
}

impl Transport {
    /// Connect over TCP.
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(ReadHalf::Tcp(read)),
            writer: Mutex::new(WriteHalf::Tcp(write)),
        })
    }

    /// Connect over a Unix-domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", path.display(), e)))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(ReadHalf::Unix(read)),
            writer: Mutex::new(WriteHalf::Unix(write)),
        })
    }

    /// Connect to the given control address.
    pub async fn connect(address: &ControlAddress) -> Result<Self> {
        match address {
            ControlAddress::Tcp { host, port } => Self::connect_tcp(host, *port).await,
            #[cfg(unix)]
            ControlAddress::Unix(path) => Self::connect_unix(path).await,
            #[cfg(not(unix))]
            ControlAddress::Unix(path) => Err(TorError::NotSupported(format!(
                "unix socket {} on this platform",
                path.display()
            ))),
        }
    }

    /// Read the next chunk of bytes, suspending until data arrives.
    ///
    /// Returns [`TorError::ConnectionClosed`] when the peer closed the
    /// stream, distinct from other I/O errors.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = match &mut *reader {
            ReadHalf::Tcp(r) => r.read(&mut buf).await?,
            #[cfg(unix)]
            ReadHalf::Unix(r) => r.read(&mut buf).await?,
        };
        if n == 0 {
            return Err(TorError::ConnectionClosed);
        }
        buf.truncate(n);
        trace!(bytes = n, "transport read");
        Ok(buf)
    }

    /// Write all of `bytes`, returning the number written.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            WriteHalf::Tcp(w) => {
                w.write_all(bytes).await?;
                w.flush().await?;
            }
            #[cfg(unix)]
            WriteHalf::Unix(w) => {
                w.write_all(bytes).await?;
                w.flush().await?;
            }
        }
        trace!(bytes = bytes.len(), "transport write");
        Ok(bytes.len())
    }

    /// Shut down the write side, signalling the peer we are done.
    ///
    /// Errors are ignored: the socket may already be gone, and close must
    /// be idempotent.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = match &mut *writer {
            WriteHalf::Tcp(w) => w.shutdown().await,
            #[cfg(unix)]
            WriteHalf::Unix(w) => w.shutdown().await,
        };
    }
}
