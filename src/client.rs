use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    common::{with_timeout, TimeoutOptions, DEFAULT_BUFFER_SIZE},
    error::{RelayError, Result},
};

/// The client side of the relay.
///
/// Connects, sends nothing and reads until the server closes the connection,
/// which marks the end of the file.
#[derive(Debug, Clone, Default)]
pub struct FileRelayClient {
    /// Options for the timeout of the connection
    timeout_options: TimeoutOptions,
}

impl FileRelayClient {
    pub fn new(timeout_options: TimeoutOptions) -> Self {
        Self { timeout_options }
    }

    /// Receive the whole file into memory.
    pub async fn fetch(&self, addr: &str) -> Result<Bytes> {
        let mut stream = self.connect(addr).await?;
        let mut received = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        loop {
            let n = with_timeout(self.timeout_options.read_timeout, async {
                stream.read_buf(&mut received).await.map_err(RelayError::Read)
            })
            .await?;
            if n == 0 {
                break;
            }
            if received.capacity() == received.len() {
                received.reserve(DEFAULT_BUFFER_SIZE);
            }
        }
        debug!(addr, bytes = received.len(), "Connection closed by server");
        Ok(received.freeze())
    }

    /// Stream the file into `writer`, returning the number of bytes received.
    pub async fn fetch_to<W>(&self, addr: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.connect(addr).await?;
        let mut buffer = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = with_timeout(self.timeout_options.read_timeout, async {
                stream.read(&mut buffer).await.map_err(RelayError::Read)
            })
            .await?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(RelayError::Write)?;
            total += n as u64;
        }
        writer.flush().await.map_err(RelayError::Write)?;
        debug!(addr, bytes = total, "Connection closed by server");
        Ok(total)
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = with_timeout(self.timeout_options.connect_timeout, async {
            TcpStream::connect(addr)
                .await
                .map_err(|source| RelayError::Connect {
                    addr: addr.to_string(),
                    source,
                })
        })
        .await?;
        debug!(addr, "Connected");
        Ok(stream)
    }
}
