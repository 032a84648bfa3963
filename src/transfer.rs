use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    common::{with_timeout, ShutdownSignal},
    error::{RelayError, Result},
    workerpool::Job,
};

/// Lifecycle of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    OpenFile,
    Streaming,
    Closed,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub chunks: u64,
}

/// Streams one file to one writer in chunks of at most `buffer_size` bytes.
pub struct FileTransfer<W> {
    path: PathBuf,
    writer: W,
    buffer_size: usize,
    write_timeout: Option<Duration>,
    state: TransferState,
}

impl<W> FileTransfer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(path: impl Into<PathBuf>, writer: W, buffer_size: usize) -> Self {
        Self {
            path: path.into(),
            writer,
            buffer_size: buffer_size.max(1),
            write_timeout: None,
            state: TransferState::OpenFile,
        }
    }

    /// Bound every chunk write. `None` lets a stalled peer block forever.
    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Consume the transfer, returning the writer.
    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Open the file and copy it to the writer until end-of-file, then shut the
    /// writer down. The state ends in `Closed` whether or not this succeeds.
    pub async fn run(&mut self) -> Result<TransferSummary> {
        let res = self.stream().await;
        self.state = TransferState::Closed;
        res
    }

    async fn stream(&mut self) -> Result<TransferSummary> {
        self.state = TransferState::OpenFile;
        let mut file = File::open(&self.path)
            .await
            .map_err(|source| RelayError::OpenFile {
                path: self.path.clone(),
                source,
            })?;

        self.state = TransferState::Streaming;
        let mut summary = TransferSummary::default();
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let n = file.read(&mut buffer).await.map_err(RelayError::Read)?;
            if n == 0 {
                break;
            }
            let writer = &mut self.writer;
            with_timeout(self.write_timeout, async {
                writer.write_all(&buffer[..n]).await.map_err(RelayError::Write)
            })
            .await?;
            summary.bytes += n as u64;
            summary.chunks += 1;
            debug!(chunk = summary.chunks, len = n, "Sent chunk");
        }

        let writer = &mut self.writer;
        with_timeout(self.write_timeout, async {
            writer.shutdown().await.map_err(RelayError::Write)
        })
        .await?;
        Ok(summary)
    }
}

/// Server-wide transfer counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_sent: u64,
}

impl RelayStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, summary: &TransferSummary) {
        self.bytes_sent.fetch_add(summary.bytes, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Settings shared by every transfer job of one server.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub file_path: PathBuf,
    pub buffer_size: usize,
    pub write_timeout: Option<Duration>,
}

/// The pool job serving one accepted connection.
pub struct FileTransferJob {
    stream: TcpStream,
    peer: SocketAddr,
    options: Arc<TransferOptions>,
    stats: Arc<RelayStats>,
    cancel: ShutdownSignal,
}

impl FileTransferJob {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        options: Arc<TransferOptions>,
        stats: Arc<RelayStats>,
        cancel: ShutdownSignal,
    ) -> Self {
        Self {
            stream,
            peer,
            options,
            stats,
            cancel,
        }
    }
}

#[async_trait]
impl Job for FileTransferJob {
    async fn run(self: Box<Self>) {
        let FileTransferJob {
            stream,
            peer,
            options,
            stats,
            mut cancel,
        } = *self;
        debug!(%peer, "Transfer started");

        let mut transfer = FileTransfer::new(options.file_path.clone(), stream, options.buffer_size)
            .with_write_timeout(options.write_timeout);
        let res = tokio::select! {
            res = transfer.run() => res,
            _ = cancel.triggered() => Err(RelayError::Cancelled),
        };

        match res {
            Ok(summary) => {
                stats.record_completed(&summary);
                info!(
                    %peer,
                    bytes = summary.bytes,
                    chunks = summary.chunks,
                    "Transfer completed"
                );
            }
            Err(err) => {
                stats.record_failed();
                warn!(%peer, "Transfer failed: {}", err);
            }
        }
        // Dropping the transfer closes the connection.
    }
}
