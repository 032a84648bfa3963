use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised by the relay server, its workers and the client.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The server options are not usable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Binding or listening on the configured address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed to accept a connection.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The client could not reach the server.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The served file could not be opened.
    #[error("failed to open {}: {source}", .path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write: {0}")]
    Write(#[source] io::Error),

    #[error("operation timed out")]
    Timeout,

    /// The transfer was ended by server shutdown.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("worker pool queue is full")]
    PoolFull,

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Returns true if the error ends the whole server rather than one worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Config(_) | RelayError::Bind { .. } | RelayError::Accept(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
