use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::watch, time::timeout};

use crate::error::{RelayError, Result};

/// Default bind host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default bind port.
pub const DEFAULT_PORT: u16 = 9001;
/// Default chunk size for one read/write cycle.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default file streamed to every client.
pub const DEFAULT_FILE_PATH: &str = "dmtcp_restart_script.sh";
/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;
/// Default number of concurrent transfers.
pub const DEFAULT_MAX_WORKERS: usize = 64;
/// Default number of accepted connections waiting for a worker.
pub const DEFAULT_MAX_PENDING: usize = 1024;
/// Default time in-flight transfers get to finish on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Options for the timeout of a connection.
///
/// `None` means the operation may block indefinitely.
#[derive(Debug, Clone, Default)]
pub struct TimeoutOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Startup configuration of the relay server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind, resolved to an IPv4 address.
    pub host: String,
    /// Port to bind, 0 picks an ephemeral port.
    pub port: u16,
    /// Maximum bytes per read/write cycle.
    pub buffer_size: usize,
    /// The file sent to every client.
    pub file_path: PathBuf,
    pub backlog: u32,
    /// Number of transfers running at the same time.
    pub max_workers: usize,
    /// Accepted connections queued for a free worker.
    pub max_pending: usize,
    /// Time in-flight transfers get to finish before they are cancelled.
    pub shutdown_grace: Duration,
    pub timeout_options: TimeoutOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            file_path: PathBuf::from(DEFAULT_FILE_PATH),
            backlog: DEFAULT_BACKLOG,
            max_workers: DEFAULT_MAX_WORKERS,
            max_pending: DEFAULT_MAX_PENDING,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            timeout_options: TimeoutOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Create options serving `file_path` on `host:port`, other fields default.
    pub fn new(host: impl Into<String>, port: u16, file_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            file_path: file_path.into(),
            ..Self::default()
        }
    }

    /// The `host:port` string handed to the resolver.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the options before anything is bound.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RelayError::Config("host must not be empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(RelayError::Config(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(RelayError::Config(
                "max_workers must be greater than zero".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(RelayError::Config(
                "max_pending must be greater than zero".to_string(),
            ));
        }
        if self.backlog == 0 {
            return Err(RelayError::Config(
                "backlog must be greater than zero".to_string(),
            ));
        }
        if self.file_path.as_os_str().is_empty() {
            return Err(RelayError::Config("file_path must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Create a linked shutdown trigger and signal.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Fires a shutdown that every linked [`ShutdownSignal`] observes.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Fire the shutdown. Firing twice is harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new signal linked to this trigger.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Waits for a [`ShutdownTrigger`] to fire.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the shutdown has been triggered.
    ///
    /// If every trigger is dropped without firing, this never resolves.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run `fut`, failing with [`RelayError::Timeout`] once `limit` elapses.
pub(crate) async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut).await.map_err(|_| RelayError::Timeout)?,
        None => fut.await,
    }
}
