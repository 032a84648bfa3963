use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{lookup_host, TcpListener, TcpSocket},
    task,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    common::{shutdown_channel, ServerOptions, ShutdownSignal, ShutdownTrigger},
    error::{RelayError, Result},
    transfer::{FileTransferJob, RelayStats, StatsSnapshot, TransferOptions},
    workerpool::WorkerPool,
};

/// The file relay server.
///
/// Every accepted connection is handed to a bounded worker pool which streams
/// the configured file to it and closes it.
pub struct FileRelayServer {
    options: ServerOptions,
    stats: Arc<RelayStats>,
    local_addr: Option<SocketAddr>,
    /// Accept loop task, set by `listen`.
    main_worker: Option<task::JoinHandle<Result<()>>>,
    worker_pool: Option<Arc<WorkerPool>>,
    /// Stops the accept loop.
    shutdown: ShutdownTrigger,
    /// Cancels transfers still running after the shutdown grace period.
    cancel: ShutdownTrigger,
}

impl FileRelayServer {
    /// Create a new server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let (shutdown, _) = shutdown_channel();
        let (cancel, _) = shutdown_channel();
        Ok(Self {
            options,
            stats: Arc::new(RelayStats::default()),
            local_addr: None,
            main_worker: None,
            worker_pool: None,
            shutdown,
            cancel,
        })
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// A handle that stops the accept loop from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Bind the configured address and start accepting connections.
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        if self.main_worker.is_some() {
            return Err(RelayError::Config("server is already listening".to_string()));
        }
        // The shutdown trigger stays fired, a new accept loop would exit at once.
        if self.shutdown.is_triggered() {
            return Err(RelayError::Config("server has been stopped".to_string()));
        }

        let listener = bind_listener(&self.options).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, file = %self.options.file_path.display(), "Listening");

        let worker_pool = Arc::new(WorkerPool::new(
            self.options.max_workers,
            self.options.max_pending,
        ));
        let transfer_options = Arc::new(TransferOptions {
            file_path: self.options.file_path.clone(),
            buffer_size: self.options.buffer_size,
            write_timeout: self.options.timeout_options.write_timeout,
        });

        let handle = tokio::spawn(accept_loop(
            listener,
            worker_pool.clone(),
            transfer_options,
            self.stats.clone(),
            self.shutdown.subscribe(),
            self.cancel.subscribe(),
        ));

        self.local_addr = Some(local_addr);
        self.worker_pool = Some(worker_pool);
        self.main_worker = Some(handle);
        Ok(local_addr)
    }

    /// Wait for the accept loop to end, then drain the worker pool.
    ///
    /// Queued and running transfers get `shutdown_grace` to finish before they
    /// are cancelled. An accept failure is returned once the pool is drained.
    pub async fn wait(&mut self) -> Result<()> {
        let accept_res = match self.main_worker.take() {
            Some(handle) => match handle.await {
                Ok(res) => res,
                Err(err) => {
                    error!("Accept loop aborted: {}", err);
                    Err(RelayError::Accept(io::Error::other(err)))
                }
            },
            None => Ok(()),
        };

        if let Some(pool) = self.worker_pool.take() {
            pool.close();
            let grace = self.options.shutdown_grace;
            if timeout(grace, pool.join()).await.is_err() {
                warn!(?grace, "Transfers still running after grace period, cancelling");
                self.cancel.trigger();
                pool.join().await;
            }
        }
        info!(stats = ?self.stats.snapshot(), "Server stopped");

        accept_res
    }

    /// Stop accepting connections and wait for the transfers to drain.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.trigger();
        self.wait().await
    }
}

impl Drop for FileRelayServer {
    fn drop(&mut self) {
        if let Some(handle) = self.main_worker.take() {
            handle.abort();
        }
    }
}

/// Resolve the host to IPv4 and listen on it with address reuse enabled.
async fn bind_listener(options: &ServerOptions) -> Result<TcpListener> {
    let bind_addr = options.bind_addr();
    let bind_err = |source| RelayError::Bind {
        addr: bind_addr.clone(),
        source,
    };

    let addr = lookup_host(&bind_addr)
        .await
        .map_err(bind_err)?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| RelayError::Config(format!("no IPv4 address for {}", bind_addr)))?;

    let socket = TcpSocket::new_v4().map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(options.backlog).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    worker_pool: Arc<WorkerPool>,
    transfer_options: Arc<TransferOptions>,
    stats: Arc<RelayStats>,
    mut shutdown: ShutdownSignal,
    cancel: ShutdownSignal,
) -> Result<()> {
    loop {
        debug!("Waiting for incoming connections...");
        let (stream, peer) = tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => accepted.map_err(|err| {
                error!("Failed to accept connection: {}", err);
                RelayError::Accept(err)
            })?,
        };
        info!(%peer, "Got connection");
        stats.record_accepted();

        let job = FileTransferJob::new(
            stream,
            peer,
            transfer_options.clone(),
            stats.clone(),
            cancel.clone(),
        );
        // Waits while the pool queue is full.
        tokio::select! {
            _ = shutdown.triggered() => {
                // The job is dropped unstarted, closing the connection.
                stats.record_failed();
                break;
            }
            res = worker_pool.submit_job(Box::new(job)) => res?,
        }
    }
    info!("Listener stopped");
    Ok(())
}
