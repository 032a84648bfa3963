use std::{path::PathBuf, process, time::Duration};

use clap::Parser;
use file_relay::{
    common::{
        ServerOptions, TimeoutOptions, DEFAULT_BACKLOG, DEFAULT_BUFFER_SIZE, DEFAULT_FILE_PATH,
        DEFAULT_HOST, DEFAULT_MAX_PENDING, DEFAULT_MAX_WORKERS, DEFAULT_PORT,
        DEFAULT_SHUTDOWN_GRACE,
    },
    logging::init_logging,
    server::FileRelayServer,
};
use tracing::{error, info};

/// Stream one file to every client that connects.
#[derive(Debug, Parser)]
#[command(name = "relay-server", version)]
struct Cli {
    /// Host to bind (IPv4).
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File sent to every client.
    #[arg(short, long, default_value = DEFAULT_FILE_PATH)]
    file: PathBuf,

    /// Bytes per read/write cycle.
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Transfers running at the same time.
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Accepted connections waiting for a free worker.
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING)]
    max_pending: usize,

    /// Seconds running transfers get to finish on shutdown.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    shutdown_grace_secs: u64,

    /// Give up on a peer that accepts no data for this many seconds.
    #[arg(long)]
    write_timeout_secs: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<Cli> for ServerOptions {
    fn from(cli: Cli) -> Self {
        ServerOptions {
            host: cli.host,
            port: cli.port,
            buffer_size: cli.buffer_size,
            file_path: cli.file,
            backlog: cli.backlog,
            max_workers: cli.max_workers,
            max_pending: cli.max_pending,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            timeout_options: TimeoutOptions {
                write_timeout: cli.write_timeout_secs.map(Duration::from_secs),
                ..TimeoutOptions::default()
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.verbose.max(1)) {
        eprintln!("{}", err);
        process::exit(1);
    }
    info!(version = env!("CARGO_PKG_VERSION"), "relay-server starting");

    let mut server = match FileRelayServer::new(cli.into()) {
        Ok(server) => server,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = server.listen().await {
        error!("{}", err);
        process::exit(1);
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.trigger();
        }
    });

    if let Err(err) = server.wait().await {
        error!("{}", err);
        process::exit(1);
    }
}
