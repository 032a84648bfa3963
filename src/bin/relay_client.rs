use std::{
    error::Error,
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::Parser;
use file_relay::{
    client::FileRelayClient,
    common::{TimeoutOptions, DEFAULT_HOST, DEFAULT_PORT},
    logging::init_logging,
};
use tokio::{fs::File, io};
use tracing::info;

/// Receive the file served by relay-server.
#[derive(Debug, Parser)]
#[command(name = "relay-client", version)]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Where to write the received bytes, stdout if omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Give up if the server sends nothing for this many seconds.
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let client = FileRelayClient::new(TimeoutOptions {
        connect_timeout: cli.connect_timeout_secs.map(Duration::from_secs),
        read_timeout: cli.read_timeout_secs.map(Duration::from_secs),
        write_timeout: None,
    });
    let addr = format!("{}:{}", cli.host, cli.port);

    let start = Instant::now();
    let received = match &cli.output {
        Some(path) => {
            let mut file = File::create(path).await?;
            client.fetch_to(&addr, &mut file).await?
        }
        None => client.fetch_to(&addr, &mut io::stdout()).await?,
    };
    info!(
        bytes = received,
        elapsed = ?start.elapsed(),
        "Received file"
    );

    Ok(())
}
