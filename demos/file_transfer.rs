use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sliding_window::config::{ChannelConfig, LinkConfig};
use sliding_window::connection::Listener;
use sliding_window::stream::ArqStream;
use tracing::{info, Level};

/// Transfers a file over the sliding window protocol, optionally on a deliberately unreliable
///  channel
#[derive(Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    link: LinkArgs,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Sends a file to a receiving endpoint
    Send {
        to: SocketAddr,
        file: PathBuf,
    },
    /// Waits for a sender and writes whatever it sends to a file
    Receive {
        bind: SocketAddr,
        #[clap(long, default_value = "filecopy")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct LinkArgs {
    /// ignored by the receiving side, which uses the sender's window size
    #[clap(long, default_value_t = 8)]
    window_size: u32,
    #[clap(long, default_value_t = 1024)]
    packet_size: usize,
    #[clap(long, default_value_t = 500)]
    timeout_millis: u64,
    #[clap(long, default_value_t = 50)]
    ack_delay_millis: u64,

    #[clap(long, default_value_t = 0)]
    drop_percent: u8,
    #[clap(long, default_value_t = 0)]
    damage_percent: u8,
    #[clap(long, default_value_t = 0)]
    delay_percent: u8,
    #[clap(long, default_value_t = 0)]
    pacing_millis: u64,
    #[clap(long)]
    seed: Option<u64>,
}

impl LinkArgs {
    fn to_config(&self) -> anyhow::Result<LinkConfig> {
        let data_timeout = Duration::from_millis(self.timeout_millis);
        let config = LinkConfig {
            window_size: self.window_size,
            packet_size: self.packet_size,
            data_timeout,
            ack_delay: Duration::from_millis(self.ack_delay_millis),
            max_retransmissions: None,
            linger: 2 * data_timeout,
            channel: ChannelConfig {
                drop_percent: self.drop_percent,
                damage_percent: self.damage_percent,
                delay_percent: self.delay_percent,
                pacing_delay: Duration::from_millis(self.pacing_millis),
                seed: self.seed,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match (cli.verbose, cli.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = Arc::new(cli.link.to_config()?);

    match cli.command {
        Command::Send { to, file } => send(config, to, file).await,
        Command::Receive { bind, out } => receive(config, bind, out).await,
    }
}

async fn send(config: Arc<LinkConfig>, to: SocketAddr, file: PathBuf) -> anyhow::Result<()> {
    let data = tokio::fs::read(&file).await
        .with_context(|| format!("reading {:?}", file))?;

    let start = Instant::now();
    let mut stream = ArqStream::connect(config, to).await?;
    info!("sending {} bytes from {:?} to {:?}", data.len(), file, to);

    stream.write(&data).await?;
    stream.close().await?;

    info!("sent {} bytes in {:?}", data.len(), start.elapsed());
    Ok(())
}

async fn receive(config: Arc<LinkConfig>, bind: SocketAddr, out: PathBuf) -> anyhow::Result<()> {
    let listener = Listener::bind(config, bind).await?;
    info!("waiting for a sender on {:?}", listener.local_addr()?);

    let mut stream = ArqStream::accept(listener).await?;
    let peer_addr = stream.connection().peer_addr();
    let start = Instant::now();
    let data = stream.read_to_end().await?;
    stream.close().await?;

    tokio::fs::write(&out, &data).await
        .with_context(|| format!("writing {:?}", out))?;
    info!("received {} bytes from {:?} in {:?}, written to {:?}", data.len(), peer_addr, start.elapsed(), out);
    Ok(())
}
