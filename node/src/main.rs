use std::path::PathBuf;

use clap::Parser;
use replimap::{ChannelId, Cluster, ClusterConfig, MapConfig, NodeId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

mod console;

use console::Command;

/// Runs one replication node with a line-oriented console on stdin.
#[derive(Parser, Debug)]
#[command(name = "replimap-node")]
struct Options {
    /// Node identifier, unique among the peers.
    #[arg(long)]
    node: u8,

    /// Address to accept peers on.
    #[arg(long)]
    listen: Option<String>,

    /// Peer to dial. May be repeated.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Channel to create. May be repeated.
    #[arg(long = "channel", default_values_t = [1u16])]
    channels: Vec<u16>,

    /// Directory holding one file-backed map per channel.
    #[arg(long)]
    data: Option<PathBuf>,
}

impl Options {
    fn map_config(&self, channel: u16) -> MapConfig {
        let config = MapConfig::new();
        match &self.data {
            Some(dir) => config.with_file(dir.join(format!("channel-{}.rmap", channel))),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let options = Options::parse();
    let node = NodeId(options.node);

    if let Some(dir) = &options.data {
        std::fs::create_dir_all(dir)?;
    }

    let cluster = Cluster::new(ClusterConfig::new(node))?;
    for channel in &options.channels {
        cluster.create_channel(ChannelId(*channel), options.map_config(*channel))?;
    }
    if let Some(addr) = &options.listen {
        cluster.listen(addr.as_str()).await?;
    }
    for peer in &options.peers {
        cluster.connect(peer.as_str())?;
    }
    info!(node = %node, channels = ?options.channels, "node ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => match command.execute(&cluster) {
                        Ok(reply) => println!("{}", reply),
                        Err(err) => println!("error: {}", err),
                    },
                    Err(message) => println!("error: {}", message),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    for channel in cluster.channels() {
        if let Some(map) = cluster.channel(channel) {
            map.close()?;
        }
    }
    cluster.close().await;
    Ok(())
}
