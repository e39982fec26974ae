//! Line-oriented commands read from standard input.

use std::fmt::Write as _;

use replimap::{ChannelId, Cluster, Error};

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Put { channel: ChannelId, key: String, value: String },
    Get { channel: ChannelId, key: String },
    Remove { channel: ChannelId, key: String },
    Size { channel: ChannelId },
    Peers,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or_else(|| "empty command".to_string())?;

        let mut channel = || -> Result<ChannelId, String> {
            let word = words.next().ok_or("missing channel")?;
            word.parse::<u16>()
                .map(ChannelId)
                .map_err(|_| format!("invalid channel: {}", word))
        };

        let command = match name {
            "put" => {
                let channel = channel()?;
                let key = words.next().ok_or("missing key")?.to_string();
                let value = words.collect::<Vec<_>>().join(" ");
                Command::Put { channel, key, value }
            }
            "get" => {
                let channel = channel()?;
                let key = words.next().ok_or("missing key")?.to_string();
                Command::Get { channel, key }
            }
            "remove" => {
                let channel = channel()?;
                let key = words.next().ok_or("missing key")?.to_string();
                Command::Remove { channel, key }
            }
            "size" => Command::Size { channel: channel()? },
            "peers" => Command::Peers,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(command)
    }

    /// Runs the command against `cluster` and renders the reply.
    pub fn execute(&self, cluster: &Cluster) -> Result<String, Error> {
        let map = |channel: ChannelId| cluster.channel(channel).ok_or(Error::ChannelNotFound(channel));

        let reply = match self {
            Command::Put { channel, key, value } => {
                map(*channel)?.put(key, value)?;
                "ok".to_string()
            }
            Command::Get { channel, key } => match map(*channel)?.get(key)? {
                Some(value) => String::from_utf8_lossy(&value).into_owned(),
                None => "(none)".to_string(),
            },
            Command::Remove { channel, key } => {
                if map(*channel)?.remove(key)? {
                    "removed".to_string()
                } else {
                    "(none)".to_string()
                }
            }
            Command::Size { channel } => map(*channel)?.len()?.to_string(),
            Command::Peers => {
                let mut out = String::new();
                for info in cluster.connections() {
                    let _ = writeln!(out, "#{} {} {}", info.id, info.peer_addr, info.state);
                }
                if out.is_empty() {
                    out.push_str("(no connections)");
                }
                out.trim_end().to_string()
            }
            Command::Quit => String::new(),
        };
        Ok(reply)
    }
}
