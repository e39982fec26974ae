//! A segmented off-heap key-value map with peer-to-peer replication.
//!
//! `replimap` stores byte keys and values in fixed-stride slots inside memory
//! mappings (anonymous, or file-backed so a restarted node resumes where it
//! stopped). The table is split into segments, each with its own lock and its
//! own log of local mutations. A [`Cluster`] streams those logs to peers over
//! TCP and applies what peers send back under last-write-wins, ordered by
//! timestamp and then by node id.
//!
//! # Features
//!
//! - Fixed capacity, no resizing, no eviction
//! - Per-segment locking; operations on different segments never contend
//! - Many maps multiplexed over one connection, each on its own channel
//! - Catch-up after reconnect from the peer's last checkpoint
//! - Heartbeats and automatic redial with exponential backoff
//!
//! # Example
//!
//! ```no_run
//! use replimap::{ChannelId, Cluster, ClusterConfig, MapConfig, NodeId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let a = Cluster::new(ClusterConfig::new(NodeId(1)))?;
//!     let addr = a.listen("127.0.0.1:0").await?;
//!
//!     let b = Cluster::new(ClusterConfig::new(NodeId(2)))?;
//!     b.connect(addr)?;
//!
//!     let left = a.create_channel(ChannelId(1), MapConfig::new())?;
//!     let right = b.create_channel(ChannelId(1), MapConfig::new())?;
//!
//!     left.put("key", "value")?;
//!     // ...some time later
//!     assert_eq!(right.get("key")?, Some(b"value".to_vec()));
//!
//!     a.close().await;
//!     b.close().await;
//!     Ok(())
//! }
//! ```

mod clock;
mod cluster;
mod config;
mod error;
mod map;
mod modlog;
mod mux;
mod protocol;
mod store;

pub use cluster::{Cluster, ConnectionInfo, PeerAddr};
pub use config::{ClusterConfig, LogConfig, LogRetention, MapConfig, ReconnectPolicy, SocketOptions};
pub use error::Error;
pub use map::ReplicatedMap;
pub use protocol::ConnectionState;
pub use replimap_types::{ChannelId, NodeId, Timestamp, NEVER_SYNCED};
pub use store::EntryMetadata;
