//! Immutable configuration for maps and clusters.
//!
//! Both structs are plain values assembled with the `with_*` helpers and
//! validated once when a map or cluster is constructed from them.

use std::path::PathBuf;
use std::time::Duration;

use replimap_types::{NodeId, DEFAULT_MAX_FRAME_LEN};

use crate::error::Error;

const MAX_SEGMENTS: usize = 1 << 16;
const MAX_ENTRIES_PER_SEGMENT: usize = (u32::MAX - 1) as usize;

/// Layout and replication options of a single map.
#[derive(Clone, Debug)]
pub struct MapConfig {
    pub segments: usize,
    pub entries_per_segment: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub replicated: bool,
    pub log: LogConfig,
    /// Tombstones older than this may be purged when their segment fills up.
    /// `None` keeps them until [`crate::ReplicatedMap::purge_tombstones`].
    pub tombstone_retention: Option<Duration>,
    /// Backing file; anonymous memory when `None`.
    pub path: Option<PathBuf>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            segments: 16,
            entries_per_segment: 1024,
            max_key_size: 128,
            max_value_size: 1024,
            replicated: true,
            log: LogConfig::default(),
            tombstone_retention: None,
            path: None,
        }
    }
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_entries_per_segment(mut self, entries: usize) -> Self {
        self.entries_per_segment = entries;
        self
    }

    /// Sizes segments to hold `total` entries across the current segment
    /// count, with 50% headroom for uneven hashing.
    pub fn with_entries(mut self, total: usize) -> Self {
        let per_segment = total.div_ceil(self.segments.max(1)).max(1);
        self.entries_per_segment = per_segment + per_segment.div_ceil(2);
        self
    }

    pub fn with_max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    pub fn with_max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    pub fn replicated(mut self, replicated: bool) -> Self {
        self.replicated = replicated;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = Some(retention);
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Total number of entry slots.
    pub fn capacity(&self) -> usize {
        self.segments * self.entries_per_segment
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.segments == 0 || self.segments > MAX_SEGMENTS {
            return Err(Error::InvalidConfig(format!(
                "segments must be between 1 and {}, got {}",
                MAX_SEGMENTS, self.segments
            )));
        }
        if self.entries_per_segment == 0 || self.entries_per_segment > MAX_ENTRIES_PER_SEGMENT {
            return Err(Error::InvalidConfig(format!(
                "entries per segment must be between 1 and {}, got {}",
                MAX_ENTRIES_PER_SEGMENT, self.entries_per_segment
            )));
        }
        if self.max_key_size > usize::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "max key size {} exceeds {}",
                self.max_key_size,
                u16::MAX
            )));
        }
        if self.max_value_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max value size {} exceeds {}",
                self.max_value_size,
                u32::MAX
            )));
        }
        if let Some(0) = self.log.backlog_limit {
            return Err(Error::InvalidConfig("backlog limit must be positive".into()));
        }
        Ok(())
    }
}

/// How long Modification Log records are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogRetention {
    /// Never reclaim records; the log grows with every local mutation.
    #[default]
    RetainAll,
    /// Reclaim the prefix every attached peer has acknowledged.
    ReclaimAcknowledged,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub retention: LogRetention,
    /// Records a segment's log may hold before lagging peers are cut off
    /// with [`Error::BacklogOverflow`].
    pub backlog_limit: Option<usize>,
}

impl LogConfig {
    pub fn reclaim_acknowledged() -> Self {
        Self {
            retention: LogRetention::ReclaimAcknowledged,
            backlog_limit: None,
        }
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = Some(limit);
        self
    }
}

/// Options shared by every connection of a cluster.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub heartbeat_interval: Duration,
    /// A connection silent for this many heartbeat intervals is declared dead.
    pub heartbeat_timeout_multiple: u32,
    pub reconnect: ReconnectPolicy,
    pub socket: SocketOptions,
    pub max_frame_len: usize,
    /// Upper bound on records drained from one channel before yielding.
    pub drain_batch: usize,
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout_multiple: 3,
            reconnect: ReconnectPolicy::default(),
            socket: SocketOptions::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            drain_batch: 1024,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout_multiple(mut self, multiple: u32) -> Self {
        self.heartbeat_timeout_multiple = multiple;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_drain_batch(mut self, records: usize) -> Self {
        self.drain_batch = records;
        self
    }

    /// Silence after which a connection is torn down.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_multiple
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat interval must be positive".into()));
        }
        if self.heartbeat_timeout_multiple < 2 {
            return Err(Error::InvalidConfig(format!(
                "heartbeat timeout multiple must be at least 2, got {}",
                self.heartbeat_timeout_multiple
            )));
        }
        if self.max_frame_len < 64 {
            return Err(Error::InvalidConfig(format!(
                "max frame length {} is too small",
                self.max_frame_len
            )));
        }
        if self.drain_batch == 0 {
            return Err(Error::InvalidConfig("drain batch must be positive".into()));
        }
        if self.reconnect.initial_backoff.is_zero()
            || self.reconnect.max_backoff < self.reconnect.initial_backoff
        {
            return Err(Error::InvalidConfig(
                "reconnect backoff must be positive and capped above its initial value".into(),
            ));
        }
        Ok(())
    }
}

/// Redial behaviour for peers added with [`crate::Cluster::connect`].
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    /// Dial again after an established session ends.
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub ttl: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            ttl: None,
        }
    }
}
