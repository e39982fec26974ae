use std::fmt;

/// Identifies the replica a mutation originated on.
///
/// Node identifiers are assigned externally and must be unique among the
/// peers of a cluster. They double as the tie-breaker when two mutations of
/// the same key carry equal timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u8);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// Multiplexing id binding one map to a shared connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ChannelId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;

/// Bootstrap timestamp declared by a replica that has never heard from a peer.
pub const NEVER_SYNCED: Timestamp = 0;
