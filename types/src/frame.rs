use crate::codec::WireError;
use crate::ids::{ChannelId, NodeId, Timestamp};

/// What a [`Frame`] carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Heartbeat = 0,
    Identifier = 1,
    BootstrapTimestamp = 2,
    Put = 3,
    Remove = 4,
    Checkpoint = 5,
}

/// A single record on a replication connection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(uint32, tag = "1")]
    pub channel: u32,
    #[prost(enumeration = "RecordKind", tag = "2")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub value: Option<Vec<u8>>,
    #[prost(uint64, tag = "5")]
    pub timestamp: u64,
    #[prost(uint32, tag = "6")]
    pub origin: u32,
}

impl Frame {
    fn control(kind: RecordKind, channel: ChannelId, timestamp: Timestamp, origin: NodeId) -> Self {
        Self {
            channel: u32::from(channel.0),
            kind: kind as i32,
            key: Vec::new(),
            value: None,
            timestamp,
            origin: u32::from(origin.0),
        }
    }

    pub fn heartbeat(origin: NodeId) -> Self {
        Self::control(RecordKind::Heartbeat, ChannelId(0), 0, origin)
    }

    pub fn identifier(origin: NodeId) -> Self {
        Self::control(RecordKind::Identifier, ChannelId(0), 0, origin)
    }

    /// Declares the newest timestamp this side has seen from the peer on
    /// `channel`; the peer replays everything newer.
    pub fn bootstrap(channel: ChannelId, last_known: Timestamp, origin: NodeId) -> Self {
        Self::control(RecordKind::BootstrapTimestamp, channel, last_known, origin)
    }

    /// Announces that every record from `origin` on `channel` with a timestamp
    /// up to and including `through` precedes this frame on the stream.
    pub fn checkpoint(channel: ChannelId, through: Timestamp, origin: NodeId) -> Self {
        Self::control(RecordKind::Checkpoint, channel, through, origin)
    }

    pub fn put(
        channel: ChannelId,
        key: Vec<u8>,
        value: Vec<u8>,
        timestamp: Timestamp,
        origin: NodeId,
    ) -> Self {
        Self {
            channel: u32::from(channel.0),
            kind: RecordKind::Put as i32,
            key,
            value: Some(value),
            timestamp,
            origin: u32::from(origin.0),
        }
    }

    pub fn remove(channel: ChannelId, key: Vec<u8>, timestamp: Timestamp, origin: NodeId) -> Self {
        Self {
            channel: u32::from(channel.0),
            kind: RecordKind::Remove as i32,
            key,
            value: None,
            timestamp,
            origin: u32::from(origin.0),
        }
    }

    /// Checks the frame is well formed and returns its kind.
    pub fn validate(&self) -> Result<RecordKind, WireError> {
        let kind = RecordKind::try_from(self.kind).map_err(|_| WireError::UnknownKind(self.kind))?;

        if self.origin > u32::from(u8::MAX) {
            return Err(WireError::Invalid("origin does not fit a node identifier"));
        }
        if self.channel > u32::from(u16::MAX) {
            return Err(WireError::Invalid("channel does not fit a channel identifier"));
        }

        match kind {
            RecordKind::Put => {
                if self.value.is_none() {
                    return Err(WireError::Invalid("put without a value"));
                }
            }
            RecordKind::Remove => {
                if self.value.is_some() {
                    return Err(WireError::Invalid("remove carrying a value"));
                }
            }
            RecordKind::Heartbeat
            | RecordKind::Identifier
            | RecordKind::BootstrapTimestamp
            | RecordKind::Checkpoint => {
                if !self.key.is_empty() || self.value.is_some() {
                    return Err(WireError::Invalid("control frame carrying a payload"));
                }
            }
        }

        Ok(kind)
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.channel as u16)
    }

    pub fn origin_id(&self) -> NodeId {
        NodeId(self.origin as u8)
    }
}
