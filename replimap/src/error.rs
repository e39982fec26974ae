//! Error types for replimap operations.

use replimap_types::{ChannelId, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("segment {segment} is full ({capacity} entries)")]
    CapacityExceeded { segment: usize, capacity: usize },

    #[error("key of {len} bytes exceeds the maximum of {max}")]
    KeyTooLarge { len: usize, max: usize },

    #[error("value of {len} bytes exceeds the maximum of {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("channel {0} is already bound")]
    ChannelAlreadyBound(ChannelId),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("modification log backlog exceeded {limit} records")]
    BacklogOverflow { limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error("closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::ProtocolViolation(err.to_string())
    }
}
