//! Wire types shared by replimap nodes.
//!
//! Every replication connection carries a single stream of [`Frame`]s. Each
//! frame is a protobuf message prefixed with its varint-encoded length, so the
//! stream is self-delimiting and can be decoded incrementally with
//! [`FrameDecoder`] as bytes trickle in from the socket.
//!
//! # Frame kinds
//!
//! | Kind | Channel | Key | Value | Timestamp | Origin |
//! |---|---|---|---|---|---|
//! | `Heartbeat` | 0 | empty | absent | 0 | sender |
//! | `Identifier` | 0 | empty | absent | 0 | sender |
//! | `BootstrapTimestamp` | bound channel | empty | absent | last known | sender |
//! | `Put` | bound channel | key | value | mutation time | mutation origin |
//! | `Remove` | bound channel | key | absent | mutation time | mutation origin |
//! | `Checkpoint` | bound channel | empty | absent | drained through | sender |

mod codec;
mod frame;
mod ids;

pub use codec::{encode_frame, FrameDecoder, WireError, DEFAULT_MAX_FRAME_LEN};
pub use frame::{Frame, RecordKind};
pub use ids::{ChannelId, NodeId, Timestamp, NEVER_SYNCED};
