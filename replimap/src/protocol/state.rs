//! Lifecycle of a single peer connection.

use std::collections::BTreeSet;
use std::fmt;

use replimap_types::{ChannelId, NodeId};

use crate::error::Error;

/// Where a connection is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket being dialed or just accepted.
    Connecting,
    /// Own identifier sent, waiting for the peer's.
    Handshake,
    /// Replaying backlog for the listed channels.
    Bootstrap {
        remote: NodeId,
        pending: BTreeSet<ChannelId>,
    },
    /// Streaming new records as they are written.
    SteadyState { remote: NodeId },
    Closed { reason: String },
}

/// Something that moves a connection between states.
#[derive(Clone, Debug)]
pub(crate) enum ConnectionEvent {
    Established,
    IdentifierReceived(NodeId),
    /// A channel started replaying its backlog to the peer.
    ChannelBootstrapping(ChannelId),
    /// A channel finished replaying, or was detached mid-replay.
    ChannelBootstrapped(ChannelId),
    Closed(String),
}

impl ConnectionState {
    /// Applies `event`, rejecting transitions the protocol does not allow.
    pub(crate) fn on_event(self, local: NodeId, event: ConnectionEvent) -> Result<Self, Error> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (S::Closed { reason }, _) => S::Closed { reason },
            (_, E::Closed(reason)) => S::Closed { reason },

            (S::Connecting, E::Established) => S::Handshake,

            (S::Handshake, E::IdentifierReceived(remote)) => {
                if remote == local {
                    return Err(Error::ProtocolViolation(format!(
                        "peer claims our own node id {}",
                        local
                    )));
                }
                S::Bootstrap {
                    remote,
                    pending: BTreeSet::new(),
                }
            }

            (S::Bootstrap { remote, mut pending }, E::ChannelBootstrapping(channel)) => {
                pending.insert(channel);
                S::Bootstrap { remote, pending }
            }
            (S::SteadyState { remote }, E::ChannelBootstrapping(channel)) => S::Bootstrap {
                remote,
                pending: BTreeSet::from([channel]),
            },

            (S::Bootstrap { remote, mut pending }, E::ChannelBootstrapped(channel)) => {
                pending.remove(&channel);
                S::Bootstrap { remote, pending }
            }
            (S::SteadyState { remote }, E::ChannelBootstrapped(_)) => S::SteadyState { remote },

            (state @ (S::Bootstrap { .. } | S::SteadyState { .. }), E::IdentifierReceived(_)) => {
                return Err(Error::ProtocolViolation(format!(
                    "identifier received again in {}",
                    state
                )));
            }

            (state, event) => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected {:?} in {}",
                    event, state
                )));
            }
        };

        Ok(next.settle())
    }

    /// A bootstrap with nothing pending is steady state.
    fn settle(self) -> Self {
        match self {
            Self::Bootstrap { remote, pending } if pending.is_empty() => {
                Self::SteadyState { remote }
            }
            other => other,
        }
    }

    pub fn remote(&self) -> Option<NodeId> {
        match self {
            Self::Bootstrap { remote, .. } | Self::SteadyState { remote } => Some(*remote),
            Self::Connecting | Self::Handshake | Self::Closed { .. } => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Handshake => f.write_str("handshake"),
            Self::Bootstrap { remote, pending } => {
                write!(f, "bootstrap with node {} ({} channels pending)", remote, pending.len())
            }
            Self::SteadyState { remote } => write!(f, "steady state with node {}", remote),
            Self::Closed { reason } => write!(f, "closed: {}", reason),
        }
    }
}
