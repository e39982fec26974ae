//! Replay of one channel's Modification Logs to one peer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use replimap_types::{ChannelId, Frame, Timestamp};
use tracing::{debug, trace};

use crate::error::Error;
use crate::map::MapCore;
use crate::modlog::PeerToken;
use crate::mux::ChannelMux;
use crate::store::ReplicationRecord;

static NEXT_PEER_TOKEN: AtomicU64 = AtomicU64::new(1);

struct SegmentCursor {
    cursor: u64,
    /// Log end at attach time; bootstrap covers everything before it.
    target: u64,
    resync: VecDeque<ReplicationRecord>,
    acknowledged: u64,
}

/// A sweep over every segment that started when the local clock read `through`.
struct Pass {
    through: Timestamp,
    drained: Vec<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainStatus {
    /// Every segment is caught up.
    Idle,
    /// The budget ran out with records left.
    More,
}

/// Sends a channel's local mutations to a peer: first everything newer than
/// the peer's bootstrap timestamp, then new records as they are appended.
pub(crate) struct ChannelOutbound {
    channel: ChannelId,
    map: Arc<MapCore>,
    peer: PeerToken,
    since: Timestamp,
    segments: Vec<SegmentCursor>,
    pass: Option<Pass>,
    last_checkpoint: Timestamp,
    bootstrapping: bool,
}

impl ChannelOutbound {
    pub(crate) fn new(channel: ChannelId, map: Arc<MapCore>, since: Timestamp) -> Self {
        let peer = NEXT_PEER_TOKEN.fetch_add(1, Ordering::Relaxed);
        let segments: Vec<_> = map
            .store()
            .attach_peer(peer, since)
            .into_iter()
            .map(|start| SegmentCursor {
                cursor: start.cursor,
                target: start.target,
                resync: start.resync.into(),
                acknowledged: start.cursor,
            })
            .collect();

        debug!(
            channel = %channel,
            since,
            backlog = segments
                .iter()
                .map(|s| (s.target - s.cursor) as usize + s.resync.len())
                .sum::<usize>(),
            "attached channel to peer"
        );

        Self {
            channel,
            map,
            peer,
            since,
            segments,
            pass: None,
            last_checkpoint: since,
            bootstrapping: true,
        }
    }

    pub(crate) fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// Appends up to `budget` data frames to `out`, plus a checkpoint once a
    /// full pass over every segment has completed.
    pub(crate) fn drain(&mut self, budget: usize, out: &mut Vec<Frame>) -> Result<DrainStatus, Error> {
        let store = self.map.store();
        let local = self.map.node();
        let pass = self.pass.get_or_insert_with(|| Pass {
            through: self.map.clock().peek(),
            drained: vec![false; self.segments.len()],
        });

        let mut budget = budget;
        for (index, segment) in self.segments.iter_mut().enumerate() {
            if pass.drained[index] {
                continue;
            }
            if budget == 0 {
                break;
            }

            while budget > 0 {
                let Some(record) = segment.resync.pop_front() else {
                    break;
                };
                out.push(ChannelMux::route_outbound(self.channel, record));
                budget -= 1;
            }
            if !segment.resync.is_empty() {
                break;
            }

            let batch = store.read_log(index, segment.cursor, self.since, budget)?;
            budget -= batch.records.len();
            segment.cursor = batch.next_cursor;
            out.extend(
                batch
                    .records
                    .into_iter()
                    .map(|record| ChannelMux::route_outbound(self.channel, record)),
            );
            if batch.caught_up {
                pass.drained[index] = true;
            } else {
                break;
            }
        }

        if self.bootstrapping
            && self
                .segments
                .iter()
                .all(|s| s.resync.is_empty() && s.cursor >= s.target)
        {
            self.bootstrapping = false;
        }

        if !pass.drained.iter().all(|drained| *drained) {
            return Ok(DrainStatus::More);
        }

        if pass.through > self.last_checkpoint {
            trace!(channel = %self.channel, through = pass.through, "checkpoint");
            out.push(Frame::checkpoint(self.channel, pass.through, local));
            self.last_checkpoint = pass.through;
        }
        self.pass = None;
        Ok(DrainStatus::Idle)
    }

    /// Lets the logs reclaim what has been written to the socket.
    pub(crate) fn acknowledge(&mut self) -> Result<(), Error> {
        let store = self.map.store();
        for (index, segment) in self.segments.iter_mut().enumerate() {
            if segment.cursor > segment.acknowledged {
                store.acknowledge_peer(index, self.peer, segment.cursor)?;
                segment.acknowledged = segment.cursor;
            }
        }
        Ok(())
    }
}

impl Drop for ChannelOutbound {
    fn drop(&mut self) {
        self.map.store().detach_peer(self.peer);
    }
}
