//! Per-segment append-only record of local mutations.
//!
//! Every record is addressed by a sequence number that is never reused. Peers
//! read from a cursor (a sequence number) and acknowledge what they have
//! written to their socket; the log only reclaims a prefix once every attached
//! peer has acknowledged past it, or when the configured backlog limit forces
//! it to cut off a lagging peer.

use std::collections::{HashMap, VecDeque};

use replimap_types::{NodeId, Timestamp};
use tracing::warn;

use crate::config::{LogConfig, LogRetention};
use crate::error::Error;

/// Identifies one attached reader of the log.
pub(crate) type PeerToken = u64;

/// A local mutation: which slot changed, and the metadata it changed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LogRecord {
    pub slot: u32,
    pub timestamp: Timestamp,
    pub origin: NodeId,
    pub tombstone: bool,
}

#[derive(Debug)]
struct PeerCursor {
    acknowledged: u64,
    overflowed: bool,
}

#[derive(Debug)]
pub(crate) struct ModificationLog {
    records: VecDeque<LogRecord>,
    base: u64,
    /// Highest timestamp among reclaimed records, if any were reclaimed.
    reclaimed_through: Option<Timestamp>,
    peers: HashMap<PeerToken, PeerCursor>,
    config: LogConfig,
}

impl ModificationLog {
    pub(crate) fn new(config: LogConfig) -> Self {
        Self {
            records: VecDeque::new(),
            base: 0,
            reclaimed_through: None,
            peers: HashMap::new(),
            config,
        }
    }

    /// Appends `record` and returns its sequence number.
    pub(crate) fn append(&mut self, record: LogRecord) -> u64 {
        let seq = self.end();
        self.records.push_back(record);
        self.enforce_backlog_limit();
        if self.config.retention == LogRetention::ReclaimAcknowledged {
            self.reclaim_acknowledged();
        }
        seq
    }

    /// Sequence number of the oldest retained record.
    pub(crate) fn start(&self) -> u64 {
        self.base
    }

    /// Sequence number the next appended record will get.
    pub(crate) fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Records from `cursor` onwards, paired with their sequence numbers.
    ///
    /// Fails if records at `cursor` were already reclaimed.
    pub(crate) fn read_from(
        &self,
        cursor: u64,
    ) -> Result<impl Iterator<Item = (u64, LogRecord)> + '_, Error> {
        if cursor < self.base {
            return Err(Error::BacklogOverflow {
                limit: self.config.backlog_limit.unwrap_or_default(),
            });
        }
        let skip = ((cursor - self.base) as usize).min(self.records.len());
        Ok(self
            .records
            .range(skip..)
            .enumerate()
            .map(move |(i, record)| (cursor + i as u64, *record)))
    }

    /// Whether every record newer than `since` is still retained.
    pub(crate) fn retains_since(&self, since: Timestamp) -> bool {
        match self.reclaimed_through {
            None => true,
            Some(through) => through <= since,
        }
    }

    pub(crate) fn attach(&mut self, peer: PeerToken, at: u64) {
        self.peers.insert(
            peer,
            PeerCursor {
                acknowledged: at.max(self.base),
                overflowed: false,
            },
        );
    }

    /// Records that `peer` has consumed everything before `upto`.
    pub(crate) fn acknowledge(&mut self, peer: PeerToken, upto: u64) -> Result<(), Error> {
        let limit = self.config.backlog_limit.unwrap_or_default();
        let cursor = self.peers.get_mut(&peer).ok_or(Error::BacklogOverflow { limit })?;
        if cursor.overflowed {
            return Err(Error::BacklogOverflow { limit });
        }
        cursor.acknowledged = cursor.acknowledged.max(upto);

        if self.config.retention == LogRetention::ReclaimAcknowledged {
            self.reclaim_acknowledged();
        }
        Ok(())
    }

    pub(crate) fn detach(&mut self, peer: PeerToken) {
        self.peers.remove(&peer);
        if self.config.retention == LogRetention::ReclaimAcknowledged {
            self.reclaim_acknowledged();
        }
    }

    fn reclaim_acknowledged(&mut self) {
        let upto = self
            .peers
            .values()
            .filter(|cursor| !cursor.overflowed)
            .map(|cursor| cursor.acknowledged)
            .min()
            .unwrap_or_else(|| self.end());
        self.reclaim_before(upto);
    }

    fn enforce_backlog_limit(&mut self) {
        let Some(limit) = self.config.backlog_limit else {
            return;
        };
        if self.records.len() <= limit {
            return;
        }

        let cut = self.end() - limit as u64;
        for (peer, cursor) in self.peers.iter_mut() {
            if !cursor.overflowed && cursor.acknowledged < cut {
                cursor.overflowed = true;
                warn!(peer, limit, "peer fell behind the modification log backlog limit");
            }
        }
        self.reclaim_before(cut);
    }

    fn reclaim_before(&mut self, seq: u64) {
        while self.base < seq {
            let Some(record) = self.records.pop_front() else {
                break;
            };
            self.base += 1;
            self.reclaimed_through = Some(
                self.reclaimed_through
                    .map_or(record.timestamp, |through| through.max(record.timestamp)),
            );
        }
    }
}
