//! Channel id to map bindings over a shared connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use replimap_types::{ChannelId, Frame, RecordKind};

use crate::error::Error;
use crate::map::MapCore;
use crate::store::ReplicationRecord;

/// Maps channel ids to the maps bound to them.
///
/// The cluster keeps one for the channels it has created; every connection
/// keeps its own for the channels attached to it.
#[derive(Default)]
pub(crate) struct ChannelMux {
    bindings: BTreeMap<ChannelId, Arc<MapCore>>,
}

impl ChannelMux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&mut self, channel: ChannelId, map: Arc<MapCore>) -> Result<(), Error> {
        if self.bindings.contains_key(&channel) {
            return Err(Error::ChannelAlreadyBound(channel));
        }
        self.bindings.insert(channel, map);
        Ok(())
    }

    pub(crate) fn unbind(&mut self, channel: ChannelId) -> Result<Arc<MapCore>, Error> {
        self.bindings
            .remove(&channel)
            .ok_or(Error::ChannelNotFound(channel))
    }

    pub(crate) fn get(&self, channel: ChannelId) -> Option<&Arc<MapCore>> {
        self.bindings.get(&channel)
    }

    pub(crate) fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.bindings.keys().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ChannelId, &Arc<MapCore>)> + '_ {
        self.bindings.iter().map(|(channel, map)| (*channel, map))
    }

    pub(crate) fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Wraps a local record into a frame tagged with `channel`.
    pub(crate) fn route_outbound(channel: ChannelId, record: ReplicationRecord) -> Frame {
        match record.value {
            Some(value) => Frame::put(channel, record.key, value, record.timestamp, record.origin),
            None => Frame::remove(channel, record.key, record.timestamp, record.origin),
        }
    }

    /// Unwraps a data frame into its channel, bound map and record.
    ///
    /// Returns `Ok(None)` for frames on channels that are not bound here.
    pub(crate) fn route_inbound(
        &self,
        frame: Frame,
    ) -> Result<Option<(ChannelId, Arc<MapCore>, ReplicationRecord)>, Error> {
        let kind = frame.validate()?;
        if !matches!(kind, RecordKind::Put | RecordKind::Remove) {
            return Err(Error::ProtocolViolation(format!(
                "{:?} frame routed as data",
                kind
            )));
        }

        let channel = frame.channel_id();
        let Some(map) = self.bindings.get(&channel) else {
            return Ok(None);
        };
        let origin = frame.origin_id();
        let record = ReplicationRecord {
            key: frame.key,
            value: frame.value,
            timestamp: frame.timestamp,
            origin,
        };
        Ok(Some((channel, Arc::clone(map), record)))
    }
}
