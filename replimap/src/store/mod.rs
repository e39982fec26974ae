//! Segmented off-heap hash table.
//!
//! Keys hash to one of a fixed number of segments. Each segment owns its own
//! memory mapping (a bucket array, fixed-stride entry slots and a free list)
//! and its own [`ModificationLog`], both behind a single reader-writer lock.
//! Nothing ever locks more than one segment at a time, and nothing outside
//! this module sees raw offsets: entries are addressed by segment index plus
//! slot index.

mod layout;
mod segment;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use replimap_types::{NodeId, Timestamp};
use tracing::{debug, info};
use twox_hash::xxh3;

use crate::clock::Clock;
use crate::config::MapConfig;
use crate::error::Error;
use crate::modlog::{LogRecord, ModificationLog, PeerToken};

use layout::Layout;
use segment::{SegmentTable, SlotState};

/// Timestamp, origin and tombstone flag of a stored entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMetadata {
    pub timestamp: Timestamp,
    pub origin: NodeId,
    pub tombstone: bool,
}

/// An entry as it travels between replicas. `value` is `None` for removals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReplicationRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Timestamp,
    pub origin: NodeId,
}

/// Last-write-wins: a later timestamp wins, equal timestamps go to the
/// higher node identifier.
pub(crate) fn supersedes(
    timestamp: Timestamp,
    origin: NodeId,
    current_timestamp: Timestamp,
    current_origin: NodeId,
) -> bool {
    (timestamp, origin) > (current_timestamp, current_origin)
}

pub(crate) struct Segment {
    state: RwLock<SegmentState>,
}

pub(crate) struct SegmentState {
    table: SegmentTable,
    log: Option<ModificationLog>,
}

/// Where a peer's replay of one segment begins.
#[derive(Debug)]
pub(crate) struct SegmentStart {
    pub cursor: u64,
    /// Log length when the peer attached; bootstrap is over once the cursor reaches it.
    pub target: u64,
    /// Entries recovered by scanning the segment when the log no longer covers the request.
    pub resync: Vec<ReplicationRecord>,
}

/// Records read from one segment's log.
#[derive(Debug, Default)]
pub(crate) struct LogBatch {
    pub records: Vec<ReplicationRecord>,
    pub next_cursor: u64,
    pub caught_up: bool,
}

pub(crate) struct SegmentedStore {
    layout: Layout,
    segments: Box<[Segment]>,
    header: Mutex<MmapMut>,
    node: NodeId,
    tombstone_retention: Option<Duration>,
    _file: Option<File>,
}

impl SegmentedStore {
    /// Creates the store described by `config`, reopening its backing file
    /// if one exists.
    pub(crate) fn open(config: &MapConfig, node: NodeId) -> Result<Self, Error> {
        config.validate()?;
        let layout = Layout::new(config)?;

        let (header, regions, file, reopened) = match &config.path {
            Some(path) => map_file(path, &layout, node)?,
            None => {
                let mut header = MmapMut::map_anon(layout.header_len())?;
                layout.write_header(&mut header, node);
                let regions = (0..layout.segments)
                    .map(|_| MmapMut::map_anon(layout.segment_len))
                    .collect::<Result<Vec<_>, _>>()?;
                (header, regions, None, false)
            }
        };

        let mut segments = Vec::with_capacity(layout.segments);
        for (index, region) in regions.into_iter().enumerate() {
            let mut table = SegmentTable::new(region, layout);
            let mut log = config.replicated.then(|| ModificationLog::new(config.log));

            if reopened {
                table.recount()?;
                if let Some(log) = log.as_mut() {
                    rebuild_log(&table, log, node);
                    debug!(segment = index, records = log.len(), "rebuilt modification log");
                }
            }

            segments.push(Segment {
                state: RwLock::new(SegmentState { table, log }),
            });
        }

        Ok(Self {
            layout,
            segments: segments.into_boxed_slice(),
            header: Mutex::new(header),
            node,
            tombstone_retention: config.tombstone_retention,
            _file: file,
        })
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout.segments * self.layout.entries
    }

    /// Segment index and in-segment hash for `key`.
    fn locate(&self, key: &[u8]) -> (usize, u32) {
        let hash = xxh3::hash64(key);
        let segment = ((hash >> 32) % self.segments.len() as u64) as usize;
        (segment, hash as u32)
    }

    fn check_sizes(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        if key.len() > self.layout.max_key {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: self.layout.max_key,
            });
        }
        if let Some(value) = value {
            if value.len() > self.layout.max_value {
                return Err(Error::ValueTooLarge {
                    len: value.len(),
                    max: self.layout.max_value,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (index, hash) = self.locate(key);
        let state = self.segments[index].state.read();
        let slot = state.table.find(hash, key)?;
        let entry = state.table.entry(slot);
        (entry.state == SlotState::Live).then(|| entry.value.to_vec())
    }

    pub(crate) fn contains_key(&self, key: &[u8]) -> bool {
        self.metadata(key).is_some_and(|meta| !meta.tombstone)
    }

    pub(crate) fn metadata(&self, key: &[u8]) -> Option<EntryMetadata> {
        let (index, hash) = self.locate(key);
        let state = self.segments[index].state.read();
        let slot = state.table.find(hash, key)?;
        let entry = state.table.entry(slot);
        Some(EntryMetadata {
            timestamp: entry.timestamp,
            origin: entry.origin,
            tombstone: entry.state == SlotState::Tombstone,
        })
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.state.read().table.live() as usize)
            .sum()
    }

    /// Copies out every live entry, segment by segment.
    pub(crate) fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = Vec::new();
        for segment in self.segments.iter() {
            let state = segment.state.read();
            for slot in state.table.occupied_slots() {
                let entry = state.table.entry(slot);
                if entry.state == SlotState::Live {
                    entries.push((entry.key.to_vec(), entry.value.to_vec()));
                }
            }
        }
        entries
    }

    /// Stores `value` under `key` as a local mutation.
    pub(crate) fn put(&self, key: &[u8], value: &[u8], clock: &Clock) -> Result<(), Error> {
        self.check_sizes(key, Some(value))?;
        let (index, hash) = self.locate(key);
        let mut guard = self.segments[index].state.write();
        let state = &mut *guard;

        let (slot, timestamp) = match state.table.find(hash, key) {
            Some(slot) => {
                let timestamp = clock.after(state.table.entry(slot).timestamp);
                state.table.update(slot, value, timestamp, self.node, false);
                (slot, timestamp)
            }
            None => {
                let timestamp = clock.now();
                let slot = self
                    .insert_or_purge(index, state, hash, key, value, timestamp, self.node, false, clock)
                    .ok_or(Error::CapacityExceeded {
                        segment: index,
                        capacity: self.layout.entries,
                    })?;
                (slot, timestamp)
            }
        };

        if let Some(log) = state.log.as_mut() {
            log.append(LogRecord {
                slot,
                timestamp,
                origin: self.node,
                tombstone: false,
            });
        }
        Ok(())
    }

    /// Removes `key` as a local mutation. Replicated stores keep a tombstone.
    pub(crate) fn remove(&self, key: &[u8], clock: &Clock) -> Result<bool, Error> {
        self.check_sizes(key, None)?;
        let (index, hash) = self.locate(key);
        let mut guard = self.segments[index].state.write();
        let state = &mut *guard;

        let Some(slot) = state.table.find(hash, key) else {
            return Ok(false);
        };
        let entry = state.table.entry(slot);
        if entry.state != SlotState::Live {
            return Ok(false);
        }

        match state.log.as_mut() {
            Some(log) => {
                let timestamp = clock.after(entry.timestamp);
                state.table.update(slot, &[], timestamp, self.node, true);
                log.append(LogRecord {
                    slot,
                    timestamp,
                    origin: self.node,
                    tombstone: true,
                });
            }
            None => state.table.erase(slot),
        }
        Ok(true)
    }

    /// Applies a mutation received from a peer if it wins last-write-wins.
    ///
    /// Never appends to the modification log.
    pub(crate) fn apply(&self, record: &ReplicationRecord, clock: &Clock) -> Result<bool, Error> {
        self.check_sizes(&record.key, record.value.as_deref())?;
        let (index, hash) = self.locate(&record.key);
        let mut guard = self.segments[index].state.write();
        let state = &mut *guard;

        let tombstone = record.value.is_none();
        let value = record.value.as_deref().unwrap_or_default();

        match state.table.find(hash, &record.key) {
            Some(slot) => {
                let entry = state.table.entry(slot);
                if !supersedes(record.timestamp, record.origin, entry.timestamp, entry.origin) {
                    return Ok(false);
                }
                state
                    .table
                    .update(slot, value, record.timestamp, record.origin, tombstone);
            }
            None => {
                let inserted = self.insert_or_purge(
                    index,
                    state,
                    hash,
                    &record.key,
                    value,
                    record.timestamp,
                    record.origin,
                    tombstone,
                    clock,
                );
                match inserted {
                    Some(_) => {}
                    // Nothing to delete, and no room to remember the deletion.
                    None if tombstone => return Ok(false),
                    None => {
                        return Err(Error::CapacityExceeded {
                            segment: index,
                            capacity: self.layout.entries,
                        })
                    }
                }
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_or_purge(
        &self,
        index: usize,
        state: &mut SegmentState,
        hash: u32,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
        origin: NodeId,
        tombstone: bool,
        clock: &Clock,
    ) -> Option<u32> {
        if let Some(slot) = state
            .table
            .insert(hash, key, value, timestamp, origin, tombstone)
        {
            return Some(slot);
        }

        let retention = self.tombstone_retention?;
        let cutoff = clock
            .now()
            .saturating_sub(retention.as_micros().min(u128::from(u64::MAX)) as u64);
        let purged = purge_segment(&mut state.table, cutoff);
        if purged > 0 {
            debug!(segment = index, purged, "purged expired tombstones to make room");
        }
        state
            .table
            .insert(hash, key, value, timestamp, origin, tombstone)
    }

    /// Reclaims tombstoned slots last written before `older_than`.
    pub(crate) fn purge_tombstones(&self, older_than: Timestamp) -> usize {
        self.segments
            .iter()
            .map(|segment| purge_segment(&mut segment.state.write().table, older_than))
            .sum()
    }

    /// Newest timestamp of any stored entry.
    pub(crate) fn max_timestamp(&self) -> Timestamp {
        self.segments
            .iter()
            .map(|segment| {
                let state = segment.state.read();
                state
                    .table
                    .occupied_slots()
                    .map(|slot| state.table.entry(slot).timestamp)
                    .max()
                    .unwrap_or_default()
            })
            .max()
            .unwrap_or_default()
    }

    pub(crate) fn watermark(&self, origin: NodeId) -> Timestamp {
        layout::read_watermark(&self.header.lock(), origin)
    }

    /// Raises the bootstrap watermark recorded for `origin`.
    pub(crate) fn advance_watermark(&self, origin: NodeId, timestamp: Timestamp) {
        let mut header = self.header.lock();
        if layout::read_watermark(&header, origin) < timestamp {
            layout::write_watermark(&mut header, origin, timestamp);
        }
    }

    pub(crate) fn flush(&self) -> Result<(), Error> {
        self.header.lock().flush()?;
        for segment in self.segments.iter() {
            segment.state.read().table.flush()?;
        }
        Ok(())
    }

    /// Registers `peer` on every segment's log and decides where its replay
    /// starts: at the oldest retained record if the log still covers
    /// everything newer than `since`, otherwise at the log's end after a scan
    /// of the segment's own entries.
    pub(crate) fn attach_peer(&self, peer: PeerToken, since: Timestamp) -> Vec<SegmentStart> {
        self.segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let mut guard = segment.state.write();
                let state = &mut *guard;
                let Some(log) = state.log.as_mut() else {
                    return SegmentStart {
                        cursor: 0,
                        target: 0,
                        resync: Vec::new(),
                    };
                };

                if log.retains_since(since) {
                    let cursor = log.start();
                    log.attach(peer, cursor);
                    SegmentStart {
                        cursor,
                        target: log.end(),
                        resync: Vec::new(),
                    }
                } else {
                    let resync = scan_local(&state.table, self.node, since);
                    let cursor = log.end();
                    log.attach(peer, cursor);
                    info!(
                        segment = index,
                        records = resync.len(),
                        "log no longer covers peer bootstrap, resyncing from entries"
                    );
                    SegmentStart {
                        cursor,
                        target: cursor,
                        resync,
                    }
                }
            })
            .collect()
    }

    pub(crate) fn acknowledge_peer(
        &self,
        segment: usize,
        peer: PeerToken,
        upto: u64,
    ) -> Result<(), Error> {
        match self.segments[segment].state.write().log.as_mut() {
            Some(log) => log.acknowledge(peer, upto),
            None => Ok(()),
        }
    }

    pub(crate) fn detach_peer(&self, peer: PeerToken) {
        for segment in self.segments.iter() {
            if let Some(log) = segment.state.write().log.as_mut() {
                log.detach(peer);
            }
        }
    }

    /// Reads up to `budget` log records of `segment` from `cursor`, skipping
    /// records not newer than `since` and records whose slot has moved on.
    pub(crate) fn read_log(
        &self,
        segment: usize,
        cursor: u64,
        since: Timestamp,
        budget: usize,
    ) -> Result<LogBatch, Error> {
        let state = self.segments[segment].state.read();
        let Some(log) = state.log.as_ref() else {
            return Ok(LogBatch {
                records: Vec::new(),
                next_cursor: cursor,
                caught_up: true,
            });
        };

        let mut batch = LogBatch {
            records: Vec::new(),
            next_cursor: cursor,
            caught_up: false,
        };
        for (seq, record) in log.read_from(cursor)?.take(budget) {
            batch.next_cursor = seq + 1;
            if record.timestamp <= since {
                continue;
            }
            let entry = state.table.entry(record.slot);
            if entry.state == SlotState::Free
                || entry.timestamp != record.timestamp
                || entry.origin != record.origin
            {
                continue;
            }
            batch.records.push(ReplicationRecord {
                key: entry.key.to_vec(),
                value: (!record.tombstone).then(|| entry.value.to_vec()),
                timestamp: record.timestamp,
                origin: record.origin,
            });
        }
        batch.caught_up = batch.next_cursor >= log.end();
        Ok(batch)
    }

    #[cfg(test)]
    fn segment_of(&self, key: &[u8]) -> usize {
        self.locate(key).0
    }

    #[cfg(test)]
    fn lock_segment(&self, index: usize) -> parking_lot::RwLockWriteGuard<'_, SegmentState> {
        self.segments[index].state.write()
    }
}

fn purge_segment(table: &mut SegmentTable, older_than: Timestamp) -> usize {
    let expired: Vec<u32> = table
        .occupied_slots()
        .filter(|slot| {
            let entry = table.entry(*slot);
            entry.state == SlotState::Tombstone && entry.timestamp < older_than
        })
        .collect();
    for slot in &expired {
        table.erase(*slot);
    }
    expired.len()
}

/// Entries written by `node` newer than `since`, oldest first.
fn scan_local(table: &SegmentTable, node: NodeId, since: Timestamp) -> Vec<ReplicationRecord> {
    let mut records: Vec<ReplicationRecord> = table
        .occupied_slots()
        .filter_map(|slot| {
            let entry = table.entry(slot);
            (entry.origin == node && entry.timestamp > since).then(|| ReplicationRecord {
                key: entry.key.to_vec(),
                value: (entry.state == SlotState::Live).then(|| entry.value.to_vec()),
                timestamp: entry.timestamp,
                origin: entry.origin,
            })
        })
        .collect();
    records.sort_by_key(|record| record.timestamp);
    records
}

/// Seeds a fresh log with the locally-originated entries of a reopened segment.
fn rebuild_log(table: &SegmentTable, log: &mut ModificationLog, node: NodeId) {
    let mut records: Vec<LogRecord> = table
        .occupied_slots()
        .filter_map(|slot| {
            let entry = table.entry(slot);
            (entry.origin == node).then_some(LogRecord {
                slot,
                timestamp: entry.timestamp,
                origin: entry.origin,
                tombstone: entry.state == SlotState::Tombstone,
            })
        })
        .collect();
    records.sort_by_key(|record| record.timestamp);
    for record in records {
        log.append(record);
    }
}

/// Maps the header and segment regions of a store file, creating it if needed.
fn map_file(
    path: &Path,
    layout: &Layout,
    node: NodeId,
) -> Result<(MmapMut, Vec<MmapMut>, Option<File>, bool), Error> {
    let reopened = path.metadata().map(|meta| meta.len() > 0).unwrap_or(false);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let file_len = layout.file_len() as u64;
    if reopened {
        let found = file.metadata()?.len();
        if found < file_len {
            return Err(Error::Corrupt(format!(
                "store file truncated: expected {} bytes, got {}",
                file_len, found
            )));
        }
    } else {
        file.set_len(file_len)?;
    }

    // Safety: the mapping lives as long as the store, which keeps the file
    // handle open; only this store mutates the file.
    let mut header = unsafe {
        MmapOptions::new()
            .offset(0)
            .len(layout.header_len())
            .map_mut(&file)?
    };
    if reopened {
        layout.verify_header(&header, node)?;
    } else {
        layout.write_header(&mut header, node);
        header.flush()?;
    }

    let mut regions = Vec::with_capacity(layout.segments);
    for index in 0..layout.segments {
        // Safety: see above; segment regions never overlap.
        let region = unsafe {
            MmapOptions::new()
                .offset(layout.segment_offset(index) as u64)
                .len(layout.segment_len)
                .map_mut(&file)?
        };
        regions.push(region);
    }

    info!(
        path = %path.display(),
        segments = layout.segments,
        reopened,
        file_size_kb = file_len / 1024,
        "mapped store file"
    );

    Ok((header, regions, Some(file), reopened))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn config() -> MapConfig {
        MapConfig::new()
            .with_segments(4)
            .with_entries_per_segment(8)
            .with_max_key_size(32)
            .with_max_value_size(64)
    }

    fn record(key: &str, value: Option<&str>, timestamp: Timestamp, origin: u8) -> ReplicationRecord {
        ReplicationRecord {
            key: key.as_bytes().to_vec(),
            value: value.map(|v| v.as_bytes().to_vec()),
            timestamp,
            origin: NodeId(origin),
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();

        store.put(b"a", b"1", &clock).unwrap();
        store.put(b"b", b"2", &clock).unwrap();
        store.put(b"a", b"3", &clock).unwrap();

        assert_eq!(store.get(b"a"), Some(b"3".to_vec()));
        assert_eq!(store.len(), 2);

        assert!(store.remove(b"a", &clock).unwrap());
        assert!(!store.remove(b"a", &clock).unwrap());
        assert_eq!(store.get(b"a"), None);
        assert!(!store.contains_key(b"a"));
        assert!(store.metadata(b"a").unwrap().tombstone);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unreplicated_remove_frees_slot() {
        let store = SegmentedStore::open(&config().replicated(false), NodeId(1)).unwrap();
        let clock = Clock::new();

        store.put(b"a", b"1", &clock).unwrap();
        assert!(store.remove(b"a", &clock).unwrap());
        assert_eq!(store.metadata(b"a"), None);
    }

    #[test]
    fn test_local_mutations_are_logged_in_order() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();

        store.put(b"a", b"1", &clock).unwrap();
        store.put(b"a", b"2", &clock).unwrap();
        store.remove(b"a", &clock).unwrap();

        let segment = store.segment_of(b"a");
        let state = store.segments[segment].state.read();
        let log = state.log.as_ref().unwrap();
        let records: Vec<_> = log.read_from(0).unwrap().map(|(_, r)| r).collect();
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(records[2].tombstone);
    }

    #[test]
    fn test_capacity_exceeded_leaves_entries_untouched() {
        let store = SegmentedStore::open(&config().with_segments(1), NodeId(1)).unwrap();
        let clock = Clock::new();

        for i in 0..8 {
            store.put(format!("k{}", i).as_bytes(), b"v", &clock).unwrap();
        }
        let err = store.put(b"overflow", b"v", &clock).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                segment: 0,
                capacity: 8
            }
        ));

        assert_eq!(store.len(), 8);
        for i in 0..8 {
            assert_eq!(store.get(format!("k{}", i).as_bytes()), Some(b"v".to_vec()));
        }
        // Overwrites still succeed on a full segment.
        store.put(b"k0", b"w", &clock).unwrap();
        assert_eq!(store.get(b"k0"), Some(b"w".to_vec()));
    }

    #[test]
    fn test_oversized_key_and_value_are_rejected() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();

        assert!(matches!(
            store.put(&[0u8; 33], b"v", &clock),
            Err(Error::KeyTooLarge { len: 33, max: 32 })
        ));
        assert!(matches!(
            store.put(b"k", &[0u8; 65], &clock),
            Err(Error::ValueTooLarge { len: 65, max: 64 })
        ));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_keys_of_every_size_up_to_the_limit() {
        let config = MapConfig::new()
            .with_segments(4)
            .with_entries_per_segment(100)
            .with_max_key_size(100)
            .with_max_value_size(100);
        let store = SegmentedStore::open(&config, NodeId(1)).unwrap();
        let clock = Clock::new();

        let mut key = String::new();
        for _ in 0..100 {
            store.put(key.as_bytes(), key.as_bytes(), &clock).unwrap();
            assert_eq!(store.get(key.as_bytes()), Some(key.as_bytes().to_vec()));
            key.push('a');
        }

        let mut key = String::new();
        for _ in 0..100 {
            assert_eq!(store.get(key.as_bytes()), Some(key.as_bytes().to_vec()));
            key.push('a');
        }
    }

    #[test]
    fn test_apply_is_last_write_wins() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();

        assert!(store.apply(&record("k", Some("first"), 100, 2), &clock).unwrap());
        assert!(!store.apply(&record("k", Some("older"), 99, 9), &clock).unwrap());
        assert!(store.apply(&record("k", Some("newer"), 101, 2), &clock).unwrap());
        assert_eq!(store.get(b"k"), Some(b"newer".to_vec()));

        assert!(store.apply(&record("k", None, 102, 3), &clock).unwrap());
        assert_eq!(store.get(b"k"), None);
        assert!(!store.apply(&record("k", Some("stale"), 101, 3), &clock).unwrap());
        assert!(store.metadata(b"k").unwrap().tombstone);
    }

    #[test]
    fn test_equal_timestamps_resolve_to_higher_node_in_any_order() {
        let high = record("k", Some("from-7"), 500, 7);
        let low = record("k", Some("from-3"), 500, 3);

        for order in [[&high, &low], [&low, &high]] {
            let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
            let clock = Clock::new();
            for record in order {
                store.apply(record, &clock).unwrap();
            }
            assert_eq!(store.get(b"k"), Some(b"from-7".to_vec()));
            assert_eq!(store.metadata(b"k").unwrap().origin, NodeId(7));
        }
    }

    #[test]
    fn test_applied_records_are_not_logged() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();
        store.apply(&record("k", Some("v"), 10, 2), &clock).unwrap();

        let segment = store.segment_of(b"k");
        assert_eq!(store.segments[segment].state.read().log.as_ref().unwrap().len(), 0);
    }

    #[test]
    fn test_local_put_beats_newer_remote_entry() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();
        let future = clock.now() + 60_000_000;

        store.apply(&record("k", Some("remote"), future, 9), &clock).unwrap();
        store.put(b"k", b"local", &clock).unwrap();

        let meta = store.metadata(b"k").unwrap();
        assert!(meta.timestamp > future);
        assert_eq!(meta.origin, NodeId(1));
    }

    #[test]
    fn test_purge_tombstones() {
        let store = SegmentedStore::open(&config(), NodeId(1)).unwrap();
        let clock = Clock::new();
        store.put(b"a", b"1", &clock).unwrap();
        store.put(b"b", b"2", &clock).unwrap();
        store.remove(b"a", &clock).unwrap();

        assert_eq!(store.purge_tombstones(0), 0);
        assert_eq!(store.purge_tombstones(clock.now()), 1);
        assert_eq!(store.metadata(b"a"), None);
        assert_eq!(store.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_full_segment_purges_expired_tombstones() {
        let config = config()
            .with_segments(1)
            .with_tombstone_retention(Duration::ZERO);
        let store = SegmentedStore::open(&config, NodeId(1)).unwrap();
        let clock = Clock::new();

        for i in 0..8 {
            store.put(format!("k{}", i).as_bytes(), b"v", &clock).unwrap();
        }
        store.remove(b"k3", &clock).unwrap();
        store.put(b"fresh", b"v", &clock).unwrap();

        assert_eq!(store.get(b"fresh"), Some(b"v".to_vec()));
        assert_eq!(store.metadata(b"k3"), None);
    }

    #[test]
    fn test_read_log_skips_superseded_records() {
        let store = SegmentedStore::open(&config().with_segments(1), NodeId(1)).unwrap();
        let clock = Clock::new();
        store.put(b"k", b"1", &clock).unwrap();
        store.put(b"k", b"2", &clock).unwrap();
        store.put(b"other", b"x", &clock).unwrap();

        let batch = store.read_log(0, 0, 0, 16).unwrap();
        assert!(batch.caught_up);
        assert_eq!(batch.next_cursor, 3);
        let values: Vec<_> = batch.records.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(values, vec![b"2".to_vec(), b"x".to_vec()]);

        let partial = store.read_log(0, 0, 0, 1).unwrap();
        assert!(!partial.caught_up);
        assert_eq!(partial.next_cursor, 1);
    }

    #[test]
    fn test_attach_falls_back_to_scan_when_log_was_reclaimed() {
        let config = config()
            .with_segments(1)
            .with_log(crate::config::LogConfig::default().with_backlog_limit(2));
        let store = SegmentedStore::open(&config, NodeId(1)).unwrap();
        let clock = Clock::new();
        for i in 0..5 {
            store.put(format!("k{}", i).as_bytes(), b"v", &clock).unwrap();
        }
        store.apply(&record("remote", Some("r"), 1, 2), &clock).unwrap();

        let starts = store.attach_peer(7, 0);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].cursor, 5);
        assert_eq!(starts[0].resync.len(), 5);
        assert!(starts[0].resync.iter().all(|r| r.origin == NodeId(1)));

        let fresh = store.attach_peer(8, clock.now());
        assert!(fresh[0].resync.is_empty());
    }

    #[test]
    fn test_segments_do_not_block_each_other() {
        let store = Arc::new(SegmentedStore::open(&config(), NodeId(1)).unwrap());
        let clock = Arc::new(Clock::new());

        let held = store.segment_of(b"held");
        let other = (0..1000)
            .map(|i| format!("key{}", i))
            .find(|key| store.segment_of(key.as_bytes()) != held)
            .unwrap();
        let same = (0..1000)
            .map(|i| format!("key{}", i))
            .find(|key| store.segment_of(key.as_bytes()) == held)
            .unwrap();

        let guard = store.lock_segment(held);

        let (tx, rx) = mpsc::channel();
        {
            let (store, clock, tx) = (store.clone(), clock.clone(), tx.clone());
            thread::spawn(move || {
                store.put(other.as_bytes(), b"v", &clock).unwrap();
                tx.send("other").unwrap();
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "other");

        {
            let (store, clock) = (store.clone(), clock.clone());
            thread::spawn(move || {
                store.put(same.as_bytes(), b"v", &clock).unwrap();
                tx.send("same").unwrap();
            });
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(guard);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "same");
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.rmap");
        let config = config().with_file(&path);
        let clock = Clock::new();

        {
            let store = SegmentedStore::open(&config, NodeId(1)).unwrap();
            store.put(b"a", b"1", &clock).unwrap();
            store.put(b"b", b"2", &clock).unwrap();
            store.remove(b"b", &clock).unwrap();
            store.apply(&record("c", Some("3"), 5, 2), &clock).unwrap();
            store.advance_watermark(NodeId(2), 5);
            store.flush().unwrap();
        }

        let store = SegmentedStore::open(&config, NodeId(1)).unwrap();
        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
        assert!(store.metadata(b"b").unwrap().tombstone);
        assert_eq!(store.get(b"c"), Some(b"3".to_vec()));
        assert_eq!(store.len(), 2);
        assert_eq!(store.watermark(NodeId(2)), 5);
        assert_eq!(store.max_timestamp(), store.metadata(b"b").unwrap().timestamp);

        let rebuilt: usize = store
            .segments
            .iter()
            .map(|s| s.state.read().log.as_ref().unwrap().len())
            .sum();
        assert_eq!(rebuilt, 2);

        assert!(matches!(
            SegmentedStore::open(&config, NodeId(9)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SegmentedStore::open(&config.clone().with_segments(2), NodeId(1)),
            Err(Error::InvalidConfig(_))
        ));
    }
}
