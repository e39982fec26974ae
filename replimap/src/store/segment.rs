//! One segment's hash region: bucket chains, entry slots and the free list.
//!
//! A `SegmentTable` only ever touches its own mapping. Callers serialize
//! access through the segment lock held by [`super::Segment`].

use memmap2::MmapMut;
use replimap_types::{NodeId, Timestamp};

use super::layout::{
    read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, Layout, SEG_OFF_FREE_HEAD,
    SEG_OFF_HIGH_WATER, SEG_OFF_LIVE, SEG_OFF_OCCUPIED, SLOT_OFF_HASH, SLOT_OFF_KEY_LEN,
    SLOT_OFF_NEXT, SLOT_OFF_ORIGIN, SLOT_OFF_STATE, SLOT_OFF_TIMESTAMP, SLOT_OFF_VALUE_LEN,
};
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Live,
    Tombstone,
}

impl SlotState {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Live),
            2 => Some(SlotState::Tombstone),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SlotState::Free => 0,
            SlotState::Live => 1,
            SlotState::Tombstone => 2,
        }
    }
}

/// Borrowed view of an occupied slot.
#[derive(Debug)]
pub(crate) struct EntryRef<'a> {
    pub state: SlotState,
    pub origin: NodeId,
    pub timestamp: Timestamp,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

pub(crate) struct SegmentTable {
    mem: MmapMut,
    layout: Layout,
}

impl SegmentTable {
    /// Wraps a segment mapping. Zeroed memory is an empty segment.
    pub(crate) fn new(mem: MmapMut, layout: Layout) -> Self {
        Self { mem, layout }
    }

    /// Re-derives the counters from the slots after reopening a file.
    pub(crate) fn recount(&mut self) -> Result<(), Error> {
        let high_water = self.high_water();
        if high_water as usize > self.layout.entries {
            return Err(Error::Corrupt(format!(
                "segment high-water mark {} exceeds capacity {}",
                high_water, self.layout.entries
            )));
        }

        let mut live = 0u32;
        let mut occupied = 0u32;
        for slot in 0..high_water {
            let byte = self.mem[self.layout.slot_offset(slot) + SLOT_OFF_STATE];
            match SlotState::from_u8(byte) {
                Some(SlotState::Free) => {}
                Some(SlotState::Live) => {
                    live += 1;
                    occupied += 1;
                }
                Some(SlotState::Tombstone) => occupied += 1,
                None => {
                    return Err(Error::Corrupt(format!(
                        "slot {} has invalid state byte {}",
                        slot, byte
                    )))
                }
            }
        }

        write_u32(&mut self.mem, SEG_OFF_LIVE, live);
        write_u32(&mut self.mem, SEG_OFF_OCCUPIED, occupied);
        Ok(())
    }

    pub(crate) fn live(&self) -> u32 {
        read_u32(&self.mem, SEG_OFF_LIVE)
    }

    pub(crate) fn occupied(&self) -> u32 {
        read_u32(&self.mem, SEG_OFF_OCCUPIED)
    }

    fn high_water(&self) -> u32 {
        read_u32(&self.mem, SEG_OFF_HIGH_WATER)
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.layout.buckets - 1)
    }

    fn bucket_head(&self, bucket: usize) -> u32 {
        read_u32(&self.mem, self.layout.bucket_offset(bucket))
    }

    fn set_bucket_head(&mut self, bucket: usize, link: u32) {
        let off = self.layout.bucket_offset(bucket);
        write_u32(&mut self.mem, off, link);
    }

    fn next_link(&self, slot: u32) -> u32 {
        read_u32(&self.mem, self.layout.slot_offset(slot) + SLOT_OFF_NEXT)
    }

    fn set_next_link(&mut self, slot: u32, link: u32) {
        let off = self.layout.slot_offset(slot) + SLOT_OFF_NEXT;
        write_u32(&mut self.mem, off, link);
    }

    fn state(&self, slot: u32) -> SlotState {
        let byte = self.mem[self.layout.slot_offset(slot) + SLOT_OFF_STATE];
        SlotState::from_u8(byte).unwrap_or(SlotState::Free)
    }

    fn set_state(&mut self, slot: u32, state: SlotState) {
        let off = self.layout.slot_offset(slot) + SLOT_OFF_STATE;
        self.mem[off] = state.as_u8();
    }

    fn key(&self, slot: u32) -> &[u8] {
        let base = self.layout.slot_offset(slot);
        let len = read_u16(&self.mem, base + SLOT_OFF_KEY_LEN) as usize;
        let off = self.layout.key_offset(slot);
        &self.mem[off..off + len.min(self.layout.max_key)]
    }

    /// Finds the slot holding `key`, live or tombstoned.
    pub(crate) fn find(&self, hash: u32, key: &[u8]) -> Option<u32> {
        let mut link = self.bucket_head(self.bucket_of(hash));
        let mut hops = 0usize;

        while link != 0 && hops <= self.layout.entries {
            let slot = link - 1;
            let base = self.layout.slot_offset(slot);
            if read_u32(&self.mem, base + SLOT_OFF_HASH) == hash && self.key(slot) == key {
                return Some(slot);
            }
            link = self.next_link(slot);
            hops += 1;
        }
        None
    }

    pub(crate) fn entry(&self, slot: u32) -> EntryRef<'_> {
        let base = self.layout.slot_offset(slot);
        let value_len = read_u32(&self.mem, base + SLOT_OFF_VALUE_LEN) as usize;
        let value_off = self.layout.value_offset(slot);

        EntryRef {
            state: self.state(slot),
            origin: NodeId(self.mem[base + SLOT_OFF_ORIGIN]),
            timestamp: read_u64(&self.mem, base + SLOT_OFF_TIMESTAMP),
            key: self.key(slot),
            value: &self.mem[value_off..value_off + value_len.min(self.layout.max_value)],
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        let free_head = read_u32(&self.mem, SEG_OFF_FREE_HEAD);
        if free_head != 0 {
            let slot = free_head - 1;
            let next = self.next_link(slot);
            write_u32(&mut self.mem, SEG_OFF_FREE_HEAD, next);
            return Some(slot);
        }

        let high_water = self.high_water();
        if (high_water as usize) < self.layout.entries {
            write_u32(&mut self.mem, SEG_OFF_HIGH_WATER, high_water + 1);
            return Some(high_water);
        }
        None
    }

    /// Stores a new entry for a key not present in the segment.
    ///
    /// Returns `None` when every slot is taken.
    pub(crate) fn insert(
        &mut self,
        hash: u32,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
        origin: NodeId,
        tombstone: bool,
    ) -> Option<u32> {
        let slot = self.allocate()?;
        let base = self.layout.slot_offset(slot);

        let key_off = self.layout.key_offset(slot);
        self.mem[key_off..key_off + key.len()].copy_from_slice(key);
        write_u16(&mut self.mem, base + SLOT_OFF_KEY_LEN, key.len() as u16);
        write_u32(&mut self.mem, base + SLOT_OFF_HASH, hash);
        self.write_payload(slot, value, timestamp, origin, tombstone);

        let bucket = self.bucket_of(hash);
        let head = self.bucket_head(bucket);
        self.set_next_link(slot, head);
        self.set_bucket_head(bucket, slot + 1);

        let occupied = self.occupied();
        write_u32(&mut self.mem, SEG_OFF_OCCUPIED, occupied + 1);
        if !tombstone {
            let live = self.live();
            write_u32(&mut self.mem, SEG_OFF_LIVE, live + 1);
        }
        Some(slot)
    }

    /// Replaces the value and metadata of an occupied slot.
    pub(crate) fn update(
        &mut self,
        slot: u32,
        value: &[u8],
        timestamp: Timestamp,
        origin: NodeId,
        tombstone: bool,
    ) {
        let was_live = self.state(slot) == SlotState::Live;
        self.write_payload(slot, value, timestamp, origin, tombstone);

        let live = self.live();
        match (was_live, tombstone) {
            (true, true) => write_u32(&mut self.mem, SEG_OFF_LIVE, live - 1),
            (false, false) => write_u32(&mut self.mem, SEG_OFF_LIVE, live + 1),
            _ => {}
        }
    }

    // Value first, then timestamp and origin, then the state byte, so a
    // reader never pairs a new value with stale metadata.
    fn write_payload(
        &mut self,
        slot: u32,
        value: &[u8],
        timestamp: Timestamp,
        origin: NodeId,
        tombstone: bool,
    ) {
        let base = self.layout.slot_offset(slot);
        let value_off = self.layout.value_offset(slot);

        self.mem[value_off..value_off + value.len()].copy_from_slice(value);
        write_u32(&mut self.mem, base + SLOT_OFF_VALUE_LEN, value.len() as u32);
        write_u64(&mut self.mem, base + SLOT_OFF_TIMESTAMP, timestamp);
        self.mem[base + SLOT_OFF_ORIGIN] = origin.0;
        let state = if tombstone {
            SlotState::Tombstone
        } else {
            SlotState::Live
        };
        self.set_state(slot, state);
    }

    /// Unlinks `slot` from its bucket chain and returns it to the free list.
    pub(crate) fn erase(&mut self, slot: u32) {
        let hash = read_u32(&self.mem, self.layout.slot_offset(slot) + SLOT_OFF_HASH);
        let bucket = self.bucket_of(hash);
        let next = self.next_link(slot);

        if self.bucket_head(bucket) == slot + 1 {
            self.set_bucket_head(bucket, next);
        } else {
            let mut link = self.bucket_head(bucket);
            while link != 0 {
                let prev = link - 1;
                let after = self.next_link(prev);
                if after == slot + 1 {
                    self.set_next_link(prev, next);
                    break;
                }
                link = after;
            }
        }

        let was_live = self.state(slot) == SlotState::Live;
        self.set_state(slot, SlotState::Free);
        let free_head = read_u32(&self.mem, SEG_OFF_FREE_HEAD);
        self.set_next_link(slot, free_head);
        write_u32(&mut self.mem, SEG_OFF_FREE_HEAD, slot + 1);

        let occupied = self.occupied();
        write_u32(&mut self.mem, SEG_OFF_OCCUPIED, occupied - 1);
        if was_live {
            let live = self.live();
            write_u32(&mut self.mem, SEG_OFF_LIVE, live - 1);
        }
    }

    /// Every slot holding a live or tombstoned entry.
    pub(crate) fn occupied_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.high_water()).filter(move |slot| self.state(*slot) != SlotState::Free)
    }

    pub(crate) fn flush(&self) -> std::io::Result<()> {
        self.mem.flush()
    }
}
