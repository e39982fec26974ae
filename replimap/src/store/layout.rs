//! Byte layout of the store's header and segment regions.
//!
//! ```text
//! header region (REGION_ALIGN bytes)
//!   0..4     magic "RMAP"
//!   4..8     version
//!   8..12    segment count
//!   12..16   entries per segment
//!   16..20   max key size
//!   20..24   max value size
//!   24       owning node id
//!   64..2112 bootstrap watermarks, one u64 per origin node id
//!
//! segment region (rounded up to REGION_ALIGN)
//!   0..4     live entries
//!   4..8     occupied slots (live + tombstoned)
//!   8..12    free list head (slot + 1, 0 = empty)
//!   12..16   high-water mark (slots ever handed out)
//!   16..     bucket heads, u32 each (slot + 1, 0 = empty)
//!   ...      slots, 8-byte aligned
//!
//! slot (stride = 24 + max key + max value, rounded up to 8)
//!   0        state (0 free, 1 live, 2 tombstone)
//!   1        origin node id
//!   2..4     key length
//!   4..8     value length
//!   8..12    key hash
//!   12..16   next slot in bucket chain or free list (slot + 1)
//!   16..24   timestamp
//!   24..     key bytes, then value bytes
//! ```
//!
//! All integers are little-endian.

use replimap_types::{NodeId, Timestamp};

use crate::config::MapConfig;
use crate::error::Error;

const MAGIC: &[u8; 4] = b"RMAP";
const VERSION: u32 = 1;

/// Mapping offsets must be multiples of the platform's allocation granularity.
pub(crate) const REGION_ALIGN: usize = 64 * 1024;

const HEADER_OFF_MAGIC: usize = 0;
const HEADER_OFF_VERSION: usize = 4;
const HEADER_OFF_SEGMENTS: usize = 8;
const HEADER_OFF_ENTRIES: usize = 12;
const HEADER_OFF_MAX_KEY: usize = 16;
const HEADER_OFF_MAX_VALUE: usize = 20;
const HEADER_OFF_NODE: usize = 24;
const HEADER_OFF_WATERMARKS: usize = 64;

pub(crate) const SEG_OFF_LIVE: usize = 0;
pub(crate) const SEG_OFF_OCCUPIED: usize = 4;
pub(crate) const SEG_OFF_FREE_HEAD: usize = 8;
pub(crate) const SEG_OFF_HIGH_WATER: usize = 12;
const SEG_OFF_BUCKETS: usize = 16;

pub(crate) const SLOT_OFF_STATE: usize = 0;
pub(crate) const SLOT_OFF_ORIGIN: usize = 1;
pub(crate) const SLOT_OFF_KEY_LEN: usize = 2;
pub(crate) const SLOT_OFF_VALUE_LEN: usize = 4;
pub(crate) const SLOT_OFF_HASH: usize = 8;
pub(crate) const SLOT_OFF_NEXT: usize = 12;
pub(crate) const SLOT_OFF_TIMESTAMP: usize = 16;
const SLOT_HEADER_LEN: usize = 24;

/// Sizes and offsets derived from a validated [`MapConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub segments: usize,
    pub entries: usize,
    pub max_key: usize,
    pub max_value: usize,
    pub buckets: usize,
    pub slot_stride: usize,
    pub slots_offset: usize,
    pub segment_len: usize,
    pub region_len: usize,
}

impl Layout {
    pub(crate) fn new(config: &MapConfig) -> Result<Self, Error> {
        let overflow = || Error::InvalidConfig("map layout does not fit in memory".into());

        let buckets = config
            .entries_per_segment
            .checked_next_power_of_two()
            .ok_or_else(overflow)?;
        let slot_stride = align_up(SLOT_HEADER_LEN + config.max_key_size + config.max_value_size, 8);
        let slots_offset = align_up(SEG_OFF_BUCKETS + buckets * 4, 8);
        let segment_len = slot_stride
            .checked_mul(config.entries_per_segment)
            .and_then(|slots| slots.checked_add(slots_offset))
            .ok_or_else(overflow)?;
        let region_len = align_up(segment_len, REGION_ALIGN);
        region_len
            .checked_mul(config.segments)
            .and_then(|len| len.checked_add(REGION_ALIGN))
            .ok_or_else(overflow)?;

        Ok(Self {
            segments: config.segments,
            entries: config.entries_per_segment,
            max_key: config.max_key_size,
            max_value: config.max_value_size,
            buckets,
            slot_stride,
            slots_offset,
            segment_len,
            region_len,
        })
    }

    pub(crate) fn header_len(&self) -> usize {
        REGION_ALIGN
    }

    pub(crate) fn file_len(&self) -> usize {
        REGION_ALIGN + self.region_len * self.segments
    }

    pub(crate) fn segment_offset(&self, segment: usize) -> usize {
        REGION_ALIGN + self.region_len * segment
    }

    pub(crate) fn bucket_offset(&self, bucket: usize) -> usize {
        SEG_OFF_BUCKETS + bucket * 4
    }

    pub(crate) fn slot_offset(&self, slot: u32) -> usize {
        self.slots_offset + slot as usize * self.slot_stride
    }

    pub(crate) fn key_offset(&self, slot: u32) -> usize {
        self.slot_offset(slot) + SLOT_HEADER_LEN
    }

    pub(crate) fn value_offset(&self, slot: u32) -> usize {
        self.key_offset(slot) + self.max_key
    }

    pub(crate) fn write_header(&self, buf: &mut [u8], node: NodeId) {
        buf[HEADER_OFF_MAGIC..HEADER_OFF_MAGIC + 4].copy_from_slice(MAGIC);
        write_u32(buf, HEADER_OFF_VERSION, VERSION);
        write_u32(buf, HEADER_OFF_SEGMENTS, self.segments as u32);
        write_u32(buf, HEADER_OFF_ENTRIES, self.entries as u32);
        write_u32(buf, HEADER_OFF_MAX_KEY, self.max_key as u32);
        write_u32(buf, HEADER_OFF_MAX_VALUE, self.max_value as u32);
        buf[HEADER_OFF_NODE] = node.0;
    }

    /// Checks that `buf` holds a header describing this exact layout, owned by `node`.
    pub(crate) fn verify_header(&self, buf: &[u8], node: NodeId) -> Result<(), Error> {
        if &buf[HEADER_OFF_MAGIC..HEADER_OFF_MAGIC + 4] != MAGIC {
            return Err(Error::Corrupt(format!(
                "invalid magic: {}",
                String::from_utf8_lossy(&buf[HEADER_OFF_MAGIC..HEADER_OFF_MAGIC + 4])
            )));
        }

        let version = read_u32(buf, HEADER_OFF_VERSION);
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported version {} (expected {})",
                version, VERSION
            )));
        }

        let stored = [
            ("segments", read_u32(buf, HEADER_OFF_SEGMENTS), self.segments),
            ("entries per segment", read_u32(buf, HEADER_OFF_ENTRIES), self.entries),
            ("max key size", read_u32(buf, HEADER_OFF_MAX_KEY), self.max_key),
            ("max value size", read_u32(buf, HEADER_OFF_MAX_VALUE), self.max_value),
        ];
        for (name, found, expected) in stored {
            if found as usize != expected {
                return Err(Error::InvalidConfig(format!(
                    "store file has {} = {}, configuration asks for {}",
                    name, found, expected
                )));
            }
        }

        let owner = NodeId(buf[HEADER_OFF_NODE]);
        if owner != node {
            return Err(Error::InvalidConfig(format!(
                "store file belongs to node {}, opened by node {}",
                owner, node
            )));
        }
        Ok(())
    }
}

pub(crate) fn read_watermark(buf: &[u8], origin: NodeId) -> Timestamp {
    read_u64(buf, HEADER_OFF_WATERMARKS + usize::from(origin.0) * 8)
}

pub(crate) fn write_watermark(buf: &mut [u8], origin: NodeId, timestamp: Timestamp) {
    write_u64(buf, HEADER_OFF_WATERMARKS + usize::from(origin.0) * 8, timestamp);
}

fn align_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(bytes)
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}
