//! Public handle over one replicated map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use replimap_types::{NodeId, Timestamp};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::MapConfig;
use crate::error::Error;
use crate::store::{EntryMetadata, ReplicationRecord, SegmentedStore};

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A fixed-capacity byte-keyed map whose local mutations are replicated to
/// every peer its channel is attached to.
///
/// Keys and values are opaque byte strings, from empty up to the sizes in the
/// map's [`MapConfig`]. Operations lock only the segment the key hashes to and
/// never wait on the network.
///
/// Handles are cheap to clone; all clones refer to the same map.
///
/// # Example
///
/// ```
/// use replimap::{MapConfig, ReplicatedMap};
///
/// # fn main() -> Result<(), replimap::Error> {
/// let map = ReplicatedMap::open(MapConfig::new().with_entries(1000), 1)?;
///
/// map.put("hello", "world")?;
/// assert_eq!(map.get("hello")?, Some(b"world".to_vec()));
///
/// assert!(map.remove("hello")?);
/// assert_eq!(map.get("hello")?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ReplicatedMap {
    core: Arc<MapCore>,
}

pub(crate) struct MapCore {
    store: SegmentedStore,
    node: NodeId,
    clock: Clock,
    /// Bumped after every logged local mutation; connection writers wait on it.
    changes: watch::Sender<u64>,
    closed: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

impl ReplicatedMap {
    /// Creates a map owned by `node`, reopening its backing file if the
    /// configuration names one.
    ///
    /// A map opened this way is not attached to any peer; use
    /// [`crate::Cluster::create_channel`] for a replicated one.
    pub fn open(config: MapConfig, node: impl Into<NodeId>) -> Result<Self, Error> {
        let node = node.into();
        let store = SegmentedStore::open(&config, node)?;

        let clock = Clock::new();
        clock.observe(store.max_timestamp());

        info!(
            node = %node,
            segments = store.segment_count(),
            capacity = store.capacity(),
            replicated = config.replicated,
            "opened map"
        );

        let (changes, _) = watch::channel(0);
        Ok(Self {
            core: Arc::new(MapCore {
                store,
                node,
                clock,
                changes,
                closed: AtomicBool::new(false),
                release: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_core(core: Arc<MapCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<MapCore> {
        &self.core
    }

    /// Stores `value` under `key`, stamping it with a fresh local timestamp.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), Error> {
        self.core.ensure_open()?;
        self.core
            .store
            .put(key.as_ref(), value.as_ref(), &self.core.clock)?;
        self.core.notify();
        Ok(())
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        self.core.ensure_open()?;
        Ok(self.core.store.get(key.as_ref()))
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<bool, Error> {
        self.core.ensure_open()?;
        let removed = self.core.store.remove(key.as_ref(), &self.core.clock)?;
        if removed {
            self.core.notify();
        }
        Ok(removed)
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool, Error> {
        self.core.ensure_open()?;
        Ok(self.core.store.contains_key(key.as_ref()))
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, Error> {
        self.core.ensure_open()?;
        Ok(self.core.store.len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Total number of entry slots, live or not.
    pub fn capacity(&self) -> usize {
        self.core.store.capacity()
    }

    /// Snapshot of every live entry. No ordering guarantee.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.core.ensure_open()?;
        Ok(self.core.store.entries())
    }

    /// Replication metadata of `key`, including removed keys whose tombstone
    /// is still retained.
    pub fn metadata(&self, key: impl AsRef<[u8]>) -> Result<Option<EntryMetadata>, Error> {
        self.core.ensure_open()?;
        Ok(self.core.store.metadata(key.as_ref()))
    }

    /// Reclaims tombstones last written before `older_than` and returns how
    /// many were purged.
    ///
    /// A peer that has not yet seen the removal and still holds the entry
    /// will not learn about it once the tombstone is gone.
    pub fn purge_tombstones(&self, older_than: Timestamp) -> Result<usize, Error> {
        self.core.ensure_open()?;
        let purged = self.core.store.purge_tombstones(older_than);
        debug!(node = %self.core.node, purged, "purged tombstones");
        Ok(purged)
    }

    /// Syncs a file-backed map to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.core.ensure_open()?;
        self.core.store.flush()
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node
    }

    /// Flushes the map and detaches it from its channel. Idempotent.
    ///
    /// The backing memory is released once no connection holds the map any
    /// longer.
    pub fn close(&self) -> Result<(), Error> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let release = self.core.release.lock().take();
        if let Some(release) = release {
            release();
        }
        self.core.store.flush()?;
        info!(node = %self.core.node, "closed map");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }
}

impl MapCore {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    pub(crate) fn store(&self) -> &SegmentedStore {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub(crate) fn set_release(&self, release: ReleaseHook) {
        *self.release.lock() = Some(release);
    }

    /// Applies a peer's mutation under last-write-wins.
    pub(crate) fn apply_remote(&self, record: &ReplicationRecord) -> Result<bool, Error> {
        self.store.apply(record, &self.clock)
    }

    /// Remembers that every record of `origin` up to `through` has arrived.
    pub(crate) fn record_checkpoint(&self, origin: NodeId, through: Timestamp) {
        self.store.advance_watermark(origin, through);
    }

    /// The bootstrap timestamp to declare to `peer`.
    pub(crate) fn last_known(&self, peer: NodeId) -> Timestamp {
        self.store.watermark(peer)
    }
}
