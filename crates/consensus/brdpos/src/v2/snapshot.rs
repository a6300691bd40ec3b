//! BRDPoS V2 Snapshot Management
//!
//! A snapshot freezes the candidate set read from the validator contract at a gap block. The
//! masternodes of the following epoch are derived from it, so replaying the chain never needs
//! the contract state of old gap blocks.

use crate::{
    chain::ChainReader,
    constants::SNAPSHOT_KEY_PREFIX,
    db::KeyValueStore,
    errors::{BrdposError, BrdposResult},
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::{Address, B256};
use core::num::NonZeroUsize;
use hashbrown::HashSet;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Candidate set frozen at a gap block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotV2 {
    /// Block number where the snapshot was created
    pub number: u64,
    /// Block hash where the snapshot was created
    pub hash: B256,
    /// Candidates for the next epoch
    #[serde(rename = "masterNodes")]
    pub next_epoch_candidates: Vec<Address>,
}

impl SnapshotV2 {
    /// Create a new snapshot
    pub const fn new(number: u64, hash: B256, next_epoch_candidates: Vec<Address>) -> Self {
        Self { number, hash, next_epoch_candidates }
    }

    /// Candidates as a set
    pub fn mapped_candidates(&self) -> HashSet<Address> {
        self.next_epoch_candidates.iter().copied().collect()
    }

    /// Whether `address` is a candidate
    pub fn is_candidate(&self, address: &Address) -> bool {
        self.next_epoch_candidates.contains(address)
    }
}

/// Database key of the snapshot taken at `hash`
pub fn snapshot_key(hash: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_KEY_PREFIX.len() + 32);
    key.extend_from_slice(SNAPSHOT_KEY_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Load a snapshot from the database
pub fn load_snapshot(db: &dyn KeyValueStore, hash: &B256) -> BrdposResult<Option<SnapshotV2>> {
    db.get(&snapshot_key(hash))?.map(|blob| serde_json::from_slice(&blob)).transpose().map_err(Into::into)
}

/// Store a snapshot in the database
pub fn store_snapshot(db: &dyn KeyValueStore, snapshot: &SnapshotV2) -> BrdposResult<()> {
    db.put(&snapshot_key(&snapshot.hash), serde_json::to_vec(snapshot)?)
}

/// Snapshots keyed by gap block hash, with an LRU in front of the database
pub struct SnapshotStore {
    db: Arc<dyn KeyValueStore>,
    recents: Mutex<LruCache<B256, Arc<SnapshotV2>>>,
    epoch: u64,
    gap: u64,
}

impl core::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("cached", &self.recents.lock().len())
            .field("epoch", &self.epoch)
            .field("gap", &self.gap)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Create a store caching up to `capacity` snapshots
    pub fn new(db: Arc<dyn KeyValueStore>, capacity: NonZeroUsize, epoch: u64, gap: u64) -> Self {
        Self { db, recents: Mutex::new(LruCache::new(capacity)), epoch, gap }
    }

    /// Snapshot governing block `number`, or the one taken at `number` itself when `is_gap`.
    ///
    /// The gap block is resolved through the canonical chain.
    pub fn get_snapshot(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        is_gap: bool,
    ) -> BrdposResult<Arc<SnapshotV2>> {
        let gap_number =
            if is_gap { number } else { crate::gap_block_number(number, self.epoch, self.gap) };
        let gap_hash =
            chain.canonical_hash(gap_number).ok_or(BrdposError::HeaderNotFoundByNumber(gap_number))?;
        debug!(target: "consensus::brdpos", number = gap_number, hash = %gap_hash, "Get snapshot from gap block");
        self.get_by_hash(&gap_hash)
    }

    /// Snapshot taken at the block `hash`
    pub fn get_by_hash(&self, hash: &B256) -> BrdposResult<Arc<SnapshotV2>> {
        if let Some(snap) = self.recents.lock().get(hash) {
            trace!(target: "consensus::brdpos", number = snap.number, %hash, "Loaded snapshot from memory");
            return Ok(snap.clone());
        }

        let snap = load_snapshot(self.db.as_ref(), hash)?.ok_or(BrdposError::SnapshotNotFound(*hash))?;
        trace!(target: "consensus::brdpos", number = snap.number, %hash, "Loaded snapshot from disk");
        let snap = Arc::new(snap);
        self.recents.lock().put(*hash, snap.clone());
        Ok(snap)
    }

    /// Persist a snapshot and cache it
    pub fn store(&self, snapshot: SnapshotV2) -> BrdposResult<Arc<SnapshotV2>> {
        store_snapshot(self.db.as_ref(), &snapshot)?;
        trace!(target: "consensus::brdpos", number = snapshot.number, hash = %snapshot.hash, "Stored snapshot to disk");
        let snap = Arc::new(snapshot);
        self.recents.lock().put(snap.hash, snap.clone());
        Ok(snap)
    }
}
