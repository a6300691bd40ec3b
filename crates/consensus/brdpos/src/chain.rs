//! Header chain access.

use alloc::{collections::BTreeMap, vec::Vec};
use alloy_primitives::B256;
use brc_primitives::BrcBlockHeader;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Read-only view of the header chain consumed by the engine.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ChainReader: Send + Sync {
    /// Header with the given hash, canonical or not
    fn header_by_hash(&self, hash: &B256) -> Option<BrcBlockHeader>;

    /// Canonical header at `number`
    fn header_by_number(&self, number: u64) -> Option<BrcBlockHeader>;

    /// Head of the canonical chain
    fn current_header(&self) -> Option<BrcBlockHeader>;

    /// Canonical hash at `number`
    fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.header_by_number(number).map(|h| h.hash_slow())
    }
}

/// Header chain kept in memory.
///
/// Headers are indexed by hash; the canonical index follows the head set by
/// [`InMemoryChain::set_head`].
#[derive(Debug, Default)]
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,
}

#[derive(Debug, Default)]
struct ChainInner {
    headers: HashMap<B256, BrcBlockHeader>,
    canonical: BTreeMap<u64, B256>,
    head: Option<B256>,
}

impl InMemoryChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a header without touching the canonical chain
    pub fn insert_header(&self, header: BrcBlockHeader) -> B256 {
        let hash = header.hash_slow();
        self.inner.write().headers.insert(hash, header);
        hash
    }

    /// Store a header and make it the canonical head
    pub fn insert_canonical(&self, header: BrcBlockHeader) -> B256 {
        let hash = self.insert_header(header);
        self.set_head(hash);
        hash
    }

    /// Make `hash` the canonical head, rewriting the canonical index along its ancestry.
    ///
    /// Returns `false` if the header is unknown.
    pub fn set_head(&self, hash: B256) -> bool {
        let mut inner = self.inner.write();
        let Some(head) = inner.headers.get(&hash) else { return false };
        let head_number = head.number;

        let mut rewritten = Vec::new();
        let mut cursor = Some((hash, head_number));
        while let Some((hash, number)) = cursor {
            if inner.canonical.get(&number) == Some(&hash) {
                break;
            }
            rewritten.push((number, hash));
            cursor = inner
                .headers
                .get(&hash)
                .filter(|h| h.number > 0)
                .and_then(|h| inner.headers.get(&h.parent_hash).map(|p| (h.parent_hash, p.number)));
        }

        let stale: Vec<u64> = inner.canonical.range(head_number + 1..).map(|(n, _)| *n).collect();
        for number in stale {
            inner.canonical.remove(&number);
        }
        for (number, hash) in rewritten {
            inner.canonical.insert(number, hash);
        }
        inner.head = Some(hash);
        true
    }

    /// Number of stored headers
    pub fn len(&self) -> usize {
        self.inner.read().headers.len()
    }

    /// Whether no header is stored
    pub fn is_empty(&self) -> bool {
        self.inner.read().headers.is_empty()
    }
}

impl ChainReader for InMemoryChain {
    fn header_by_hash(&self, hash: &B256) -> Option<BrcBlockHeader> {
        self.inner.read().headers.get(hash).cloned()
    }

    fn header_by_number(&self, number: u64) -> Option<BrcBlockHeader> {
        let inner = self.inner.read();
        inner.canonical.get(&number).and_then(|hash| inner.headers.get(hash)).cloned()
    }

    fn current_header(&self) -> Option<BrcBlockHeader> {
        let inner = self.inner.read();
        inner.head.and_then(|hash| inner.headers.get(&hash)).cloned()
    }

    fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.inner.read().canonical.get(&number).copied()
    }
}
