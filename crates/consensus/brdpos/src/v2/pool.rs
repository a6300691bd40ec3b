//! BRDPoS V2 vote and timeout pools
//!
//! Messages are grouped by their pool key. A key yields its certificate material once the number
//! of distinct signers reaches the threshold; after the certificate is built the key is marked
//! certified and every later message for it is ignored.

use super::{BlockInfo, Round, Signature, Timeout, Vote};
use alloc::{string::String, vec::Vec};
use alloy_primitives::Address;
use hashbrown::{HashMap, HashSet};

/// A signed consensus message that can be pooled
pub trait PoolObject: Clone {
    /// Key grouping messages that certify the same thing
    fn pool_key(&self) -> String;

    /// Round the message belongs to
    fn round(&self) -> Round;

    /// Recovered signer, if verified
    fn signer(&self) -> Option<Address>;

    /// Signature carried by the message
    fn signature(&self) -> &Signature;
}

impl PoolObject for Vote {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn round(&self) -> Round {
        self.proposed_block_info.round
    }

    fn signer(&self) -> Option<Address> {
        Self::signer(self)
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl PoolObject for Timeout {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn round(&self) -> Round {
        self.round
    }

    fn signer(&self) -> Option<Address> {
        Self::signer(self)
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Outcome of adding a message to a [`Pool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAdd<T> {
    /// Unsigned, already counted, or the key was already certified
    Ignored,
    /// The signer already sent a message for another key in the same round. Holds the first
    /// message, which is the one that counts.
    Conflict(T),
    /// Stored. Holds the number of distinct signers for the key.
    Added(usize),
    /// Stored and the key reached the threshold. Holds every message for the key in arrival
    /// order.
    ThresholdReached(Vec<T>),
}

/// Messages waiting for a certificate
#[derive(Debug, Clone)]
pub struct Pool<T> {
    objects: HashMap<String, Vec<T>>,
    /// first message of every signer per round, used to detect equivocation
    first_seen: HashMap<(Round, Address), T>,
    certified: HashSet<String>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { objects: HashMap::new(), first_seen: HashMap::new(), certified: HashSet::new() }
    }
}

impl<T: PoolObject> Pool<T> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified message and check it against `threshold` distinct signers
    pub fn add(&mut self, obj: T, threshold: usize) -> PoolAdd<T> {
        let Some(signer) = obj.signer() else { return PoolAdd::Ignored };
        let key = obj.pool_key();
        if self.certified.contains(&key) {
            return PoolAdd::Ignored;
        }

        match self.first_seen.get(&(obj.round(), signer)) {
            Some(first) if first.pool_key() != key => return PoolAdd::Conflict(first.clone()),
            Some(_) => return PoolAdd::Ignored,
            None => {}
        }
        self.first_seen.insert((obj.round(), signer), obj.clone());

        let entries = self.objects.entry(key).or_default();
        entries.push(obj);
        if entries.len() >= threshold {
            PoolAdd::ThresholdReached(entries.clone())
        } else {
            PoolAdd::Added(entries.len())
        }
    }

    /// Stop collecting for `key` once its certificate exists
    pub fn mark_certified(&mut self, key: &str) {
        self.objects.remove(key);
        self.certified.insert(key.into());
    }

    /// Number of distinct signers collected for `key`
    pub fn count(&self, key: &str) -> usize {
        self.objects.get(key).map_or(0, Vec::len)
    }

    /// Whether the certificate of `key` was built
    pub fn is_certified(&self, key: &str) -> bool {
        self.certified.contains(key)
    }

    /// Drop everything for rounds strictly below `round`
    pub fn clear_below(&mut self, round: Round) {
        self.objects.retain(|_, entries| entries.first().is_some_and(|obj| obj.round() >= round));
        self.first_seen.retain(|(r, _), _| *r >= round);
        // keys start with the round
        self.certified.retain(|key| {
            key.split(':').next().and_then(|r| r.parse::<Round>().ok()).is_some_and(|r| r >= round)
        });
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.objects.clear();
        self.first_seen.clear();
        self.certified.clear();
    }

    /// Number of keys with pending messages
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no message is pending
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Pool<Vote> {
    /// Block a signer first voted for in `round`
    pub fn first_vote(&self, round: Round, signer: &Address) -> Option<BlockInfo> {
        self.first_seen.get(&(round, *signer)).map(|vote| vote.proposed_block_info)
    }
}
