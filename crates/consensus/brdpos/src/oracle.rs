//! Validator oracle: the candidate masternodes recorded by the validator contract.

use crate::errors::BrdposResult;
use alloc::vec::Vec;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// A masternode candidate and its total stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Masternode {
    /// Candidate address
    pub address: Address,
    /// Total stake behind the candidate
    pub stake: U256,
}

impl Masternode {
    /// Create a new candidate entry
    pub const fn new(address: Address, stake: U256) -> Self {
        Self { address, stake }
    }
}

/// Reads the candidate set from chain state. Only called at gap blocks.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ValidatorOracle: Send + Sync {
    /// Candidates recorded by the validator contract at `contract` in the state `state_root`
    fn candidates(&self, state_root: B256, contract: Address) -> BrdposResult<Vec<Masternode>>;
}

/// Order candidates by stake, highest first, breaking ties by address.
pub fn sort_candidates(mut candidates: Vec<Masternode>) -> Vec<Address> {
    candidates.sort_by(|a, b| b.stake.cmp(&a.stake).then_with(|| a.address.cmp(&b.address)));
    candidates.into_iter().map(|m| m.address).collect()
}
