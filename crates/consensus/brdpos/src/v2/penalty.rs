//! Penalties applied when the masternode set of a new epoch is computed.

use super::EpochSwitchInfo;
use crate::{
    chain::ChainReader,
    constants::MIN_MINER_BLOCK_PER_EPOCH,
    errors::{BrdposError, BrdposResult},
};
use alloc::vec::Vec;
use alloy_primitives::{Address, B256};
use hashbrown::HashMap;
use tracing::debug;

/// Decides which candidates are left out of the next epoch.
///
/// Never consulted for the first v2 epoch.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait PenaltyHook: core::fmt::Debug + Send + Sync {
    /// Penalized addresses for the epoch opened by block `number`, whose parent is
    /// `parent_hash`. `outgoing` describes the epoch being closed.
    fn penalties(
        &self,
        chain: &dyn ChainReader,
        outgoing: &EpochSwitchInfo,
        number: u64,
        parent_hash: B256,
        candidates: &[Address],
    ) -> BrdposResult<Vec<Address>>;
}

/// Penalizes outgoing masternodes that mined fewer than `min_blocks` blocks during their epoch.
#[derive(Debug, Clone, Copy)]
pub struct MissedBlocksPenalty {
    min_blocks: u64,
}

impl Default for MissedBlocksPenalty {
    fn default() -> Self {
        Self { min_blocks: MIN_MINER_BLOCK_PER_EPOCH }
    }
}

impl MissedBlocksPenalty {
    /// Penalty requiring at least `min_blocks` blocks per epoch
    pub const fn new(min_blocks: u64) -> Self {
        Self { min_blocks }
    }
}

impl PenaltyHook for MissedBlocksPenalty {
    fn penalties(
        &self,
        chain: &dyn ChainReader,
        outgoing: &EpochSwitchInfo,
        number: u64,
        parent_hash: B256,
        _candidates: &[Address],
    ) -> BrdposResult<Vec<Address>> {
        let switch_number = outgoing.epoch_switch_block_info.number;
        let mut mined: HashMap<Address, u64> = HashMap::new();

        let mut hash = parent_hash;
        loop {
            let header = chain.header_by_hash(&hash).ok_or(BrdposError::HeaderNotFound(hash))?;
            if header.number <= switch_number {
                break;
            }
            *mined.entry(header.beneficiary).or_default() += 1;
            hash = header.parent_hash;
        }

        let penalties: Vec<Address> = outgoing
            .masternodes
            .iter()
            .filter(|mn| mined.get(*mn).copied().unwrap_or_default() < self.min_blocks)
            .copied()
            .collect();
        debug!(
            target: "consensus::brdpos",
            number,
            outgoing_epoch = switch_number,
            penalties = penalties.len(),
            "Computed missed block penalties"
        );
        Ok(penalties)
    }
}
