//! BRDPoS Consensus Engine
//!
//! Routes every operation to the legacy helpers or the v2 engine, depending on the block
//! number and the version byte of the header extra.

use crate::{
    config::BrdposConfig,
    constants::{EXTRA_V2_VERSION, VALIDATOR_CONTRACT_ADDR},
    errors::{BrdposError, BrdposResult},
    oracle::ValidatorOracle,
    v1,
    v2::{BrdposV2Engine, MissedRoundsMetadata},
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::{Address, U256};
use brc_primitives::BrcBlockHeader;
use core::fmt;
use tracing::{debug, info};

/// Consensus version of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusVersion {
    /// Legacy epoch based DPoS
    V1,
    /// BFT consensus with quorum certificates
    V2,
}

/// BRDPoS consensus engine
pub struct BrdposConsensus {
    v2: Arc<BrdposV2Engine>,
    oracle: Option<Arc<dyn ValidatorOracle>>,
}

impl fmt::Debug for BrdposConsensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrdposConsensus")
            .field("v2", &self.v2)
            .field("oracle", &self.oracle.is_some())
            .finish()
    }
}

impl BrdposConsensus {
    /// Create the router around a v2 engine
    pub fn new(v2: Arc<BrdposV2Engine>) -> Self {
        info!(
            target: "consensus::brdpos",
            switch_block = v2.config().v2.switch_block,
            "Initialized BRDPoS consensus engine"
        );
        Self { v2, oracle: None }
    }

    /// Read candidates from `oracle` at every v2 gap block
    pub fn with_oracle(mut self, oracle: Arc<dyn ValidatorOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Get the BRDPoS configuration
    pub fn config(&self) -> &BrdposConfig {
        self.v2.config()
    }

    /// The v2 engine
    pub const fn v2_engine(&self) -> &Arc<BrdposV2Engine> {
        &self.v2
    }

    /// Version of block `number`. With `extra`, a v2 block must also carry the v2 version byte.
    pub fn block_consensus_version(&self, number: u64, extra: Option<&[u8]>) -> ConsensusVersion {
        if !self.config().is_v2(number) {
            return ConsensusVersion::V1;
        }
        match extra {
            Some(extra) if extra.first() != Some(&EXTRA_V2_VERSION) => ConsensusVersion::V1,
            _ => ConsensusVersion::V2,
        }
    }

    fn header_version(&self, header: &BrcBlockHeader) -> ConsensusVersion {
        self.block_consensus_version(header.number, Some(&header.extra_data))
    }

    fn require_v2(&self, header: &BrcBlockHeader) -> BrdposResult<()> {
        match self.header_version(header) {
            ConsensusVersion::V2 => Ok(()),
            ConsensusVersion::V1 => Err(BrdposError::UnsupportedVersion(1)),
        }
    }

    /// Whether `signer` may propose on top of `parent`
    pub fn your_turn(&self, parent: &BrcBlockHeader, signer: Address) -> BrdposResult<bool> {
        match self.block_consensus_version(parent.number + 1, None) {
            ConsensusVersion::V2 => self.v2.your_turn(parent, signer),
            ConsensusVersion::V1 => Err(BrdposError::UnsupportedVersion(1)),
        }
    }

    /// Fill the consensus fields of a new header
    pub fn prepare(&self, header: &mut BrcBlockHeader) -> BrdposResult<()> {
        match self.block_consensus_version(header.number, None) {
            ConsensusVersion::V2 => self.v2.prepare(header),
            ConsensusVersion::V1 => Err(BrdposError::UnsupportedVersion(1)),
        }
    }

    /// Seal a prepared header
    pub fn seal(&self, header: &mut BrcBlockHeader) -> BrdposResult<()> {
        self.require_v2(header)?;
        self.v2.seal(header)
    }

    /// Verify a header against its parent
    pub fn verify_header(&self, header: &BrcBlockHeader, full_verify: bool) -> BrdposResult<()> {
        self.require_v2(header)?;
        self.v2.verify_header(header, full_verify)
    }

    /// Verify a batch of headers in order
    pub fn verify_headers(&self, headers: &[BrcBlockHeader], full_verify: bool) -> BrdposResult<()> {
        headers.iter().try_for_each(|header| self.verify_header(header, full_verify))
    }

    /// Producer of a sealed header
    pub fn author(&self, header: &BrcBlockHeader) -> BrdposResult<Address> {
        self.require_v2(header)?;
        self.v2.author(header)
    }

    /// Difficulty of the block following `parent`
    pub fn calc_difficulty(&self, parent: &BrcBlockHeader) -> BrdposResult<U256> {
        match self.block_consensus_version(parent.number + 1, None) {
            ConsensusVersion::V2 => Ok(self.v2.calc_difficulty()),
            ConsensusVersion::V1 => Err(BrdposError::UnsupportedVersion(1)),
        }
    }

    /// Whether `header` opens an epoch, and its epoch number
    pub fn is_epoch_switch(&self, header: &BrcBlockHeader) -> BrdposResult<(bool, u64)> {
        match self.header_version(header) {
            ConsensusVersion::V2 => self.v2.is_epoch_switch(header),
            ConsensusVersion::V1 => Ok(v1::is_epoch_switch(header.number, self.config().epoch)),
        }
    }

    /// Epoch switch block of the canonical block `number`, and its epoch number
    pub fn current_epoch_switch_block(&self, number: u64) -> BrdposResult<(u64, u64)> {
        match self.block_consensus_version(number, None) {
            ConsensusVersion::V2 => self.v2.current_epoch_switch_block(number),
            ConsensusVersion::V1 => Ok(v1::current_epoch_switch_block(number, self.config().epoch)),
        }
    }

    /// Masternodes in effect at `header`
    pub fn get_masternodes(&self, header: &BrcBlockHeader) -> BrdposResult<Vec<Address>> {
        match self.header_version(header) {
            ConsensusVersion::V2 => self.v2.get_masternodes(header),
            ConsensusVersion::V1 => {
                v1::get_masternodes(self.v2.chain(), header, self.config().epoch)
            }
        }
    }

    /// Masternodes recorded by an epoch switch header of either version
    pub fn get_masternodes_from_checkpoint_header(
        &self,
        header: &BrcBlockHeader,
    ) -> BrdposResult<Vec<Address>> {
        match self.header_version(header) {
            ConsensusVersion::V2 => self.v2.get_masternodes_from_epoch_switch_header(header),
            ConsensusVersion::V1 => v1::masternodes_from_checkpoint_header(header),
        }
    }

    /// Missed rounds of the epoch of `header`
    pub fn calculate_missing_rounds(
        &self,
        header: &BrcBlockHeader,
    ) -> BrdposResult<MissedRoundsMetadata> {
        self.require_v2(header)?;
        self.v2.calculate_missing_rounds(header)
    }

    /// Refuse a canonical switch to `new_head` that would revert a committed block, whatever
    /// the version of the new head
    pub fn check_reorg(&self, new_head: &BrcBlockHeader) -> BrdposResult<()> {
        self.v2.check_reorg(new_head)
    }

    /// Hook for every block accepted into the chain. Takes a snapshot at v2 gap blocks when an
    /// oracle is configured.
    pub fn on_block_inserted(&self, header: &BrcBlockHeader) -> BrdposResult<()> {
        if self.block_consensus_version(header.number, None) != ConsensusVersion::V2 {
            return Ok(());
        }
        let config = self.config();
        if !crate::is_gap_block(header.number, config.epoch, config.gap) {
            return Ok(());
        }
        let Some(oracle) = &self.oracle else {
            debug!(target: "consensus::brdpos", number = header.number, "No validator oracle, skipping snapshot");
            return Ok(());
        };
        let candidates = oracle.candidates(header.state_root, VALIDATOR_CONTRACT_ADDR)?;
        self.v2.update_masternodes(header, candidates)
    }
}
