//! BRDPoS V2 epoch switch resolution
//!
//! A header opens an epoch if it is the v2 switch block, if it certifies the switch block, or if
//! its parent's round lies before the first round of its own epoch. Every other header belongs
//! to the epoch of its parent. Resolved infos are cached by block hash.

use super::{BlockInfo, EpochSwitchInfo, Round, engine::BrdposV2Engine};
use crate::{
    errors::{BrdposError, BrdposResult},
    v1,
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::B256;
use brc_primitives::BrcBlockHeader;
use tracing::trace;

impl BrdposV2Engine {
    /// Epoch switch info of the epoch the block `hash` belongs to
    pub fn epoch_switch_info(&self, hash: &B256) -> BrdposResult<Arc<EpochSwitchInfo>> {
        if let Some(info) = self.epochs.lock().get(hash) {
            return Ok(info.clone());
        }
        let header = self.header(hash)?;
        self.epoch_switch_info_for_header(&header)
    }

    /// Epoch switch info of the epoch `header` belongs to. `header` itself does not need to be
    /// known to the chain reader, its ancestors do.
    pub fn epoch_switch_info_for_header(
        &self,
        header: &BrcBlockHeader,
    ) -> BrdposResult<Arc<EpochSwitchInfo>> {
        let mut walked = Vec::new();
        let mut hash = header.hash_slow();
        let mut current = header.clone();

        let info = loop {
            if let Some(info) = self.epochs.lock().get(&hash) {
                break info.clone();
            }
            if self.is_epoch_switch(&current)?.0 {
                break Arc::new(self.build_epoch_switch_info(&current, hash)?);
            }
            walked.push(hash);
            hash = current.parent_hash;
            current = self.header(&hash)?;
        };

        let mut epochs = self.epochs.lock();
        epochs.put(hash, info.clone());
        for walked_hash in walked {
            epochs.put(walked_hash, info.clone());
        }
        Ok(info)
    }

    fn build_epoch_switch_info(
        &self,
        header: &BrcBlockHeader,
        hash: B256,
    ) -> BrdposResult<EpochSwitchInfo> {
        let is_switch_block = header.number == self.config.v2.switch_block;
        let (masternodes, penalties, round, parent) = if is_switch_block {
            (v1::masternodes_from_checkpoint_header(header)?, Vec::new(), 0, None)
        } else {
            let extra = self.extra_fields(header)?;
            (
                header.validator_addresses(),
                header.penalty_addresses(),
                extra.round,
                Some(extra.quorum_cert.proposed_block_info),
            )
        };

        let snap = self.snapshots.get_snapshot(self.chain.as_ref(), header.number, false)?;
        let standby_nodes = if snap.next_epoch_candidates.len() == masternodes.len() {
            Vec::new()
        } else {
            snap.next_epoch_candidates
                .iter()
                .filter(|c| !masternodes.contains(c) && !penalties.contains(c))
                .copied()
                .collect()
        };

        trace!(
            target: "consensus::brdpos",
            number = header.number,
            round,
            masternodes = masternodes.len(),
            standby = standby_nodes.len(),
            "Resolved epoch switch block"
        );
        Ok(EpochSwitchInfo {
            masternodes,
            standby_nodes,
            penalties,
            epoch_switch_block_info: BlockInfo::new(hash, round, header.number),
            epoch_switch_parent_block_info: parent,
        })
    }

    /// Whether `header` opens an epoch, and its epoch number
    pub fn is_epoch_switch(&self, header: &BrcBlockHeader) -> BrdposResult<(bool, u64)> {
        let switch_block = self.config.v2.switch_block;
        if header.number == switch_block {
            return Ok((true, header.number / self.config.epoch));
        }

        let extra = self.extra_fields(header)?;
        let parent_round = extra.quorum_cert.round();
        let epoch_start = crate::epoch_start(extra.round, self.config.epoch);
        let epoch_num = self.config.epoch_number(extra.round);

        // the first v2 block certifies the switch block
        if extra.quorum_cert.proposed_block_info.number == switch_block {
            return Ok((true, epoch_num));
        }
        trace!(
            target: "consensus::brdpos",
            number = header.number,
            round = extra.round,
            parent_round,
            epoch_start,
            "Epoch switch check"
        );
        Ok((parent_round < epoch_start, epoch_num))
    }

    /// Whether a block proposed at `round` on top of `parent` opens an epoch
    pub fn is_epoch_switch_at_round(
        &self,
        round: Round,
        parent: &BrcBlockHeader,
    ) -> BrdposResult<bool> {
        if parent.number == self.config.v2.switch_block {
            return Ok(true);
        }
        let parent_round = self.extra_fields(parent)?.round;
        if round <= parent_round {
            return Ok(false);
        }
        Ok(parent_round < crate::epoch_start(round, self.config.epoch))
    }

    /// Number of the epoch switch block of the canonical block `number`, and the epoch number
    pub fn current_epoch_switch_block(&self, number: u64) -> BrdposResult<(u64, u64)> {
        let header = self
            .chain
            .header_by_number(number)
            .ok_or(BrdposError::HeaderNotFoundByNumber(number))?;
        let info = self.epoch_switch_info_for_header(&header)?;
        let switch = info.epoch_switch_block_info;
        Ok((switch.number, self.config.epoch_number(switch.round)))
    }

    /// Epoch switch infos of the epochs opened between `begin` and `end`, oldest first
    pub fn epoch_switch_info_between(
        &self,
        begin: &BrcBlockHeader,
        end: &BrcBlockHeader,
    ) -> BrdposResult<Vec<Arc<EpochSwitchInfo>>> {
        let mut infos = Vec::new();
        let mut hash = end.hash_slow();
        let mut number = end.number;

        while number > begin.number {
            let info = self.epoch_switch_info(&hash)?;
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            hash = parent.hash;
            number = info.epoch_switch_block_info.number;
            if number >= begin.number {
                infos.push(info);
            }
        }

        infos.reverse();
        Ok(infos)
    }

    /// Epoch switch info `limit` epochs before the one of block `hash`. Stops at the v2 switch
    /// block epoch.
    pub fn previous_epoch_switch_info_by_hash(
        &self,
        hash: &B256,
        limit: usize,
    ) -> BrdposResult<Arc<EpochSwitchInfo>> {
        let mut info = self.epoch_switch_info(hash)?;
        for _ in 0..limit {
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            info = self.epoch_switch_info(&parent.hash)?;
        }
        Ok(info)
    }
}
