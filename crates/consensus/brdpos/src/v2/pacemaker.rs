//! BRDPoS V2 pacemaker
//!
//! Round progression and the handlers of every consensus input:
//! - QCs advance the round to `qc.round + 1` and drive the three-chain commit rule
//! - TCs advance the round to `tc.round + 1`
//! - votes and timeouts are pooled until a certificate can be formed
//! - the local timer broadcasts a timeout, and a sync info every `timeout_sync_threshold`
//!   consecutive timeouts
//!
//! Handlers return the [`Action`]s the dispatcher has to perform.

use super::{
    BlockInfo, ConsensusMessage, EpochSwitchInfo, QuorumCert, Round, SyncInfo, Timeout,
    TimeoutCert, TimeoutForSign, Vote, VoteForSign,
    dispatcher::Action,
    engine::BrdposV2Engine,
    forensics::{ancestor_at, detect_ancestor_divergence, detect_equivocation},
    pool::PoolAdd,
    types::{timeout_sig_hash, vote_sig_hash},
    verification::{self, verify_timeout_message, verify_vote_message},
};
use crate::errors::{BrdposError, BrdposResult};
use alloc::{sync::Arc, vec, vec::Vec};
use brc_primitives::BrcBlockHeader;
use core::time::Duration;
use tracing::{debug, info, trace, warn};

/// Round state of the local node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacemakerState {
    /// Round the node is currently in
    pub current_round: Round,
    /// Highest QC seen
    pub highest_qc: QuorumCert,
    /// Highest TC seen
    pub highest_tc: Option<TimeoutCert>,
    /// QC embedded in the block certified by the highest QC
    pub lock_qc: Option<QuorumCert>,
    /// Last round this node voted in
    pub highest_voted_round: Round,
    /// Last round this node sealed a block in
    pub highest_self_mined_round: Round,
    /// Highest committed block
    pub highest_commit_block: Option<BlockInfo>,
    /// Local timeouts since the last round change
    pub timeout_count: u64,
    /// Whether `initial` ran
    pub initialised: bool,
}

impl BrdposV2Engine {
    /// Copy of the pacemaker state
    pub fn pacemaker_state(&self) -> PacemakerState {
        self.state.read().clone()
    }

    /// Current round
    pub fn current_round(&self) -> Round {
        self.state.read().current_round
    }

    /// Highest QC seen
    pub fn highest_qc(&self) -> QuorumCert {
        self.state.read().highest_qc.clone()
    }

    /// Highest committed block
    pub fn highest_commit_block(&self) -> Option<BlockInfo> {
        self.state.read().highest_commit_block
    }

    /// Highest certificates known to this node
    pub fn sync_info(&self) -> SyncInfo {
        let state = self.state.read();
        SyncInfo {
            highest_quorum_cert: state.highest_qc.clone(),
            highest_timeout_cert: state.highest_tc.clone(),
        }
    }

    /// Initialise the round state from `header`. Does nothing once initialised.
    ///
    /// On the v2 switch block the highest QC is the unsigned round 0 certificate of the switch
    /// block and the round is 1. Otherwise the QC carried by `header` is processed. The first v2
    /// snapshot is created from the switch block checkpoint if missing.
    pub fn initial(&self, header: &BrcBlockHeader) -> BrdposResult<Vec<Action>> {
        if self.state.read().initialised {
            return Ok(Vec::new());
        }
        info!(target: "consensus::brdpos", number = header.number, "Initialising v2 consensus");

        let switch_block = self.config.v2.switch_block;
        let mut actions = if header.number == switch_block {
            let block_info = BlockInfo::new(header.hash_slow(), 0, header.number);
            let qc = QuorumCert::new(block_info, self.config.gap_number(header.number));
            self.state.write().highest_qc = qc;
            self.set_new_round(1, false)
        } else {
            let extra = self.extra_fields(header)?;
            self.process_qc(&extra.quorum_cert, false)?
        };

        let last_gap = switch_block.saturating_sub(self.config.gap);
        let gap_header = self
            .chain
            .header_by_number(last_gap)
            .ok_or(BrdposError::HeaderNotFoundByNumber(last_gap))?;
        let gap_hash = gap_header.hash_slow();
        match self.snapshots.get_by_hash(&gap_hash) {
            Ok(_) => {}
            Err(BrdposError::SnapshotNotFound(_)) => {
                let checkpoint = self
                    .chain
                    .header_by_number(switch_block)
                    .ok_or(BrdposError::HeaderNotFoundByNumber(switch_block))?;
                let masternodes = self.get_masternodes_from_epoch_switch_header(&checkpoint)?;
                info!(
                    target: "consensus::brdpos",
                    number = last_gap,
                    masternodes = masternodes.len(),
                    "Creating first v2 snapshot"
                );
                self.snapshots.store(super::SnapshotV2::new(last_gap, gap_hash, masternodes))?;
            }
            Err(err) => return Err(err),
        }

        let round = {
            let mut state = self.state.write();
            state.initialised = true;
            state.current_round
        };
        if !actions.iter().any(|a| matches!(a, Action::ResetTimer { .. })) {
            actions.push(self.timer_action(round));
        }
        Ok(actions)
    }

    /// Run `initial` on the current head if it has not run yet
    pub(super) fn ensure_initialised(&self) -> BrdposResult<Vec<Action>> {
        if self.state.read().initialised {
            return Ok(Vec::new());
        }
        let head = self.current_header()?;
        self.initial(&head)
    }

    fn timer_action(&self, round: Round) -> Action {
        Action::ResetTimer {
            round,
            after: Duration::from_secs(self.round_config(round).timeout_period),
        }
    }

    /// Move to `round`, reset the timer and the timeout pool.
    ///
    /// A round never moves backwards. With `syncing` no new round notification is emitted.
    pub(super) fn set_new_round(&self, round: Round, syncing: bool) -> Vec<Action> {
        {
            let mut state = self.state.write();
            if round <= state.current_round {
                return Vec::new();
            }
            state.current_round = round;
            state.timeout_count = 0;
        }
        self.timeouts.lock().clear();
        self.votes.lock().clear_below(round.saturating_sub(self.config.epoch));
        info!(target: "consensus::brdpos", round, syncing, "New round");

        let mut actions = vec![self.timer_action(round)];
        if !syncing {
            actions.push(Action::NewRound(round));
        }
        actions
    }

    /// Adopt a verified QC: update the highest and lock QC, try to commit, and advance the
    /// round if the QC is at or above it.
    ///
    /// The certified block must be known.
    pub fn process_qc(&self, qc: &QuorumCert, syncing: bool) -> BrdposResult<Vec<Action>> {
        let mut actions = Vec::new();
        let block = self.header(&qc.proposed_block_info.hash)?;
        let block_round = self.round_of(&block)?;
        let block_qc = if block.number > self.config.v2.switch_block {
            Some(self.extra_fields(&block)?.quorum_cert)
        } else {
            None
        };

        let committed = self.state.read().highest_commit_block;
        if let Some(committed) = committed {
            match detect_ancestor_divergence(self.chain.as_ref(), &committed, qc) {
                Ok(Some(event)) => actions.push(Action::Forensics(event)),
                Ok(None) => {}
                Err(err) => debug!(target: "consensus::brdpos", %err, "Ancestor check failed"),
            }
        }

        {
            let mut state = self.state.write();
            if qc.round() > state.highest_qc.round() {
                trace!(target: "consensus::brdpos", round = qc.round(), "New highest QC");
                state.highest_qc = qc.clone();
            }
            if let Some(block_qc) = block_qc {
                if state.lock_qc.as_ref().is_none_or(|lock| block_qc.round() > lock.round()) {
                    state.lock_qc = Some(block_qc);
                }
            }
        }

        self.commit_blocks(&block, block_round)?;

        if qc.round() >= self.current_round() {
            actions.extend(self.set_new_round(qc.round() + 1, syncing));
        }
        Ok(actions)
    }

    /// Three-chain commit rule: a QC on `block` commits its grandparent if the three rounds are
    /// consecutive.
    pub(super) fn commit_blocks(
        &self,
        block: &BrcBlockHeader,
        block_round: Round,
    ) -> BrdposResult<bool> {
        // nothing to commit across the switch block
        if block.number.saturating_sub(2) <= self.config.v2.switch_block {
            return Ok(false);
        }

        let parent = self.header(&block.parent_hash)?;
        if self.round_of(&parent)? + 1 != block_round {
            return Ok(false);
        }
        let grandparent = self.header(&parent.parent_hash)?;
        let grandparent_round = self.round_of(&grandparent)?;
        if grandparent_round + 2 != block_round {
            return Ok(false);
        }

        let mut state = self.state.write();
        let advances = state.highest_commit_block.is_none_or(|commit| {
            commit.round < grandparent_round && commit.number < grandparent.number
        });
        if !advances {
            return Ok(false);
        }
        let committed = BlockInfo::new(parent.parent_hash, grandparent_round, grandparent.number);
        state.highest_commit_block = Some(committed);
        info!(
            target: "consensus::brdpos",
            number = committed.number,
            round = committed.round,
            hash = %committed.hash,
            "Committed block"
        );
        Ok(true)
    }

    /// Adopt a verified TC
    pub fn process_tc(&self, tc: &TimeoutCert, syncing: bool) -> Vec<Action> {
        let current = {
            let mut state = self.state.write();
            if state.highest_tc.as_ref().is_none_or(|highest| tc.round > highest.round) {
                state.highest_tc = Some(tc.clone());
            }
            state.current_round
        };
        if tc.round >= current { self.set_new_round(tc.round + 1, syncing) } else { Vec::new() }
    }

    /// Handle a vote from the network
    pub fn handle_vote(&self, mut vote: Vote) -> BrdposResult<Vec<Action>> {
        let current = self.current_round();
        let round = vote.proposed_block_info.round;
        if round < current || round > current + 1 {
            return Err(BrdposError::StaleMessage { round, current });
        }

        let info = match self.epoch_switch_info(&vote.proposed_block_info.hash) {
            Err(BrdposError::HeaderNotFound(_)) => return Err(BrdposError::UnknownAncestor),
            info => info?,
        };
        let expected = self.config.gap_number(info.epoch_switch_block_info.number);
        if vote.gap_number != expected {
            return Err(BrdposError::GapNumberMismatch { expected, got: vote.gap_number });
        }
        let signer = verify_vote_message(&vote, &info.masternodes)?;
        vote.set_signer(signer);
        self.add_vote(vote, &info)
    }

    /// Pool a vote whose signer is known
    fn add_vote(&self, vote: Vote, info: &EpochSwitchInfo) -> BrdposResult<Vec<Action>> {
        let round = vote.proposed_block_info.round;
        let threshold = self.round_config(round).threshold(info.masternodes_len());
        let added = self.votes.lock().add(vote.clone(), threshold);

        match added {
            PoolAdd::Ignored => Ok(Vec::new()),
            PoolAdd::Conflict(first) => {
                let signer = vote.signer().unwrap_or_default();
                Ok(detect_equivocation(
                    signer,
                    &first.proposed_block_info,
                    &vote.proposed_block_info,
                )
                .map(Action::Forensics)
                .into_iter()
                .collect())
            }
            PoolAdd::Added(count) => {
                trace!(target: "consensus::brdpos", round, count, threshold, "Vote pooled");
                Ok(Vec::new())
            }
            PoolAdd::ThresholdReached(votes) => {
                self.verify_block_info(&vote.proposed_block_info, None)?;
                let mut qc = QuorumCert::new(vote.proposed_block_info, vote.gap_number);
                for pooled in votes {
                    qc.add_signature(pooled.signature);
                }
                self.votes.lock().mark_certified(&vote.pool_key());
                info!(
                    target: "consensus::brdpos",
                    round,
                    number = vote.proposed_block_info.number,
                    signatures = qc.signature_count(),
                    "Vote threshold reached, formed QC"
                );
                self.process_qc(&qc, false)
            }
        }
    }

    /// Handle a timeout from the network
    pub fn handle_timeout(&self, mut timeout: Timeout) -> BrdposResult<Vec<Action>> {
        let current = self.current_round();
        if timeout.round != current {
            return Err(BrdposError::StaleMessage { round: timeout.round, current });
        }

        // the gap number must name a snapshot
        self.get_snapshot(timeout.gap_number, true)?;
        let info = self.tc_epoch_info(timeout.round)?;
        let signer = verify_timeout_message(&timeout, &info.masternodes)?;
        timeout.set_signer(signer);
        self.add_timeout(timeout, &info)
    }

    /// Pool a timeout whose signer is known
    fn add_timeout(&self, timeout: Timeout, info: &EpochSwitchInfo) -> BrdposResult<Vec<Action>> {
        let threshold = self.round_config(timeout.round).threshold(info.masternodes_len());
        let added = self.timeouts.lock().add(timeout.clone(), threshold);

        let PoolAdd::ThresholdReached(timeouts) = added else {
            trace!(target: "consensus::brdpos", round = timeout.round, "Timeout pooled");
            return Ok(Vec::new());
        };

        let mut tc = TimeoutCert::new(timeout.round, timeout.gap_number);
        for pooled in timeouts {
            tc.add_signature(pooled.signature);
        }
        self.timeouts.lock().mark_certified(&timeout.pool_key());
        info!(
            target: "consensus::brdpos",
            round = tc.round,
            signatures = tc.signatures.len(),
            "Timeout threshold reached, formed TC"
        );

        let mut actions = self.process_tc(&tc, false);
        actions.push(Action::Broadcast(ConsensusMessage::SyncInfo(self.sync_info())));
        Ok(actions)
    }

    /// Epoch info governing timeouts of `round`: the latest epoch known on the canonical chain
    /// that started at or before `round`.
    fn tc_epoch_info(&self, round: Round) -> BrdposResult<Arc<EpochSwitchInfo>> {
        let head = self.current_header()?;
        let mut info = self.epoch_switch_info_for_header(&head)?;
        while info.epoch_switch_block_info.round > round {
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            info = self.epoch_switch_info(&parent.hash)?;
        }
        Ok(info)
    }

    /// Verify a TC: its gap number must name a snapshot, and its signers must be masternodes of
    /// its round's epoch reaching that epoch's threshold.
    pub fn verify_tc(&self, tc: &TimeoutCert) -> BrdposResult<()> {
        self.get_snapshot(tc.gap_number, true)?;
        let info = self.tc_epoch_info(tc.round)?;
        let threshold = self.round_config(tc.round).threshold(info.masternodes_len());
        verification::verify_tc(tc, &info.masternodes, threshold)
    }

    /// Handle the highest certificates of a peer
    pub fn handle_sync_info(&self, sync_info: SyncInfo) -> BrdposResult<Vec<Action>> {
        let current = self.current_round();
        let qc = &sync_info.highest_quorum_cert;
        let tc = sync_info.highest_timeout_cert.as_ref();
        if qc.round() < current && tc.is_none_or(|tc| tc.round < current) {
            trace!(target: "consensus::brdpos", qc_round = qc.round(), current, "Sync info behind");
            return Ok(Vec::new());
        }

        if let Some(tc) = tc {
            self.verify_tc(tc)?;
        }
        let qc_known = self.chain.header_by_hash(&qc.proposed_block_info.hash).is_some();
        if qc_known {
            self.verify_qc(qc, None, true)?;
        }

        let mut actions = Vec::new();
        if qc_known {
            actions.extend(self.process_qc(qc, true)?);
        } else {
            debug!(target: "consensus::brdpos", hash = %qc.proposed_block_info.hash, "QC for unknown block queued");
            self.pending_qcs.lock().put(qc.proposed_block_info.hash, qc.clone());
        }
        if let Some(tc) = tc {
            actions.extend(self.process_tc(tc, true));
        }
        Ok(actions)
    }

    /// Handle a QC learned outside of a block, e.g. from block import
    pub fn handle_quorum_cert(&self, qc: QuorumCert) -> BrdposResult<Vec<Action>> {
        if self.chain.header_by_hash(&qc.proposed_block_info.hash).is_none() {
            self.pending_qcs.lock().put(qc.proposed_block_info.hash, qc);
            return Err(BrdposError::UnknownAncestor);
        }
        self.verify_qc(&qc, None, true)?;
        self.process_qc(&qc, false)
    }

    /// Handle a block accepted into the chain: process its QC and vote for it if allowed
    pub fn handle_proposed_block(&self, header: &BrcBlockHeader) -> BrdposResult<Vec<Action>> {
        let mut actions = self.ensure_initialised()?;
        let extra = self.extra_fields(header)?;
        let hash = header.hash_slow();
        let block_info = BlockInfo::new(hash, extra.round, header.number);

        actions.extend(self.process_qc(&extra.quorum_cert, false)?);

        let pending = self.pending_qcs.lock().pop(&hash);
        if let Some(pending) = pending {
            match self
                .verify_qc(&pending, Some(header), true)
                .and_then(|()| self.process_qc(&pending, false))
            {
                Ok(more) => actions.extend(more),
                Err(err) => debug!(target: "consensus::brdpos", %err, "Dropped queued QC"),
            }
        }

        if !self.allowed_to_vote(header)? {
            return Ok(actions);
        }
        if self.voting_rule(&block_info, &extra.quorum_cert)? {
            actions.extend(self.send_vote(block_info, header)?);
        } else {
            debug!(target: "consensus::brdpos", round = extra.round, number = header.number, "Voting rule not satisfied");
        }
        Ok(actions)
    }

    fn allowed_to_vote(&self, header: &BrcBlockHeader) -> BrdposResult<bool> {
        let Some(signer) = self.signer_address() else { return Ok(false) };
        Ok(self.epoch_switch_info_for_header(header)?.masternodes.contains(&signer))
    }

    /// HotStuff voting rule: one vote per round, only for the current round, and only for blocks
    /// that extend the lock or carry a QC newer than it.
    pub(super) fn voting_rule(
        &self,
        block_info: &BlockInfo,
        qc: &QuorumCert,
    ) -> BrdposResult<bool> {
        let (current, voted, lock) = {
            let state = self.state.read();
            (
                state.current_round,
                state.highest_voted_round,
                state.lock_qc.as_ref().map(|lock| lock.proposed_block_info),
            )
        };
        if current <= voted || block_info.round != current {
            return Ok(false);
        }
        let Some(lock) = lock else { return Ok(true) };
        if qc.round() > lock.round {
            return Ok(true);
        }
        self.is_extending(block_info, &lock)
    }

    fn is_extending(&self, block: &BlockInfo, ancestor: &BlockInfo) -> BrdposResult<bool> {
        if block.number < ancestor.number {
            return Ok(false);
        }
        Ok(ancestor_at(self.chain.as_ref(), block.hash, ancestor.number)? == ancestor.hash)
    }

    fn send_vote(
        &self,
        block_info: BlockInfo,
        header: &BrcBlockHeader,
    ) -> BrdposResult<Vec<Action>> {
        let signer = self.local_signer()?.clone();
        let info = self.epoch_switch_info_for_header(header)?;
        let gap_number = self.config.gap_number(info.epoch_switch_block_info.number);
        let signature =
            signer.sign_hash(&vote_sig_hash(&VoteForSign { proposed_block_info: block_info, gap_number }))?;
        {
            let mut state = self.state.write();
            state.highest_voted_round = state.current_round;
        }

        let mut vote = Vote::new(block_info, signature, gap_number);
        vote.set_signer(signer.address());
        debug!(target: "consensus::brdpos", round = block_info.round, number = block_info.number, "Voting for block");

        let mut actions = self.add_vote(vote.clone(), &info)?;
        actions.push(Action::Broadcast(ConsensusMessage::Vote(vote)));
        Ok(actions)
    }

    /// Local round timer fired. Always re-arms the timer.
    pub fn on_local_timeout(&self) -> Vec<Action> {
        let mut actions = match self.send_timeout() {
            Ok(actions) => actions,
            Err(err) => {
                debug!(target: "consensus::brdpos", %err, "Timeout not sent");
                Vec::new()
            }
        };
        if !actions.iter().any(|a| matches!(a, Action::ResetTimer { .. })) {
            actions.push(self.timer_action(self.current_round()));
        }
        actions
    }

    fn send_timeout(&self) -> BrdposResult<Vec<Action>> {
        let head = self.current_header()?;
        let info = self.epoch_switch_info_for_header(&head)?;
        let Some(signer) = self.signer.clone() else { return Ok(Vec::new()) };
        if !info.masternodes.contains(&signer.address()) {
            trace!(target: "consensus::brdpos", "Not a masternode, skipping timeout");
            return Ok(Vec::new());
        }

        let round = self.current_round();
        // a block proposed after the timeout would open a new epoch
        let gap_number = if self.is_epoch_switch_at_round(round, &head)? {
            self.config.gap_number(head.number + 1)
        } else {
            self.config.gap_number(info.epoch_switch_block_info.number)
        };
        let signature = signer.sign_hash(&timeout_sig_hash(&TimeoutForSign { round, gap_number }))?;
        let mut timeout = Timeout::new(round, signature, gap_number);
        timeout.set_signer(signer.address());
        warn!(target: "consensus::brdpos", round, gap_number, "Round timed out");

        let tc_info = self.tc_epoch_info(round)?;
        let mut actions = self.add_timeout(timeout.clone(), &tc_info)?;
        actions.push(Action::Broadcast(ConsensusMessage::Timeout(timeout)));

        let count = {
            let mut state = self.state.write();
            // a TC formed by our own timeout already moved the round on
            if state.current_round != round {
                return Ok(actions);
            }
            state.timeout_count += 1;
            state.timeout_count
        };
        if count % self.round_config(round).timeout_sync_threshold.max(1) == 0 {
            info!(target: "consensus::brdpos", count, "Timeout sync threshold reached, sending sync info");
            actions.push(Action::Broadcast(ConsensusMessage::SyncInfo(self.sync_info())));
        }
        Ok(actions)
    }
}
