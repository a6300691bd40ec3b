//! BRDPoS V2 Engine Implementation
//!
//! This module holds the v2 engine object and the proposal pipeline:
//! - Leader selection and the `your_turn` decision
//! - Header preparation and sealing
//! - Header, QC and block info verification
//! - Masternode calculation for epoch switch blocks
//!
//! Epoch switch resolution lives in `epoch_switch`, round progression in `pacemaker`.

use super::{
    BlockInfo, EpochSwitchInfo, ExtraFieldsV2, MissedRoundInfo, MissedRoundsMetadata, QuorumCert,
    Round, Timeout, Vote,
    dispatcher::Action,
    forensics::ancestor_at,
    pacemaker::PacemakerState,
    penalty::PenaltyHook,
    pool::Pool,
    proposer::{leader_index, select_proposer},
    snapshot::{SnapshotStore, SnapshotV2},
    types::{decode_extra_fields_v2, encode_extra_fields_v2},
    verification,
};
use crate::{
    chain::ChainReader,
    config::{BrdposConfig, RoundConfig},
    constants::{
        ALLOWED_FUTURE_BLOCK_TIME, INMEMORY_EPOCHS, INMEMORY_SNAPSHOTS, INMEMORY_VERIFIED_HEADERS,
        PENDING_QUORUM_CERTS,
    },
    crypto::{ConsensusSigner, header_sig_hash, recover_header_signer, seal_header, verify_signature},
    db::KeyValueStore,
    errors::{BrdposError, BrdposResult},
    oracle::{Masternode, sort_candidates},
    v1,
};
use alloc::{format, sync::Arc, vec::Vec};
use alloy_primitives::{Address, B64, B256, U256};
use brc_primitives::{ADDRESS_LENGTH, BrcBlockHeader, pack_addresses};
use core::{fmt, num::NonZeroUsize};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Source of the wall clock, in unix seconds
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait Clock: fmt::Debug + Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> u64;
}

/// [`Clock`] backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
    }
}

const fn cache_capacity(size: usize) -> NonZeroUsize {
    match NonZeroUsize::new(size) {
        Some(size) => size,
        None => NonZeroUsize::MIN,
    }
}

/// BRDPoS V2 Engine
///
/// Owns the pacemaker state, the vote and timeout pools and the epoch and snapshot caches.
/// Mutating handlers are meant to be driven by a single [`Dispatcher`](super::Dispatcher);
/// queries can be called from anywhere.
pub struct BrdposV2Engine {
    pub(super) config: BrdposConfig,
    pub(super) chain: Arc<dyn ChainReader>,
    pub(super) snapshots: SnapshotStore,
    pub(super) signer: Option<Arc<dyn ConsensusSigner>>,
    pub(super) penalty_hook: Option<Arc<dyn PenaltyHook>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) state: RwLock<PacemakerState>,
    pub(super) epochs: Mutex<LruCache<B256, Arc<EpochSwitchInfo>>>,
    pub(super) verified_headers: Mutex<LruCache<B256, ()>>,
    /// QCs received before the block they certify
    pub(super) pending_qcs: Mutex<LruCache<B256, QuorumCert>>,
    pub(super) votes: Mutex<Pool<Vote>>,
    pub(super) timeouts: Mutex<Pool<Timeout>>,
    /// Actions produced outside the dispatcher, e.g. by the lazy initialisation in `your_turn`
    pub(super) deferred: Mutex<Vec<Action>>,
}

impl fmt::Debug for BrdposV2Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrdposV2Engine")
            .field("config", &self.config)
            .field("signer", &self.signer.as_ref().map(|s| s.address()))
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl BrdposV2Engine {
    /// Create a new V2 engine.
    ///
    /// Fails with [`BrdposError::EpochMisconfigured`] if the v2 switch block is not an epoch
    /// boundary.
    pub fn new(
        config: BrdposConfig,
        chain: Arc<dyn ChainReader>,
        db: Arc<dyn KeyValueStore>,
    ) -> BrdposResult<Self> {
        config.validate()?;

        let snapshots =
            SnapshotStore::new(db, cache_capacity(INMEMORY_SNAPSHOTS), config.epoch, config.gap);

        info!(
            target: "consensus::brdpos",
            epoch = config.epoch,
            gap = config.gap,
            switch_block = config.v2.switch_block,
            "Initialized BRDPoS v2 engine"
        );

        Ok(Self {
            config,
            chain,
            snapshots,
            signer: None,
            penalty_hook: None,
            clock: Arc::new(SystemClock),
            state: RwLock::new(PacemakerState::default()),
            epochs: Mutex::new(LruCache::new(cache_capacity(INMEMORY_EPOCHS))),
            verified_headers: Mutex::new(LruCache::new(cache_capacity(INMEMORY_VERIFIED_HEADERS))),
            pending_qcs: Mutex::new(LruCache::new(cache_capacity(PENDING_QUORUM_CERTS))),
            votes: Mutex::new(Pool::new()),
            timeouts: Mutex::new(Pool::new()),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Set the local signer
    pub fn with_signer(mut self, signer: Arc<dyn ConsensusSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Set the penalty hook consulted at epoch switches
    pub fn with_penalty_hook(mut self, hook: Arc<dyn PenaltyHook>) -> Self {
        self.penalty_hook = Some(hook);
        self
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the BRDPoS configuration
    pub const fn config(&self) -> &BrdposConfig {
        &self.config
    }

    /// Header chain the engine reads from
    pub fn chain(&self) -> &dyn ChainReader {
        self.chain.as_ref()
    }

    /// Address of the local signer, if any
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    /// Round config in effect at `round`
    pub fn round_config(&self, round: Round) -> RoundConfig {
        self.config.v2.config(round)
    }

    /// Current unix time according to the engine clock
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Actions produced outside the dispatcher since the last call
    pub fn take_deferred_actions(&self) -> Vec<Action> {
        core::mem::take(&mut *self.deferred.lock())
    }

    pub(super) fn local_signer(&self) -> BrdposResult<&Arc<dyn ConsensusSigner>> {
        self.signer.as_ref().ok_or(BrdposError::SignerNotAuthorized)
    }

    pub(super) fn header(&self, hash: &B256) -> BrdposResult<BrcBlockHeader> {
        self.chain.header_by_hash(hash).ok_or(BrdposError::HeaderNotFound(*hash))
    }

    pub(super) fn current_header(&self) -> BrdposResult<BrcBlockHeader> {
        self.chain.current_header().ok_or_else(|| BrdposError::Custom("chain has no head".into()))
    }

    /// Decode the consensus fields of a v2 header
    pub fn extra_fields(&self, header: &BrcBlockHeader) -> BrdposResult<ExtraFieldsV2> {
        decode_extra_fields_v2(&header.extra_data)
    }

    /// Round of a header. The v2 switch block and legacy blocks are round 0.
    pub fn round_of(&self, header: &BrcBlockHeader) -> BrdposResult<Round> {
        if header.number <= self.config.v2.switch_block {
            return Ok(0);
        }
        Ok(self.extra_fields(header)?.round)
    }

    /// Whether `signer` is the leader of the current round on top of `parent`.
    ///
    /// Runs the lazy initialisation on first use. Returns `false` while the mine period of the
    /// current round has not elapsed since `parent`.
    pub fn your_turn(&self, parent: &BrcBlockHeader, signer: Address) -> BrdposResult<bool> {
        if !self.state.read().initialised {
            let actions = self.initial(parent)?;
            self.deferred.lock().extend(actions);
        }

        let round = self.current_round();
        let mine_period = self.round_config(round).mine_period;
        let now = self.clock.now();
        if now < parent.timestamp.saturating_add(mine_period) {
            trace!(
                target: "consensus::brdpos",
                round,
                waited = now.saturating_sub(parent.timestamp),
                mine_period,
                "Not yet time to mine"
            );
            return Ok(false);
        }
        self.is_leader(round, parent, signer)
    }

    /// Leader check of `round` on top of `parent`, without the mine period wait
    pub(super) fn is_leader(
        &self,
        round: Round,
        parent: &BrcBlockHeader,
        signer: Address,
    ) -> BrdposResult<bool> {
        if round <= self.state.read().highest_self_mined_round {
            return Err(BrdposError::AlreadyMined);
        }

        let masternodes = if self.is_epoch_switch_at_round(round, parent)? {
            self.calc_masternodes(parent.number + 1, parent.hash_slow(), round)?.0
        } else {
            self.get_masternodes(parent)?
        };
        if masternodes.is_empty() {
            return Err(BrdposError::MasternodesNotFound);
        }
        if !masternodes.contains(&signer) {
            debug!(target: "consensus::brdpos", %signer, round, "Signer is not a masternode");
            return Ok(false);
        }

        let leader = select_proposer(round, self.config.epoch, &masternodes)?;
        trace!(target: "consensus::brdpos", round, %leader, %signer, "Leader of round");
        Ok(leader == signer)
    }

    /// Fill the consensus fields of a header built on the highest QC block
    pub fn prepare(&self, header: &mut BrcBlockHeader) -> BrdposResult<()> {
        let (round, highest_qc) = {
            let state = self.state.read();
            (state.current_round, state.highest_qc.clone())
        };

        if header.parent_hash != highest_qc.proposed_block_info.hash {
            warn!(
                target: "consensus::brdpos",
                parent = %header.parent_hash,
                highest_qc = %highest_qc.proposed_block_info.hash,
                "Parent is not the highest QC block"
            );
            return Err(BrdposError::NotReadyToPropose);
        }
        let parent = self
            .chain
            .header_by_hash(&header.parent_hash)
            .filter(|p| p.number + 1 == header.number)
            .ok_or(BrdposError::UnknownAncestor)?;

        let signer = self.local_signer()?.address();
        if !self.is_leader(round, &parent, signer)? {
            return Err(BrdposError::NotReadyToPropose);
        }
        let mine_period = self.round_config(round).mine_period;
        let now = self.clock.now();
        if now < parent.timestamp.saturating_add(mine_period) {
            return Err(BrdposError::NotReadyToMine);
        }

        header.extra_data = encode_extra_fields_v2(round, &highest_qc);
        header.nonce = B64::ZERO;
        header.difficulty = self.calc_difficulty();
        header.mix_hash = B256::ZERO;

        if self.is_epoch_switch_at_round(round, &parent)? {
            let (masternodes, penalties) =
                self.calc_masternodes(header.number, header.parent_hash, round)?;
            header.validators = pack_addresses(&masternodes);
            header.penalties = pack_addresses(&penalties);
        }

        header.timestamp = parent.timestamp.saturating_add(mine_period).max(now);

        if header.beneficiary != signer {
            return Err(BrdposError::CoinbaseMismatch);
        }
        debug!(target: "consensus::brdpos", number = header.number, round, "Prepared header");
        Ok(())
    }

    /// Sign a prepared header with the local signer
    pub fn seal(&self, header: &mut BrcBlockHeader) -> BrdposResult<()> {
        let signer = self.local_signer()?.clone();
        let round = self.extra_fields(header)?.round;
        {
            let mut state = self.state.write();
            if round <= state.highest_self_mined_round {
                return Err(BrdposError::AlreadyMined);
            }
            state.highest_self_mined_round = round;
        }
        seal_header(header, signer.as_ref())?;
        info!(target: "consensus::brdpos", number = header.number, round, "Sealed block");
        Ok(())
    }

    /// Producer of a sealed v2 header
    pub fn author(&self, header: &BrcBlockHeader) -> BrdposResult<Address> {
        recover_header_signer(header)
    }

    /// Difficulty of every v2 block
    pub fn calc_difficulty(&self) -> U256 {
        U256::from(1)
    }

    /// Verify a v2 header against its parent.
    ///
    /// `full_verify` additionally rejects headers from the future and checks the signatures of
    /// the embedded QC.
    pub fn verify_header(&self, header: &BrcBlockHeader, full_verify: bool) -> BrdposResult<()> {
        let hash = header.hash_slow();
        if self.verified_headers.lock().contains(&hash) {
            return Ok(());
        }

        if header.validator.is_empty() {
            return Err(BrdposError::MissingSeal);
        }
        let latest = self.clock.now().saturating_add(ALLOWED_FUTURE_BLOCK_TIME);
        if full_verify && header.timestamp > latest {
            return Err(BrdposError::InvalidTimestamp);
        }

        let extra = self.extra_fields(header)?;
        let qc = &extra.quorum_cert;
        if extra.round <= qc.round() {
            return Err(BrdposError::RoundInvalid { round: extra.round, qc_round: qc.round() });
        }
        if header.nonce != B64::ZERO {
            return Err(BrdposError::InvalidNonce);
        }
        if header.mix_hash != B256::ZERO {
            return Err(BrdposError::InvalidMixDigest);
        }
        if header.difficulty != self.calc_difficulty() {
            return Err(BrdposError::InvalidDifficulty);
        }

        let parent = self
            .chain
            .header_by_hash(&header.parent_hash)
            .filter(|p| p.number + 1 == header.number)
            .ok_or(BrdposError::UnknownAncestor)?;
        // rounds strictly increase along the chain
        let parent_round = self.round_of(&parent)?;
        if parent.number > self.config.v2.switch_block && extra.round <= parent_round {
            return Err(BrdposError::RoundInvalid { round: extra.round, qc_round: parent_round });
        }

        // the QC certifies the parent or one of its ancestors
        let certified = qc.proposed_block_info;
        if certified.number > parent.number ||
            ancestor_at(self.chain.as_ref(), parent.hash_slow(), certified.number)? !=
                certified.hash
        {
            return Err(BrdposError::InvalidBlockInfo(format!(
                "QC block {} is not an ancestor of block {}",
                certified.number, header.number
            )));
        }
        self.verify_qc(qc, Some(&parent), full_verify)?;

        let mine_period = self.round_config(extra.round).mine_period;
        if parent.timestamp.saturating_add(mine_period) > header.timestamp {
            return Err(BrdposError::InvalidTimestamp);
        }

        if self.is_epoch_switch(header)?.0 {
            if header.validators.is_empty() || header.validators.len() % ADDRESS_LENGTH != 0 {
                return Err(BrdposError::ValidatorsNotLegit);
            }
            if header.penalties.len() % ADDRESS_LENGTH != 0 {
                return Err(BrdposError::PenaltiesNotLegit);
            }
            let (masternodes, penalties) =
                self.calc_masternodes(header.number, header.parent_hash, extra.round)?;
            if masternodes != header.validator_addresses() {
                return Err(BrdposError::ValidatorsNotLegit);
            }
            if penalties != header.penalty_addresses() {
                return Err(BrdposError::PenaltiesNotLegit);
            }
        } else if !header.validators.is_empty() || !header.penalties.is_empty() {
            return Err(BrdposError::InvalidFieldInNonEpochSwitch);
        }

        let masternodes = self.epoch_switch_info_for_header(header)?.masternodes.clone();
        let leader = select_proposer(extra.round, self.config.epoch, &masternodes)?;
        let (is_masternode, signer) =
            verify_signature(&header_sig_hash(header), &header.validator, &masternodes)?;
        if !is_masternode {
            return Err(BrdposError::UnknownSigner(signer));
        }
        if signer != leader {
            return Err(BrdposError::NotItsTurn { leader, got: signer });
        }
        if signer != header.beneficiary {
            return Err(BrdposError::CoinbaseMismatch);
        }

        self.verified_headers.lock().put(hash, ());
        trace!(target: "consensus::brdpos", number = header.number, round = extra.round, "Verified header");
        Ok(())
    }

    /// Verify a QC against the chain: gap number, block info and, when `check_signatures`, the
    /// signatures against the masternodes of the certified block's epoch.
    ///
    /// `parent` is used in place of a chain lookup when it is the certified block.
    pub fn verify_qc(
        &self,
        qc: &QuorumCert,
        parent: Option<&BrcBlockHeader>,
        check_signatures: bool,
    ) -> BrdposResult<()> {
        let info = match parent {
            Some(p) if p.hash_slow() == qc.proposed_block_info.hash => {
                self.epoch_switch_info_for_header(p)?
            }
            _ => self.epoch_switch_info(&qc.proposed_block_info.hash)?,
        };

        let expected = self.config.gap_number(info.epoch_switch_block_info.number);
        if qc.gap_number != expected {
            return Err(BrdposError::GapNumberMismatch { expected, got: qc.gap_number });
        }

        if check_signatures {
            let threshold = self.round_config(qc.round()).threshold(info.masternodes_len());
            verification::verify_qc(qc, &info.masternodes, threshold)?;
        }
        self.verify_block_info(&qc.proposed_block_info, parent)
    }

    /// Check a block info matches the local header with the same hash
    pub fn verify_block_info(
        &self,
        block_info: &BlockInfo,
        parent: Option<&BrcBlockHeader>,
    ) -> BrdposResult<()> {
        let header = match parent {
            Some(p) if p.hash_slow() == block_info.hash => p.clone(),
            _ => self.header(&block_info.hash)?,
        };
        if header.number != block_info.number {
            return Err(BrdposError::InvalidBlockInfo(format!(
                "number mismatch: header {}, block info {}",
                header.number, block_info.number
            )));
        }
        // the switch block is a legacy block without round
        if block_info.number == self.config.v2.switch_block {
            if block_info.round != 0 {
                return Err(BrdposError::InvalidBlockInfo(format!(
                    "switch block carries round {}",
                    block_info.round
                )));
            }
            return Ok(());
        }
        let round = self.extra_fields(&header)?.round;
        if round != block_info.round {
            return Err(BrdposError::InvalidBlockInfo(format!(
                "round mismatch: header {round}, block info {}",
                block_info.round
            )));
        }
        Ok(())
    }

    /// Masternodes and penalties of the epoch opened by block `number` in `round`.
    ///
    /// Candidates come from the snapshot of the block's gap block. Penalties are only applied
    /// from the second v2 epoch on, and only with a penalty hook.
    pub fn calc_masternodes(
        &self,
        number: u64,
        parent_hash: B256,
        round: Round,
    ) -> BrdposResult<(Vec<Address>, Vec<Address>)> {
        let snap = self.snapshots.get_snapshot(self.chain.as_ref(), number, false)?;
        let max_masternodes = self.round_config(round).max_masternodes;
        let mut candidates = snap.next_epoch_candidates.clone();

        let hook = match &self.penalty_hook {
            Some(hook) if number != self.config.v2.switch_block + 1 => hook,
            _ => {
                candidates.truncate(max_masternodes);
                return Ok((candidates, Vec::new()));
            }
        };

        let outgoing = self.epoch_switch_info(&parent_hash)?;
        let penalties =
            hook.penalties(self.chain.as_ref(), &outgoing, number, parent_hash, &candidates)?;
        let mut masternodes: Vec<Address> =
            candidates.into_iter().filter(|c| !penalties.contains(c)).collect();
        masternodes.truncate(max_masternodes);
        debug!(
            target: "consensus::brdpos",
            number,
            round,
            masternodes = masternodes.len(),
            penalties = penalties.len(),
            "Calculated masternodes"
        );
        Ok((masternodes, penalties))
    }

    /// Masternodes of the epoch `header` belongs to
    pub fn get_masternodes(&self, header: &BrcBlockHeader) -> BrdposResult<Vec<Address>> {
        Ok(self.epoch_switch_info_for_header(header)?.masternodes.clone())
    }

    /// Masternodes recorded by an epoch switch header
    pub fn get_masternodes_from_epoch_switch_header(
        &self,
        header: &BrcBlockHeader,
    ) -> BrdposResult<Vec<Address>> {
        if header.number == self.config.v2.switch_block {
            return v1::masternodes_from_checkpoint_header(header);
        }
        Ok(header.validator_addresses())
    }

    /// Snapshot governing block `number`, or the one taken at `number` when `is_gap`
    pub fn get_snapshot(&self, number: u64, is_gap: bool) -> BrdposResult<Arc<SnapshotV2>> {
        self.snapshots.get_snapshot(self.chain.as_ref(), number, is_gap)
    }

    /// Candidates of the snapshot governing `header`
    pub fn get_signers_from_snapshot(&self, header: &BrcBlockHeader) -> BrdposResult<Vec<Address>> {
        Ok(self.get_snapshot(header.number, false)?.next_epoch_candidates.clone())
    }

    /// Whether `address` is a candidate in the snapshot governing `header`
    pub fn is_authorised_address(&self, header: &BrcBlockHeader, address: &Address) -> bool {
        match self.get_snapshot(header.number, false) {
            Ok(snap) => snap.is_candidate(address),
            Err(err) => {
                debug!(target: "consensus::brdpos", number = header.number, %err, "No snapshot to authorise address");
                false
            }
        }
    }

    /// Persist the candidates read at gap block `header`, sorted by stake
    pub fn update_masternodes(
        &self,
        header: &BrcBlockHeader,
        candidates: Vec<Masternode>,
    ) -> BrdposResult<()> {
        let snap = SnapshotV2::new(header.number, header.hash_slow(), sort_candidates(candidates));
        info!(
            target: "consensus::brdpos",
            number = snap.number,
            hash = %snap.hash,
            candidates = snap.next_epoch_candidates.len(),
            "Took snapshot at gap block"
        );
        self.snapshots.store(snap)?;
        Ok(())
    }

    /// Block the next proposal builds on: the one certified by the highest QC
    pub fn find_parent_block_to_assign(&self) -> BrdposResult<BrcBlockHeader> {
        let hash = self.state.read().highest_qc.proposed_block_info.hash;
        self.header(&hash)
    }

    /// Rounds of the epoch of `header` in which the scheduled leader produced no block
    pub fn calculate_missing_rounds(
        &self,
        header: &BrcBlockHeader,
    ) -> BrdposResult<MissedRoundsMetadata> {
        let switch_info = self.epoch_switch_info_for_header(header)?;
        let masternodes = &switch_info.masternodes;
        if masternodes.is_empty() {
            return Err(BrdposError::MasternodesNotFound);
        }

        let mut missed_rounds = Vec::new();
        let mut next = header.clone();
        while next.number > switch_info.epoch_switch_block_info.number {
            let parent = self.header(&next.parent_hash)?;
            let parent_round = self.round_of(&parent)?;
            let round = self.round_of(&next)?;
            for missed in parent_round + 1..round {
                missed_rounds.push(MissedRoundInfo {
                    round: missed,
                    miner: masternodes[leader_index(missed, self.config.epoch, masternodes.len())],
                    current_block_hash: next.hash_slow(),
                    current_block_num: next.number,
                    parent_block_hash: next.parent_hash,
                    parent_block_num: parent.number,
                });
            }
            next = parent;
        }

        Ok(MissedRoundsMetadata {
            epoch_round: switch_info.epoch_switch_block_info.round,
            epoch_block_number: switch_info.epoch_switch_block_info.number,
            missed_rounds,
        })
    }

    /// Refuse switching the canonical chain to `new_head` if that would revert a committed
    /// block. The new branch must be known to the chain reader.
    pub fn check_reorg(&self, new_head: &BrcBlockHeader) -> BrdposResult<()> {
        let Some(committed) = self.state.read().highest_commit_block else { return Ok(()) };

        let keeps_committed = new_head.number >= committed.number &&
            ancestor_at(self.chain.as_ref(), new_head.hash_slow(), committed.number)? ==
                committed.hash;
        if !keeps_committed {
            warn!(
                target: "consensus::brdpos",
                committed = committed.number,
                new_head = new_head.number,
                "Refusing reorg of committed block"
            );
            return Err(BrdposError::CommitReorgAttack {
                number: committed.number,
                hash: committed.hash,
            });
        }
        Ok(())
    }
}
