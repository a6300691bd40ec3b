//! Test helper utilities for BRDPoS consensus testing
//!
//! [`TestChain`] builds an in-memory chain of legacy blocks up to the v2 switch block and
//! extends it with sealed v2 blocks carrying real quorum certificates, signed by secp256k1 keys
//! derived from fixed seeds.

use crate::{
    BrdposConfig, BrdposV2Engine, ChainReader, ConsensusSigner, InMemoryChain, LocalSigner,
    MemoryDatabase, RoundConfig,
    constants::{EXTRA_SEAL, EXTRA_VANITY},
    crypto::seal_header,
    oracle::Masternode,
    v2::{
        BlockInfo, Clock, PenaltyHook, QuorumCert, Round, Timeout, TimeoutForSign, Vote, VoteForSign,
        proposer::select_proposer,
        types::{encode_extra_fields_v2, timeout_sig_hash, vote_sig_hash},
    },
};
use alloc::sync::Arc;
use alloy_primitives::{Address, B256, Bytes, U256};
use brc_primitives::{BrcBlockHeader, pack_addresses};
use core::sync::atomic::{AtomicU64, Ordering};

/// Timestamp of the genesis block
pub const GENESIS_TIMESTAMP: u64 = 1_000;

/// [`Clock`] moved by hand
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Clock reading `now`
    pub const fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    /// Jump to `now`
    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs`
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Key derived from a non-zero seed byte
pub fn signer(seed: u8) -> LocalSigner {
    LocalSigner::from_bytes(&[seed; 32]).expect("valid secret key")
}

/// `test_mock` config with a two thirds certificate threshold
pub fn test_config() -> BrdposConfig {
    let mut config = BrdposConfig::test_mock();
    for round_config in &mut config.v2.all_configs {
        *round_config = RoundConfig { cert_threshold: 2.0 / 3.0, ..*round_config };
    }
    config
}

/// [`test_config`] with ten round epochs, a gap of five and v2 from block 20
pub fn short_epoch_config() -> BrdposConfig {
    let mut config = test_config().with_epoch(10).with_gap(5);
    config.v2.switch_block = 20;
    config
}

/// Legacy checkpoint extra: `vanity || masternodes || seal`
pub fn checkpoint_extra(masternodes: &[Address]) -> Bytes {
    let mut extra = vec![0u8; EXTRA_VANITY];
    extra.extend_from_slice(&pack_addresses(masternodes));
    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
    extra.into()
}

/// Vote of `key` for `block_info`
pub fn signed_vote(key: &LocalSigner, block_info: BlockInfo, gap_number: u64) -> Vote {
    let hash = vote_sig_hash(&VoteForSign { proposed_block_info: block_info, gap_number });
    Vote::new(block_info, key.sign_hash(&hash).expect("sign vote"), gap_number)
}

/// Timeout of `key` for `round`
pub fn signed_timeout(key: &LocalSigner, round: Round, gap_number: u64) -> Timeout {
    let hash = timeout_sig_hash(&TimeoutForSign { round, gap_number });
    Timeout::new(round, key.sign_hash(&hash).expect("sign timeout"), gap_number)
}

/// In-memory chain shared by the engines of a test
#[derive(Debug)]
pub struct TestChain {
    /// Engine configuration
    pub config: BrdposConfig,
    /// Headers
    pub chain: Arc<InMemoryChain>,
    /// Snapshot storage
    pub db: Arc<MemoryDatabase>,
    /// Wall clock of every engine built by this chain
    pub clock: Arc<ManualClock>,
    /// Masternode keys first, then spare candidate keys
    pub keys: Vec<Arc<LocalSigner>>,
    masternode_count: usize,
    penalty_hook: Option<Arc<dyn PenaltyHook>>,
    builder: BrdposV2Engine,
}

impl TestChain {
    /// Legacy chain `0..=switch_block` with `masternodes` masternodes in every checkpoint and
    /// two spare keys
    pub fn new(masternodes: usize) -> Self {
        Self::with_config(test_config(), masternodes)
    }

    /// Same as [`TestChain::new`] with a custom config
    pub fn with_config(config: BrdposConfig, masternodes: usize) -> Self {
        let keys: Vec<_> = (1..=masternodes as u8 + 2).map(|seed| Arc::new(signer(seed))).collect();
        let chain = Arc::new(InMemoryChain::new());
        let db = Arc::new(MemoryDatabase::new());
        let clock = Arc::new(ManualClock::new(GENESIS_TIMESTAMP));

        let addresses: Vec<Address> = keys[..masternodes].iter().map(|k| k.address()).collect();
        let mut parent_hash = B256::ZERO;
        for number in 0..=config.v2.switch_block {
            let extra = if number % config.epoch == 0 {
                checkpoint_extra(&addresses)
            } else {
                vec![0u8; EXTRA_VANITY + EXTRA_SEAL].into()
            };
            let header = BrcBlockHeader {
                number,
                parent_hash,
                timestamp: GENESIS_TIMESTAMP + number * config.period,
                difficulty: U256::from(2),
                extra_data: extra,
                ..Default::default()
            };
            parent_hash = chain.insert_canonical(header);
        }

        let builder = BrdposV2Engine::new(config.clone(), chain.clone(), db.clone())
            .expect("valid test config")
            .with_clock(clock.clone());
        Self {
            config,
            chain,
            db,
            clock,
            keys,
            masternode_count: masternodes,
            penalty_hook: None,
            builder,
        }
    }

    /// Apply `hook` to the blocks built from now on and to every engine handed out
    pub fn with_penalty_hook(mut self, hook: Arc<dyn PenaltyHook>) -> Self {
        self.penalty_hook = Some(hook);
        self.builder = self.engine();
        self
    }

    /// Masternodes of the first v2 epoch, in checkpoint order
    pub fn masternodes(&self) -> Vec<Address> {
        self.keys[..self.masternode_count].iter().map(|k| k.address()).collect()
    }

    /// Key of `address`
    pub fn key_of(&self, address: Address) -> Arc<LocalSigner> {
        self.keys.iter().find(|k| k.address() == address).cloned().expect("known key")
    }

    /// Engine without a signer
    pub fn engine(&self) -> BrdposV2Engine {
        let engine = BrdposV2Engine::new(self.config.clone(), self.chain.clone(), self.db.clone())
            .expect("valid test config")
            .with_clock(self.clock.clone());
        match &self.penalty_hook {
            Some(hook) => engine.with_penalty_hook(hook.clone()),
            None => engine,
        }
    }

    /// Engine signing with `keys[index]`
    pub fn engine_for(&self, index: usize) -> BrdposV2Engine {
        self.engine().with_signer(self.keys[index].clone())
    }

    /// Canonical header at `number`
    pub fn header(&self, number: u64) -> BrcBlockHeader {
        self.chain.header_by_number(number).expect("canonical header")
    }

    /// Current head
    pub fn head(&self) -> BrcBlockHeader {
        self.chain.current_header().expect("chain head")
    }

    /// Store the snapshot of the gap block `number` with `candidates` in stake order
    pub fn store_snapshot(&self, number: u64, candidates: &[Address]) {
        let header = self.header(number);
        let stakes = candidates
            .iter()
            .enumerate()
            .map(|(i, address)| Masternode::new(*address, U256::from(candidates.len() - i)))
            .collect();
        self.builder.update_masternodes(&header, stakes).expect("store snapshot");
    }

    /// Store the snapshot the first v2 epoch reads its masternodes from
    pub fn store_first_snapshot(&self) {
        let gap = self.config.v2.switch_block - self.config.gap;
        self.store_snapshot(gap, &self.masternodes());
    }

    /// Block info of a header
    pub fn block_info(&self, header: &BrcBlockHeader) -> BlockInfo {
        let round = self.builder.round_of(header).expect("round");
        BlockInfo::new(header.hash_slow(), round, header.number)
    }

    /// Gap number of certificates for a header whose parent is known
    pub fn gap_number(&self, header: &BrcBlockHeader) -> u64 {
        let info = self.builder.epoch_switch_info_for_header(header).expect("epoch switch info");
        self.config.gap_number(info.epoch_switch_block_info.number)
    }

    /// QC on a header signed by the first `signers` masternodes of its epoch
    pub fn qc_with(&self, header: &BrcBlockHeader, signers: usize) -> QuorumCert {
        let block_info = self.block_info(header);
        let gap_number = self.gap_number(header);
        let mut qc = QuorumCert::new(block_info, gap_number);
        if block_info.round == 0 {
            return qc;
        }
        let masternodes = self.builder.get_masternodes(header).expect("masternodes");
        for address in masternodes.into_iter().take(signers) {
            qc.add_signature(signed_vote(&self.key_of(address), block_info, gap_number).signature);
        }
        qc
    }

    /// QC on a header signed by exactly the threshold of its epoch
    pub fn qc_for(&self, header: &BrcBlockHeader) -> QuorumCert {
        let masternodes = self.builder.get_masternodes(header).expect("masternodes");
        let block_info = self.block_info(header);
        let threshold = self.config.v2.config(block_info.round).threshold(masternodes.len());
        self.qc_with(header, threshold)
    }

    /// Sealed v2 block in `round` on top of `parent`, certifying `qc`. Not inserted.
    pub fn build_block(&self, parent: &BrcBlockHeader, round: Round, qc: &QuorumCert) -> BrcBlockHeader {
        self.build_block_with_gas_limit(parent, round, qc, 0)
    }

    /// [`TestChain::build_block`] with a gas limit, to tell sibling blocks of one round apart
    pub fn build_block_with_gas_limit(
        &self,
        parent: &BrcBlockHeader,
        round: Round,
        qc: &QuorumCert,
        gas_limit: u64,
    ) -> BrcBlockHeader {
        let round_config = self.config.v2.config(round);
        let mut header = BrcBlockHeader {
            number: parent.number + 1,
            parent_hash: parent.hash_slow(),
            timestamp: parent.timestamp + round_config.mine_period,
            difficulty: U256::from(1),
            gas_limit,
            extra_data: encode_extra_fields_v2(round, qc),
            ..Default::default()
        };

        let masternodes = if self.builder.is_epoch_switch_at_round(round, parent).expect("switch") {
            let (masternodes, penalties) = self
                .builder
                .calc_masternodes(header.number, header.parent_hash, round)
                .expect("masternodes");
            header.validators = pack_addresses(&masternodes);
            header.penalties = pack_addresses(&penalties);
            masternodes
        } else {
            self.builder.get_masternodes(parent).expect("masternodes")
        };

        let leader = select_proposer(round, self.config.epoch, &masternodes).expect("leader");
        header.beneficiary = leader;
        seal_header(&mut header, self.key_of(leader).as_ref()).expect("seal");
        header
    }

    /// Extend the head with one canonical block per round, each certifying its parent
    pub fn extend(&self, rounds: impl IntoIterator<Item = Round>) -> Vec<BrcBlockHeader> {
        let mut parent = self.head();
        let mut built = Vec::new();
        for round in rounds {
            let header = self.build_block(&parent, round, &self.qc_for(&parent));
            self.chain.insert_canonical(header.clone());
            built.push(header.clone());
            parent = header;
        }
        built
    }

    /// Fork of `parent` with one non-canonical block per round. Fork blocks differ from
    /// canonical blocks of the same round by their gas limit.
    pub fn fork(
        &self,
        parent: &BrcBlockHeader,
        rounds: impl IntoIterator<Item = Round>,
    ) -> Vec<BrcBlockHeader> {
        let mut parent = parent.clone();
        let mut built = Vec::new();
        for round in rounds {
            let header = self.build_block_with_gas_limit(&parent, round, &self.qc_for(&parent), 1);
            self.chain.insert_header(header.clone());
            built.push(header.clone());
            parent = header;
        }
        built
    }
}

/// Chain of `masternodes` masternodes with the first snapshot stored and v2 blocks for rounds
/// `1..=rounds`
pub fn v2_chain(masternodes: usize, rounds: Round) -> TestChain {
    let chain = TestChain::new(masternodes);
    chain.store_first_snapshot();
    chain.extend(1..=rounds);
    chain
}
