//! Epoch switching, masternode rotation, snapshots and version routing

use super::helpers::{TestChain, short_epoch_config, v2_chain};
use crate::{
    BrdposConsensus, BrdposError, BrdposResult, BrdposV2Engine, ChainReader, ConsensusSigner,
    ConsensusVersion, Masternode, ValidatorOracle,
    constants::VALIDATOR_CONTRACT_ADDR,
    v2::{BlockInfo, EpochSwitchInfo, PenaltyHook},
};
use alloc::sync::Arc;
use alloy_primitives::{Address, B256, U256};
use assert_matches::assert_matches;
use parking_lot::Mutex;

/// Penalizes a fixed set of addresses at every epoch switch
#[derive(Debug)]
struct FixedPenalty(Vec<Address>);

impl PenaltyHook for FixedPenalty {
    fn penalties(
        &self,
        _chain: &dyn ChainReader,
        _outgoing: &EpochSwitchInfo,
        _number: u64,
        _parent_hash: B256,
        candidates: &[Address],
    ) -> BrdposResult<Vec<Address>> {
        Ok(self.0.iter().filter(|a| candidates.contains(a)).copied().collect())
    }
}

#[derive(Debug, Default)]
struct StakeOracle {
    stakes: Vec<Masternode>,
    reads: Mutex<Vec<(B256, Address)>>,
}

impl ValidatorOracle for StakeOracle {
    fn candidates(&self, state_root: B256, contract: Address) -> BrdposResult<Vec<Masternode>> {
        self.reads.lock().push((state_root, contract));
        Ok(self.stakes.clone())
    }
}

#[test]
fn test_epoch_switch_detection() {
    let net = v2_chain(3, 3);
    let engine = net.engine();

    assert_eq!(engine.is_epoch_switch(&net.header(900)).unwrap(), (true, 1));
    assert_eq!(engine.is_epoch_switch(&net.header(901)).unwrap(), (true, 1));
    assert_eq!(engine.is_epoch_switch(&net.header(902)).unwrap(), (false, 1));

    assert_eq!(engine.current_epoch_switch_block(903).unwrap(), (901, 1));
    assert_eq!(engine.current_epoch_switch_block(900).unwrap(), (900, 1));
}

#[test]
fn test_first_epoch_switch_info() {
    let net = v2_chain(3, 3);
    let engine = net.engine();
    let switch = net.header(900);

    let info = engine.epoch_switch_info(&net.header(903).hash_slow()).unwrap();
    assert_eq!(info.masternodes, net.masternodes());
    assert!(info.standby_nodes.is_empty());
    assert!(info.penalties.is_empty());
    assert_eq!(info.epoch_switch_block_info, net.block_info(&net.header(901)));
    assert_eq!(info.epoch_switch_parent_block_info, Some(BlockInfo::new(switch.hash_slow(), 0, 900)));

    let info = engine.epoch_switch_info(&switch.hash_slow()).unwrap();
    assert_eq!(info.masternodes, net.masternodes());
    assert_eq!(info.epoch_switch_parent_block_info, None);

    // served from the cache on the second lookup
    assert_eq!(engine.epoch_switch_info(&net.header(902).hash_slow()).unwrap().masternodes_len(), 3);
}

#[test]
fn test_epoch_switch_at_round() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    net.store_first_snapshot();
    net.extend(1..=7);
    let engine = net.engine();
    let parent = net.head();

    assert!(engine.is_epoch_switch_at_round(1, &net.header(20)).unwrap());
    assert!(!engine.is_epoch_switch_at_round(9, &parent).unwrap());
    assert!(engine.is_epoch_switch_at_round(10, &parent).unwrap());
    assert!(engine.is_epoch_switch_at_round(25, &parent).unwrap());
    // a round not above the parent never switches
    assert!(!engine.is_epoch_switch_at_round(7, &parent).unwrap());
}

#[test]
fn test_epoch_rollover_rotates_masternodes() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    let [mn0, mn1, mn2]: [Address; 3] = net.masternodes().try_into().unwrap();
    let newcomer = net.keys[3].address();
    let net = net.with_penalty_hook(Arc::new(FixedPenalty(vec![mn2])));
    net.store_first_snapshot();
    net.extend(1..=9);

    // the first v2 epoch is never penalized
    let first = net.engine().epoch_switch_info(&net.header(21).hash_slow()).unwrap();
    assert_eq!(first.masternodes, vec![mn0, mn1, mn2]);
    assert!(first.penalties.is_empty());

    net.store_snapshot(25, &[newcomer, mn0, mn1, mn2]);
    let block = net.extend([10]).remove(0);
    assert_eq!(block.number, 30);
    assert_eq!(block.validator_addresses(), vec![newcomer, mn0, mn1]);
    assert_eq!(block.penalty_addresses(), vec![mn2]);
    assert_eq!(block.beneficiary, newcomer);

    let verifier = net.engine();
    net.clock.set(block.timestamp);
    verifier.verify_header(&block, true).unwrap();
    assert_eq!(verifier.is_epoch_switch(&block).unwrap(), (true, 3));

    let info = verifier.epoch_switch_info(&block.hash_slow()).unwrap();
    assert_eq!(info.masternodes, vec![newcomer, mn0, mn1]);
    assert_eq!(info.penalties, vec![mn2]);
    assert!(info.standby_nodes.is_empty());
    assert_eq!(info.epoch_switch_parent_block_info, Some(net.block_info(&net.header(29))));

    // the new epoch is certified by the new set
    let next = net.extend([11]).remove(0);
    verifier.verify_header(&next, false).unwrap();
    assert_eq!(verifier.get_masternodes(&next).unwrap(), vec![newcomer, mn0, mn1]);
}

#[test]
fn test_rotation_without_penalties_is_rejected() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    let [mn0, mn1, mn2]: [Address; 3] = net.masternodes().try_into().unwrap();
    let net = net.with_penalty_hook(Arc::new(FixedPenalty(vec![mn2])));
    net.store_first_snapshot();
    net.extend(1..=9);
    net.store_snapshot(25, &[mn0, mn1, mn2]);
    let block = net.extend([10]).remove(0);

    // a verifier without the hook computes the full candidate set
    let verifier = BrdposV2Engine::new(net.config.clone(), net.chain.clone(), net.db.clone())
        .unwrap()
        .with_clock(net.clock.clone());
    assert_matches!(verifier.verify_header(&block, false), Err(BrdposError::ValidatorsNotLegit));
}

#[test]
fn test_masternodes_truncated() {
    let mut config = short_epoch_config();
    for round_config in &mut config.v2.all_configs {
        round_config.max_masternodes = 2;
    }
    let net = TestChain::with_config(config, 3);
    let [mn0, mn1, mn2]: [Address; 3] = net.masternodes().try_into().unwrap();
    let spare = net.keys[4].address();
    net.store_first_snapshot();
    net.extend(1..=9);

    let first = net.header(21);
    assert_eq!(first.validator_addresses(), vec![mn0, mn1]);
    let info = net.engine().epoch_switch_info(&first.hash_slow()).unwrap();
    assert_eq!(info.standby_nodes, vec![mn2]);

    net.store_snapshot(25, &[mn2, mn1, mn0, spare]);
    let block = net.extend([10]).remove(0);
    assert_eq!(block.validator_addresses(), vec![mn2, mn1]);
    let info = net.engine().epoch_switch_info(&block.hash_slow()).unwrap();
    assert_eq!(info.standby_nodes, vec![mn0, spare]);
}

#[test]
fn test_epoch_switch_info_between_and_previous() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    net.store_first_snapshot();
    net.extend(1..=9);
    net.store_snapshot(25, &net.masternodes());
    net.extend(10..=19);
    net.store_snapshot(35, &net.masternodes());
    net.extend(20..=25);
    let engine = net.engine();
    let head = net.head();
    assert_eq!(head.number, 45);

    let numbers = |infos: Vec<Arc<EpochSwitchInfo>>| {
        infos.iter().map(|i| i.epoch_switch_block_info.number).collect::<Vec<_>>()
    };
    assert_eq!(numbers(engine.epoch_switch_info_between(&net.header(25), &head).unwrap()), vec![30, 40]);
    assert_eq!(
        numbers(engine.epoch_switch_info_between(&net.header(20), &head).unwrap()),
        vec![21, 30, 40]
    );

    let hash = head.hash_slow();
    assert_eq!(engine.previous_epoch_switch_info_by_hash(&hash, 0).unwrap().epoch_switch_block_info.number, 40);
    assert_eq!(engine.previous_epoch_switch_info_by_hash(&hash, 1).unwrap().epoch_switch_block_info.number, 30);
    // stops at the v2 switch block
    assert_eq!(engine.previous_epoch_switch_info_by_hash(&hash, 9).unwrap().epoch_switch_block_info.number, 20);

    assert_eq!(engine.current_epoch_switch_block(45).unwrap(), (40, 4));
}

#[test]
fn test_snapshot_lookup() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    net.store_first_snapshot();
    net.extend(1..=9);
    let engine = net.engine();

    assert_matches!(engine.get_snapshot(30, false), Err(BrdposError::SnapshotNotFound(_)));
    net.store_snapshot(25, &net.masternodes());

    let snap = engine.get_snapshot(30, false).unwrap();
    assert_eq!(snap.number, 25);
    assert_eq!(snap.hash, net.header(25).hash_slow());
    assert_eq!(engine.get_snapshot(25, true).unwrap(), snap);
    assert_eq!(engine.get_snapshot(29, false).unwrap().number, 15);
}

#[test]
fn test_version_routing() {
    let net = v2_chain(3, 2);
    let consensus = BrdposConsensus::new(Arc::new(net.engine()));

    assert_eq!(consensus.block_consensus_version(900, None), ConsensusVersion::V1);
    assert_eq!(consensus.block_consensus_version(901, None), ConsensusVersion::V2);
    assert_eq!(consensus.block_consensus_version(901, Some(&[1, 0, 0])), ConsensusVersion::V1);
    assert_eq!(consensus.block_consensus_version(901, Some(&[2, 0, 0])), ConsensusVersion::V2);

    // legacy paths
    let legacy = net.header(450);
    assert_eq!(consensus.is_epoch_switch(&legacy).unwrap(), (false, 0));
    assert_eq!(consensus.is_epoch_switch(&net.header(900)).unwrap(), (true, 1));
    assert_eq!(consensus.current_epoch_switch_block(899).unwrap(), (0, 0));
    assert_eq!(consensus.get_masternodes(&legacy).unwrap(), net.masternodes());
    assert_eq!(
        consensus.get_masternodes_from_checkpoint_header(&net.header(900)).unwrap(),
        net.masternodes()
    );
    consensus.check_reorg(&legacy).unwrap();
    assert_matches!(
        consensus.your_turn(&net.header(899), net.masternodes()[0]),
        Err(BrdposError::UnsupportedVersion(1))
    );
    assert_matches!(consensus.calc_difficulty(&net.header(899)), Err(BrdposError::UnsupportedVersion(1)));
    let mut legacy_copy = legacy.clone();
    assert_matches!(consensus.seal(&mut legacy_copy), Err(BrdposError::UnsupportedVersion(1)));

    // v2 paths
    let header = net.header(902);
    assert_eq!(consensus.is_epoch_switch(&net.header(901)).unwrap(), (true, 1));
    assert_eq!(consensus.current_epoch_switch_block(902).unwrap(), (901, 1));
    assert_eq!(consensus.calc_difficulty(&net.header(901)).unwrap(), U256::from(1));
    assert_eq!(consensus.author(&header).unwrap(), header.beneficiary);
    assert_eq!(
        consensus.get_masternodes_from_checkpoint_header(&net.header(901)).unwrap(),
        net.masternodes()
    );
    net.clock.set(header.timestamp);
    consensus.verify_headers(&[net.header(901), header], true).unwrap();
    assert!(consensus.calculate_missing_rounds(&net.header(902)).unwrap().missed_rounds.is_empty());
}

#[test]
fn test_gap_block_snapshot_from_oracle() {
    let net = TestChain::with_config(short_epoch_config(), 3);
    net.store_first_snapshot();
    net.extend(1..=5);
    let [mn0, mn1, _]: [Address; 3] = net.masternodes().try_into().unwrap();
    let spare = net.keys[4].address();

    let oracle = Arc::new(StakeOracle {
        stakes: vec![Masternode::new(spare, U256::from(5)), Masternode::new(mn1, U256::from(50))],
        ..Default::default()
    });
    let engine = Arc::new(net.engine());
    let consensus = BrdposConsensus::new(engine.clone()).with_oracle(oracle.clone());

    // not a gap block
    consensus.on_block_inserted(&net.header(24)).unwrap();
    // legacy gap block
    consensus.on_block_inserted(&net.header(15)).unwrap();
    assert!(oracle.reads.lock().is_empty());

    let gap = net.header(25);
    consensus.on_block_inserted(&gap).unwrap();
    assert_eq!(*oracle.reads.lock(), vec![(gap.state_root, VALIDATOR_CONTRACT_ADDR)]);
    assert_eq!(engine.get_snapshot(25, true).unwrap().next_epoch_candidates, vec![mn1, spare]);
    assert!(engine.is_authorised_address(&net.header(25), &mn0));

    // without an oracle nothing is read
    let plain = BrdposConsensus::new(engine);
    plain.on_block_inserted(&gap).unwrap();
    assert_eq!(oracle.reads.lock().len(), 1);
}
