//! BRDPoS V2 Block Proposer Selection
//!
//! The leader of round `r` is `masternodes[(r % epoch) % len(masternodes)]`, so the rotation
//! restarts at the first masternode on every epoch boundary.

use super::Round;
use crate::errors::{BrdposError, BrdposResult};
use alloy_primitives::Address;

/// Index of the leader of `round` within a masternode set of `len`
pub const fn leader_index(round: Round, epoch: u64, len: usize) -> usize {
    ((round % epoch) % len as u64) as usize
}

/// Select the block proposer for a given round
pub fn select_proposer(round: Round, epoch: u64, masternodes: &[Address]) -> BrdposResult<Address> {
    if masternodes.is_empty() {
        return Err(BrdposError::MasternodesNotFound);
    }
    Ok(masternodes[leader_index(round, epoch, masternodes.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_validators(count: usize) -> Vec<Address> {
        (0..count).map(|i| Address::with_last_byte(i as u8)).collect()
    }

    #[test]
    fn test_select_proposer_round_robin() {
        let validators = make_validators(5);

        assert_eq!(select_proposer(0, 900, &validators).unwrap(), validators[0]);
        assert_eq!(select_proposer(1, 900, &validators).unwrap(), validators[1]);
        assert_eq!(select_proposer(4, 900, &validators).unwrap(), validators[4]);
        assert_eq!(select_proposer(5, 900, &validators).unwrap(), validators[0]);
        assert_eq!(select_proposer(13, 900, &validators).unwrap(), validators[3]);
    }

    #[test]
    fn test_rotation_restarts_each_epoch() {
        let validators = make_validators(7);
        // 899 % 7 = 3, then the next epoch starts again from index 0
        assert_eq!(select_proposer(899, 900, &validators).unwrap(), validators[3]);
        assert_eq!(select_proposer(900, 900, &validators).unwrap(), validators[0]);
        assert_eq!(select_proposer(901, 900, &validators).unwrap(), validators[1]);
        assert_eq!(leader_index(1805, 900, 7), 5);
    }

    #[test]
    fn test_select_proposer_empty_validators() {
        assert!(select_proposer(0, 900, &[]).is_err());
    }

    #[test]
    fn test_proposer_pattern_18_validators() {
        let validators = make_validators(18);
        for round in 0..36 {
            let proposer = select_proposer(round, 900, &validators).unwrap();
            assert_eq!(proposer, validators[(round % 18) as usize]);
        }
    }
}
