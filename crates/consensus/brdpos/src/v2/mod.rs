//! BRDPoS V2 BFT Consensus
//!
//! This module implements the complete BRDPoS V2 BFT consensus including:
//! - Round-based consensus driven by quorum and timeout certificates
//! - Vote and timeout pools gating certificate formation
//! - The three-chain commit rule and equivocation forensics
//! - Epoch switch resolution and the gap block snapshot store
//! - Header preparation, sealing and verification
//! - A single-task dispatcher serializing every state mutation

pub mod dispatcher;
pub mod engine;
pub mod epoch_switch;
pub mod forensics;
pub mod pacemaker;
pub mod penalty;
pub mod pool;
pub mod proposer;
pub mod snapshot;
pub mod types;
pub mod verification;

pub use dispatcher::{Action, ConsensusEvent, Dispatcher, DispatcherHandle};
pub use engine::{BrdposV2Engine, Clock, SystemClock};
pub use forensics::ForensicsEvent;
pub use pacemaker::PacemakerState;
pub use penalty::{MissedBlocksPenalty, PenaltyHook};
pub use snapshot::SnapshotV2;

use alloc::{format, string::String, vec::Vec};
use alloy_primitives::{Address, B256, Bytes};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Round number type for V2 consensus
pub type Round = u64;

/// Signature type for BFT messages (65 bytes)
pub type Signature = Bytes;

/// Identifies a block in BFT messages
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    RlpEncodable,
    RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Block hash
    pub hash: B256,
    /// Consensus round
    pub round: Round,
    /// Block number
    pub number: u64,
}

impl BlockInfo {
    /// Create a new BlockInfo
    pub const fn new(hash: B256, round: Round, number: u64) -> Self {
        Self { hash, round, number }
    }
}

/// Quorum Certificate (QC): proof that a threshold of masternodes voted for a block
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct QuorumCert {
    /// Information about the proposed block
    pub proposed_block_info: BlockInfo,
    /// Signatures from validators
    pub signatures: Vec<Signature>,
    /// Gap block of the epoch the proposed block belongs to
    pub gap_number: u64,
}

impl QuorumCert {
    /// Create a QuorumCert without signatures
    pub const fn new(proposed_block_info: BlockInfo, gap_number: u64) -> Self {
        Self { proposed_block_info, signatures: Vec::new(), gap_number }
    }

    /// Round of the certified block
    pub const fn round(&self) -> Round {
        self.proposed_block_info.round
    }

    /// Add a signature
    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }

    /// Get the signature count
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

/// Timeout Certificate (TC): proof that a threshold of masternodes timed out a round
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutCert {
    /// Round that timed out
    pub round: Round,
    /// Signatures from validators that timed out
    pub signatures: Vec<Signature>,
    /// Gap number for epoch tracking
    pub gap_number: u64,
}

impl TimeoutCert {
    /// Create a TimeoutCert without signatures
    pub const fn new(round: Round, gap_number: u64) -> Self {
        Self { round, signatures: Vec::new(), gap_number }
    }

    /// Add a signature
    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }
}

/// SyncInfo is used to sync consensus state between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Highest known quorum certificate
    pub highest_quorum_cert: QuorumCert,
    /// Highest known timeout certificate (if any)
    pub highest_timeout_cert: Option<TimeoutCert>,
}

/// Consensus fields carried in the extra data of v2 headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFieldsV2 {
    /// Round the block was proposed in
    pub round: Round,
    /// Certificate of the block this one extends
    pub quorum_cert: QuorumCert,
}

impl ExtraFieldsV2 {
    /// Create new extra fields
    pub const fn new(round: Round, quorum_cert: QuorumCert) -> Self {
        Self { round, quorum_cert }
    }
}

/// Vote message structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    /// Proposed block information
    pub proposed_block_info: BlockInfo,
    /// Signature
    pub signature: Signature,
    /// Gap number
    pub gap_number: u64,
    /// Signer address (recovered from signature)
    #[serde(skip)]
    signer: Option<Address>,
}

impl Vote {
    /// Create a new vote
    pub const fn new(proposed_block_info: BlockInfo, signature: Signature, gap_number: u64) -> Self {
        Self { proposed_block_info, signature, gap_number, signer: None }
    }

    /// Set the signer
    pub fn set_signer(&mut self, signer: Address) {
        self.signer = Some(signer);
    }

    /// Get the signer
    pub const fn signer(&self) -> Option<Address> {
        self.signer
    }

    /// Key grouping votes for the same block: `round:gap:number:hash`
    pub fn pool_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.proposed_block_info.round,
            self.gap_number,
            self.proposed_block_info.number,
            self.proposed_block_info.hash
        )
    }

    /// Payload covered by the signature
    pub const fn for_sign(&self) -> VoteForSign {
        VoteForSign { proposed_block_info: self.proposed_block_info, gap_number: self.gap_number }
    }
}

/// Timeout message structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeout {
    /// Round that timed out
    pub round: Round,
    /// Signature
    pub signature: Signature,
    /// Gap number
    pub gap_number: u64,
    /// Signer address (recovered from signature)
    #[serde(skip)]
    signer: Option<Address>,
}

impl Timeout {
    /// Create a new timeout
    pub const fn new(round: Round, signature: Signature, gap_number: u64) -> Self {
        Self { round, signature, gap_number, signer: None }
    }

    /// Set the signer
    pub fn set_signer(&mut self, signer: Address) {
        self.signer = Some(signer);
    }

    /// Get the signer
    pub const fn signer(&self) -> Option<Address> {
        self.signer
    }

    /// Key grouping timeouts for the same round: `round:gap`
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.round, self.gap_number)
    }

    /// Payload covered by the signature
    pub const fn for_sign(&self) -> TimeoutForSign {
        TimeoutForSign { round: self.round, gap_number: self.gap_number }
    }
}

/// Payload signed by a vote
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct VoteForSign {
    /// Proposed block information
    pub proposed_block_info: BlockInfo,
    /// Gap number
    pub gap_number: u64,
}

/// Payload signed by a timeout
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TimeoutForSign {
    /// Round
    pub round: Round,
    /// Gap number
    pub gap_number: u64,
}

/// Messages exchanged between masternodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ConsensusMessage {
    /// Vote for a proposed block
    Vote(Vote),
    /// Local round timed out
    Timeout(Timeout),
    /// Highest certificates known to the sender
    SyncInfo(SyncInfo),
}

/// Masternode membership of an epoch, resolved from its epoch switch block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSwitchInfo {
    /// Active masternodes of the epoch
    pub masternodes: Vec<Address>,
    /// Candidates neither active nor penalized
    pub standby_nodes: Vec<Address>,
    /// Masternodes penalized for the previous epoch
    pub penalties: Vec<Address>,
    /// Block that opened the epoch
    pub epoch_switch_block_info: BlockInfo,
    /// Block certified by the epoch switch block. `None` for the v2 switch block.
    pub epoch_switch_parent_block_info: Option<BlockInfo>,
}

impl EpochSwitchInfo {
    /// Number of masternodes
    pub fn masternodes_len(&self) -> usize {
        self.masternodes.len()
    }
}

/// A round in which the scheduled leader produced no block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedRoundInfo {
    /// The round nobody proposed in
    pub round: Round,
    /// Leader scheduled for the round
    pub miner: Address,
    /// First block after the gap
    pub current_block_hash: B256,
    /// Number of the first block after the gap
    pub current_block_num: u64,
    /// Block preceding the gap
    pub parent_block_hash: B256,
    /// Number of the block preceding the gap
    pub parent_block_num: u64,
}

/// Missed rounds of an epoch, from its switch block up to a given header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedRoundsMetadata {
    /// Round of the epoch switch block
    pub epoch_round: Round,
    /// Number of the epoch switch block
    pub epoch_block_number: u64,
    /// Missed rounds, oldest first
    pub missed_rounds: Vec<MissedRoundInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_info() {
        let info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        assert_eq!(info.round, 100);
        assert_eq!(info.number, 1000);
    }

    #[test]
    fn test_quorum_cert() {
        let block_info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        let mut qc = QuorumCert::new(block_info, 450);

        assert_eq!(qc.signature_count(), 0);
        qc.add_signature(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(qc.signature_count(), 1);
        assert_eq!(qc.round(), 100);
    }

    #[test]
    fn test_vote_pool_key() {
        let block_info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        let vote = Vote::new(block_info, Bytes::new(), 450);
        assert_eq!(vote.pool_key(), format!("100:450:1000:{}", B256::with_last_byte(1)));
    }

    #[test]
    fn test_timeout_pool_key() {
        let timeout = Timeout::new(5, Bytes::new(), 450);
        assert_eq!(timeout.pool_key(), "5:450");
    }

    #[test]
    fn test_message_json_shape() {
        let msg = ConsensusMessage::Timeout(Timeout::new(5, Bytes::from_static(&[1]), 450));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "timeout");
        assert_eq!(json["payload"]["gapNumber"], 450);
        // the recovered signer never travels
        assert!(json["payload"].get("signer").is_none());
    }
}
