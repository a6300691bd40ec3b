//! BRDPoS Consensus Errors

use alloc::string::String;
use alloy_primitives::{Address, B256};

/// BRDPoS error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrdposError {
    /// `yourTurn` said no, or there is no highest QC to build on yet
    #[error("not ready to propose")]
    NotReadyToPropose,

    /// Leader for the round, but the mine period has not elapsed since the parent
    #[error("not ready to mine")]
    NotReadyToMine,

    /// A block was already produced by this node for the round
    #[error("already mined on this round")]
    AlreadyMined,

    /// A referenced ancestor is not known locally
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Header lookup by hash failed
    #[error("header not found: {0}")]
    HeaderNotFound(B256),

    /// Header lookup by number failed
    #[error("header not found at number {0}")]
    HeaderNotFoundByNumber(u64),

    /// Extra data does not decode as v2 consensus fields
    #[error("bad extra data: {0}")]
    BadExtra(String),

    /// Certificate signatures do not meet the threshold or carry unknown signers
    #[error("bad quorum: {0}")]
    BadQuorum(String),

    /// Not enough distinct signers
    #[error("insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    /// Reorg would replace a committed block
    #[error("commit reorg attack: block {number} ({hash}) is committed and cannot be reverted")]
    CommitReorgAttack { number: u64, hash: B256 },

    /// v2 switch block is not an epoch boundary
    #[error("epoch misconfigured: v2 switch block {switch_block} is not a multiple of epoch {epoch}")]
    EpochMisconfigured { switch_block: u64, epoch: u64 },

    /// Configuration rejected for another reason
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Block info does not match the local header
    #[error("invalid block info: {0}")]
    InvalidBlockInfo(String),

    /// Certificate gap number differs from the derived gap block
    #[error("gap number mismatch: expected {expected}, got {got}")]
    GapNumberMismatch { expected: u64, got: u64 },

    /// Header round is not above the round of its QC, or of its parent
    #[error("invalid round: {round} is not above round {qc_round}")]
    RoundInvalid { round: u64, qc_round: u64 },

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("invalid difficulty")]
    InvalidDifficulty,

    #[error("non-zero mix digest")]
    InvalidMixDigest,

    #[error("non-zero nonce")]
    InvalidNonce,

    /// Coinbase is not the local signer or not the seal signer
    #[error("coinbase mismatch")]
    CoinbaseMismatch,

    /// Block producer is not the leader of the round
    #[error("not its turn: leader is {leader}, got {got}")]
    NotItsTurn { leader: Address, got: Address },

    /// Epoch switch header validators differ from the local computation
    #[error("validators not legit")]
    ValidatorsNotLegit,

    /// Epoch switch header penalties differ from the local computation
    #[error("penalties not legit")]
    PenaltiesNotLegit,

    /// Non epoch switch header carries validators or penalties
    #[error("validators or penalties set on a non epoch switch block")]
    InvalidFieldInNonEpochSwitch,

    #[error("missing seal signature")]
    MissingSeal,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Signer is not a masternode of the relevant epoch
    #[error("unknown signer {0}")]
    UnknownSigner(Address),

    /// Masternode set resolved to empty
    #[error("masternodes not found")]
    MasternodesNotFound,

    /// No snapshot stored for the gap block
    #[error("snapshot not found for gap block {0}")]
    SnapshotNotFound(B256),

    /// Message round is outside the accepted window
    #[error("stale message: round {round}, current round {current}")]
    StaleMessage { round: u64, current: u64 },

    /// No local signer configured
    #[error("signer not authorized")]
    SignerNotAuthorized,

    /// Operation is only available on v2 blocks
    #[error("operation not supported by consensus version {0}")]
    UnsupportedVersion(u8),

    /// Key value store failure
    #[error("database error: {0}")]
    Database(String),

    /// JSON codec failure
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),

    /// Custom error message
    #[error("{0}")]
    Custom(String),
}

impl From<serde_json::Error> for BrdposError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for BRDPoS operations
pub type BrdposResult<T> = Result<T, BrdposError>;
