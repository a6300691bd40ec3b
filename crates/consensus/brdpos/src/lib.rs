//! BRC Network BRDPoS Consensus Implementation
//!
//! This crate implements the v2 BFT core of BRDPoS, the delegated proof of stake consensus of
//! the BRC chain: round progression driven by quorum and timeout certificates, leader
//! selection, the three-chain commit rule, epoch switching with masternode rotation and the
//! snapshot store that freezes candidate sets at gap blocks.
//!
//! ## Architecture
//!
//! - [`BrdposConsensus`] - Version router dispatching each operation on the header extra
//! - [`BrdposV2Engine`] - The v2 state machine
//! - [`Dispatcher`] - Single task serializing every mutation of the v2 engine
//! - [`BrdposConfig`] - Configuration for BRDPoS parameters
//! - [`ChainReader`], [`KeyValueStore`], [`ValidatorOracle`], [`ConsensusSigner`] - external
//!   collaborators consumed by the engine

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

mod brdpos;
pub mod chain;
mod config;
pub mod crypto;
pub mod db;
mod errors;
pub mod oracle;
pub mod v1;
pub mod v2;

#[cfg(any(test, feature = "test-utils"))]
pub mod tests;

pub use brdpos::{BrdposConsensus, ConsensusVersion};
pub use chain::{ChainReader, InMemoryChain};
pub use config::{BrdposConfig, RoundConfig, V2Config};
pub use crypto::{ConsensusSigner, LocalSigner};
pub use db::{KeyValueStore, MemoryDatabase};
pub use errors::{BrdposError, BrdposResult};
pub use oracle::{Masternode, ValidatorOracle};

pub use v2::{
    Action, BlockInfo, BrdposV2Engine, ConsensusEvent, ConsensusMessage, Dispatcher,
    DispatcherHandle, EpochSwitchInfo, ExtraFieldsV2, ForensicsEvent, QuorumCert, Round,
    Signature, SyncInfo, Timeout, TimeoutCert, Vote,
};

/// Extra field constants for BRDPoS
pub mod constants {
    /// Fixed number of extra-data prefix bytes reserved for signer vanity
    pub const EXTRA_VANITY: usize = 32;

    /// Fixed number of extra-data suffix bytes reserved for signer seal
    pub const EXTRA_SEAL: usize = 65;

    /// Version byte leading the extra data of v2 headers
    pub const EXTRA_V2_VERSION: u8 = 2;

    /// Default epoch length (900 blocks)
    pub const DEFAULT_EPOCH: u64 = 900;

    /// Default block period in seconds (2 seconds)
    pub const DEFAULT_PERIOD: u64 = 2;

    /// Default gap before epoch switch (450 blocks)
    pub const DEFAULT_GAP: u64 = 450;

    /// Default certificate threshold for V2 (2/3 = 67%)
    pub const DEFAULT_CERT_THRESHOLD: f64 = 0.667;

    /// Upper bound of the active masternode set
    pub const MAX_MASTERNODES: usize = 18;

    /// Blocks a masternode must mine per epoch to avoid a penalty
    pub const MIN_MINER_BLOCK_PER_EPOCH: u64 = 1;

    /// Key prefix of persisted v2 snapshots
    pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"BRDPoS-V2-";

    /// Number of recent snapshots to keep in memory
    pub const INMEMORY_SNAPSHOTS: usize = 128;

    /// Number of recent epoch switch infos to keep in memory
    pub const INMEMORY_EPOCHS: usize = 1800;

    /// Number of recently verified headers to keep in memory
    pub const INMEMORY_VERIFIED_HEADERS: usize = 4096;

    /// Number of QCs waiting for their block
    pub const PENDING_QUORUM_CERTS: usize = 16;

    /// Capacity of the new round notification channel
    pub const NEW_ROUND_CHANNEL_SIZE: usize = 1;

    /// Capacity of the dispatcher event queue
    pub const EVENT_CHANNEL_SIZE: usize = 1024;

    /// Capacity of the outbound broadcast and forensics feeds
    pub const FEED_CHANNEL_SIZE: usize = 256;

    /// Allowed clock drift for headers from the future, in seconds
    pub const ALLOWED_FUTURE_BLOCK_TIME: u64 = 15;

    /// BRC Validator Contract Address (0x88)
    pub const VALIDATOR_CONTRACT_ADDR: alloy_primitives::Address =
        alloy_primitives::address!("0x0000000000000000000000000000000000000088");
}

/// First round of the epoch containing `round`
pub const fn epoch_start(round: u64, epoch: u64) -> u64 {
    round - round % epoch
}

/// Gap block of the epoch containing block `number`: `number - number % epoch - gap`, clamped
/// to zero for the first epoch.
pub const fn gap_block_number(number: u64, epoch: u64, gap: u64) -> u64 {
    (number - number % epoch).saturating_sub(gap)
}

/// Whether `number` is the gap block of its epoch
pub const fn is_gap_block(number: u64, epoch: u64, gap: u64) -> bool {
    number % epoch == epoch - gap
}
