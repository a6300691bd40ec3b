//! Scenario tests for the BRDPoS v2 engine

pub mod helpers;

#[cfg(test)]
mod epoch_tests;

pub use helpers::{
    ManualClock, TestChain, checkpoint_extra, short_epoch_config, signed_timeout, signed_vote, signer,
    test_config, v2_chain,
};
