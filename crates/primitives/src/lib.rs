//! BRC primitive types.
//!
//! The block header used by the BRDPoS consensus engine together with the address packing helpers
//! for its validator fields.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod header;
pub use header::{ADDRESS_LENGTH, BrcBlockHeader, pack_addresses, unpack_addresses};

pub use alloy_primitives::{Address, B64, B256, BlockHash, Bloom, Bytes, U256};
