//! Legacy (v1) helpers
//!
//! Only what the v2 engine needs from the legacy chain:
//! - masternodes packed into checkpoint extra data
//! - checkpoint (epoch switch) detection by block number
//! - masternodes in effect for a legacy header

use crate::{
    chain::ChainReader,
    constants::{EXTRA_SEAL, EXTRA_VANITY},
    errors::{BrdposError, BrdposResult},
};
use alloc::{format, vec::Vec};
use alloy_primitives::Address;
use brc_primitives::{ADDRESS_LENGTH, BrcBlockHeader, unpack_addresses};

/// Extract signers from checkpoint header extra data: `vanity || addresses || seal`
pub fn extract_checkpoint_signers(extra: &[u8]) -> BrdposResult<Vec<Address>> {
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(BrdposError::BadExtra(format!(
            "checkpoint extra too short: {} bytes",
            extra.len()
        )));
    }

    let signers_data = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
    if signers_data.len() % ADDRESS_LENGTH != 0 {
        return Err(BrdposError::BadExtra(format!(
            "checkpoint signers not a multiple of {ADDRESS_LENGTH} bytes"
        )));
    }

    Ok(unpack_addresses(signers_data))
}

/// Masternodes recorded by a checkpoint header
pub fn masternodes_from_checkpoint_header(header: &BrcBlockHeader) -> BrdposResult<Vec<Address>> {
    extract_checkpoint_signers(&header.extra_data)
}

/// Whether a legacy header opens an epoch, and the epoch number
pub const fn is_epoch_switch(number: u64, epoch: u64) -> (bool, u64) {
    (number % epoch == 0, number / epoch)
}

/// Checkpoint number of the legacy epoch containing `number`, and the epoch number
pub const fn current_epoch_switch_block(number: u64, epoch: u64) -> (u64, u64) {
    (number - number % epoch, number / epoch)
}

/// Masternodes in effect at a legacy header: those of its epoch checkpoint
pub fn get_masternodes(
    chain: &dyn ChainReader,
    header: &BrcBlockHeader,
    epoch: u64,
) -> BrdposResult<Vec<Address>> {
    if is_epoch_switch(header.number, epoch).0 {
        return masternodes_from_checkpoint_header(header);
    }
    let (checkpoint, _) = current_epoch_switch_block(header.number, epoch);
    let checkpoint_header =
        chain.header_by_number(checkpoint).ok_or(BrdposError::HeaderNotFoundByNumber(checkpoint))?;
    masternodes_from_checkpoint_header(&checkpoint_header)
}
