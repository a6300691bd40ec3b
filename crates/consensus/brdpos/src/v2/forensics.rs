//! BRDPoS V2 forensics
//!
//! Evidence of safety violations observed by this node. Detection never interrupts consensus;
//! the evidence is handed to subscribers of the forensics feed.

use super::{BlockInfo, QuorumCert, Round, VoteForSign, types::vote_sig_hash};
use crate::{
    chain::ChainReader,
    errors::{BrdposError, BrdposResult},
    v2::verification::recover_unique_signers,
};
use alloc::vec::Vec;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Evidence of a safety violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ForensicsEvent {
    /// A masternode voted for two different blocks in the same round
    #[serde(rename_all = "camelCase")]
    Equivocation {
        /// Offending masternode
        signer: Address,
        /// Round both votes belong to
        round: Round,
        /// Block of the vote that was counted
        first: BlockInfo,
        /// Block of the conflicting vote
        second: BlockInfo,
    },
    /// A certificate above the committed round for a block that does not extend the committed
    /// block
    #[serde(rename_all = "camelCase")]
    AncestorDivergence {
        /// Highest committed block
        committed: BlockInfo,
        /// Block certified by the diverging QC
        certified: BlockInfo,
        /// Masternodes that signed the diverging QC
        signers: Vec<Address>,
    },
}

impl ForensicsEvent {
    /// Masternodes implicated by the evidence
    pub fn offenders(&self) -> Vec<Address> {
        match self {
            Self::Equivocation { signer, .. } => alloc::vec![*signer],
            Self::AncestorDivergence { signers, .. } => signers.clone(),
        }
    }
}

/// Evidence for two conflicting votes of `signer`, if they certify different blocks
pub fn detect_equivocation(
    signer: Address,
    first: &BlockInfo,
    second: &BlockInfo,
) -> Option<ForensicsEvent> {
    if first.round != second.round || first.hash == second.hash {
        return None;
    }
    warn!(
        target: "consensus::brdpos",
        %signer,
        round = first.round,
        first = %first.hash,
        second = %second.hash,
        "Equivocation detected"
    );
    Some(ForensicsEvent::Equivocation { signer, round: first.round, first: *first, second: *second })
}

/// Check that a QC above the committed round certifies a descendant of the committed block.
///
/// The certified block must be known to `chain`.
pub fn detect_ancestor_divergence(
    chain: &dyn ChainReader,
    committed: &BlockInfo,
    qc: &QuorumCert,
) -> BrdposResult<Option<ForensicsEvent>> {
    let certified = qc.proposed_block_info;
    if certified.round <= committed.round {
        return Ok(None);
    }

    let diverged = certified.number < committed.number ||
        ancestor_at(chain, certified.hash, committed.number)? != committed.hash;
    if !diverged {
        return Ok(None);
    }

    let hash = vote_sig_hash(&VoteForSign { proposed_block_info: certified, gap_number: qc.gap_number });
    let (_, signers) = recover_unique_signers(&hash, &qc.signatures)?;
    warn!(
        target: "consensus::brdpos",
        committed = committed.number,
        certified = certified.number,
        round = certified.round,
        signers = signers.len(),
        "Certificate does not extend the committed block"
    );
    Ok(Some(ForensicsEvent::AncestorDivergence { committed: *committed, certified, signers }))
}

/// Hash of the ancestor of `hash` at `number`
pub(crate) fn ancestor_at(chain: &dyn ChainReader, hash: B256, number: u64) -> BrdposResult<B256> {
    let mut header = chain.header_by_hash(&hash).ok_or(BrdposError::HeaderNotFound(hash))?;
    let mut cursor = hash;
    while header.number > number {
        cursor = header.parent_hash;
        header = chain.header_by_hash(&cursor).ok_or(BrdposError::HeaderNotFound(cursor))?;
    }
    Ok(cursor)
}
