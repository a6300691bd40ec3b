//! BRDPoS V2 Signature Verification
//!
//! This module implements signature verification for:
//! - Quorum Certificates (QC)
//! - Timeout Certificates (TC)
//! - Vote messages
//! - Timeout messages
//!
//! Certificate checks here are purely cryptographic. Binding a certificate to the chain (block
//! info and gap number) is done by the engine.

use super::{QuorumCert, Signature, Timeout, TimeoutCert, Vote};
use crate::{
    crypto::{recover_signer, verify_signature},
    errors::{BrdposError, BrdposResult},
    v2::types::{timeout_sig_hash, vote_sig_hash},
};
use alloc::{format, vec::Vec};
use alloy_primitives::{Address, B256, keccak256};
use hashbrown::HashSet;
use rayon::prelude::*;
use tracing::warn;

/// Split signatures into unique ones and byte-identical duplicates
pub fn unique_signatures(signatures: &[Signature]) -> (Vec<Signature>, Vec<Signature>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = Vec::new();

    for sig in signatures {
        if seen.insert(keccak256(sig)) {
            unique.push(sig.clone());
        } else {
            duplicates.push(sig.clone());
        }
    }

    (unique, duplicates)
}

/// Recover signers in parallel, keeping the first signature of every distinct signer.
///
/// Returns the signatures and signers in input order.
pub fn recover_unique_signers(
    hash: &B256,
    signatures: &[Signature],
) -> BrdposResult<(Vec<Signature>, Vec<Address>)> {
    let recovered = signatures
        .par_iter()
        .map(|sig| recover_signer(hash, sig).map(|addr| (sig.clone(), addr)))
        .collect::<BrdposResult<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let (sigs, signers) = recovered.into_iter().filter(|(_, addr)| seen.insert(*addr)).unzip();
    Ok((sigs, signers))
}

/// Check distinct valid signatures over `hash` from `masternodes` reach `threshold`.
fn verify_certificate_signatures(
    kind: &str,
    hash: &B256,
    signatures: &[Signature],
    masternodes: &[Address],
    threshold: usize,
) -> BrdposResult<()> {
    if masternodes.is_empty() {
        return Err(BrdposError::MasternodesNotFound);
    }

    let (unique_sigs, duplicates) = unique_signatures(signatures);
    if !duplicates.is_empty() {
        warn!(
            target: "consensus::brdpos",
            kind,
            duplicates = duplicates.len(),
            "Duplicate signatures in certificate"
        );
    }

    if unique_sigs.len() < threshold {
        return Err(BrdposError::InsufficientSignatures { have: unique_sigs.len(), need: threshold });
    }

    let signers = unique_sigs
        .par_iter()
        .map(|sig| {
            let (is_valid, signer) = verify_signature(hash, sig, masternodes)?;
            if !is_valid {
                warn!(target: "consensus::brdpos", kind, %signer, "Certificate signed by non-masternode");
                return Err(BrdposError::BadQuorum(format!("{kind} signed by non-masternode {signer}")));
            }
            Ok(signer)
        })
        .collect::<BrdposResult<Vec<_>>>()?;

    // two different encodings of one signer's signature only count once
    let distinct = signers.iter().collect::<HashSet<_>>().len();
    if distinct < threshold {
        return Err(BrdposError::InsufficientSignatures { have: distinct, need: threshold });
    }

    Ok(())
}

/// Verify the signatures of a Quorum Certificate against the masternodes of the certified
/// block's epoch.
///
/// A round 0 certificate is the seed certificate of the v2 switch block and carries no
/// signatures.
pub fn verify_qc(qc: &QuorumCert, masternodes: &[Address], threshold: usize) -> BrdposResult<()> {
    if qc.proposed_block_info.round == 0 {
        return Ok(());
    }
    let hash = vote_sig_hash(&super::VoteForSign {
        proposed_block_info: qc.proposed_block_info,
        gap_number: qc.gap_number,
    });
    verify_certificate_signatures("qc", &hash, &qc.signatures, masternodes, threshold)
}

/// Verify the signatures of a Timeout Certificate against the masternodes of its round's epoch
pub fn verify_tc(tc: &TimeoutCert, masternodes: &[Address], threshold: usize) -> BrdposResult<()> {
    let hash =
        timeout_sig_hash(&super::TimeoutForSign { round: tc.round, gap_number: tc.gap_number });
    verify_certificate_signatures("tc", &hash, &tc.signatures, masternodes, threshold)
}

/// Recover the signer of a vote and check it is one of `masternodes`
pub fn verify_vote_message(vote: &Vote, masternodes: &[Address]) -> BrdposResult<Address> {
    let (is_valid, signer) =
        verify_signature(&vote_sig_hash(&vote.for_sign()), &vote.signature, masternodes)?;
    if !is_valid {
        return Err(BrdposError::UnknownSigner(signer));
    }
    Ok(signer)
}

/// Recover the signer of a timeout and check it is one of `masternodes`
pub fn verify_timeout_message(timeout: &Timeout, masternodes: &[Address]) -> BrdposResult<Address> {
    let (is_valid, signer) =
        verify_signature(&timeout_sig_hash(&timeout.for_sign()), &timeout.signature, masternodes)?;
    if !is_valid {
        return Err(BrdposError::UnknownSigner(signer));
    }
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ConsensusSigner, LocalSigner,
        v2::{BlockInfo, TimeoutForSign, VoteForSign},
    };
    use alloy_primitives::Bytes;
    use assert_matches::assert_matches;

    fn signers(n: u8) -> Vec<LocalSigner> {
        (1..=n).map(|i| LocalSigner::from_bytes(&[i; 32]).unwrap()).collect()
    }

    fn signed_qc(keys: &[LocalSigner], info: BlockInfo) -> QuorumCert {
        let hash = vote_sig_hash(&VoteForSign { proposed_block_info: info, gap_number: 450 });
        let mut qc = QuorumCert::new(info, 450);
        for key in keys {
            qc.add_signature(key.sign_hash(&hash).unwrap());
        }
        qc
    }

    #[test]
    fn test_unique_signatures() {
        let sig1 = Bytes::from_static(&[1, 2, 3]);
        let sig2 = Bytes::from_static(&[4, 5, 6]);
        let (unique, duplicates) = unique_signatures(&[sig1.clone(), sig2, sig1]);
        assert_eq!(unique.len(), 2);
        assert_eq!(duplicates.len(), 1);
    }

    #[test]
    fn test_verify_qc() {
        let keys = signers(4);
        let masternodes: Vec<_> = keys.iter().map(|k| k.address()).collect();
        let info = BlockInfo::new(B256::with_last_byte(9), 5, 905);

        let qc = signed_qc(&keys[..3], info);
        assert!(verify_qc(&qc, &masternodes, 3).is_ok());

        let qc = signed_qc(&keys[..2], info);
        assert_matches!(
            verify_qc(&qc, &masternodes, 3),
            Err(BrdposError::InsufficientSignatures { have: 2, need: 3 })
        );
    }

    #[test]
    fn test_verify_qc_duplicates_do_not_count() {
        let keys = signers(4);
        let masternodes: Vec<_> = keys.iter().map(|k| k.address()).collect();
        let info = BlockInfo::new(B256::with_last_byte(9), 5, 905);

        let mut qc = signed_qc(&keys[..2], info);
        let dup = qc.signatures[0].clone();
        qc.add_signature(dup);
        assert_matches!(
            verify_qc(&qc, &masternodes, 3),
            Err(BrdposError::InsufficientSignatures { have: 2, need: 3 })
        );
    }

    #[test]
    fn test_verify_qc_rejects_outsider() {
        let keys = signers(5);
        let masternodes: Vec<_> = keys[..4].iter().map(|k| k.address()).collect();
        let info = BlockInfo::new(B256::with_last_byte(9), 5, 905);

        let qc = signed_qc(&[keys[0].clone(), keys[1].clone(), keys[4].clone()], info);
        assert_matches!(verify_qc(&qc, &masternodes, 3), Err(BrdposError::BadQuorum(_)));
    }

    #[test]
    fn test_verify_qc_round_zero() {
        let qc = QuorumCert::new(BlockInfo::new(B256::with_last_byte(1), 0, 900), 450);
        assert!(verify_qc(&qc, &[Address::with_last_byte(1)], 1).is_ok());
    }

    #[test]
    fn test_verify_tc() {
        let keys = signers(3);
        let masternodes: Vec<_> = keys.iter().map(|k| k.address()).collect();
        let hash = timeout_sig_hash(&TimeoutForSign { round: 5, gap_number: 450 });
        let mut tc = TimeoutCert::new(5, 450);
        for key in &keys[..2] {
            tc.add_signature(key.sign_hash(&hash).unwrap());
        }
        assert!(verify_tc(&tc, &masternodes, 2).is_ok());
        assert_matches!(
            verify_tc(&tc, &masternodes, 3),
            Err(BrdposError::InsufficientSignatures { have: 2, need: 3 })
        );
        assert_matches!(verify_tc(&tc, &[], 2), Err(BrdposError::MasternodesNotFound));
    }

    #[test]
    fn test_verify_vote_message() {
        let keys = signers(2);
        let info = BlockInfo::new(B256::with_last_byte(9), 5, 905);
        let sig = keys[0]
            .sign_hash(&vote_sig_hash(&VoteForSign { proposed_block_info: info, gap_number: 450 }))
            .unwrap();
        let vote = Vote::new(info, sig, 450);

        assert_eq!(verify_vote_message(&vote, &[keys[0].address()]).unwrap(), keys[0].address());
        assert_matches!(
            verify_vote_message(&vote, &[keys[1].address()]),
            Err(BrdposError::UnknownSigner(_))
        );
    }

    #[test]
    fn test_recover_unique_signers() {
        let keys = signers(2);
        let hash = keccak256(b"payload");
        let a = keys[0].sign_hash(&hash).unwrap();
        let b = keys[1].sign_hash(&hash).unwrap();
        let (sigs, addrs) = recover_unique_signers(&hash, &[a.clone(), b, a]).unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(addrs, vec![keys[0].address(), keys[1].address()]);
    }
}
