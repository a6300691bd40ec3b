//! Signing and signer recovery.
//!
//! Signatures are 65 bytes, `r || s || v`, over a 32 byte keccak digest. `v` is the raw recovery
//! id; the legacy `27`/`28` offset is accepted when recovering.

use crate::{
    errors::{BrdposError, BrdposResult},
    v2::Signature,
};
use alloc::{format, string::ToString};
use alloy_primitives::{Address, B256, keccak256};
use brc_primitives::BrcBlockHeader;
use core::fmt;
use secp256k1::{
    Message, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};

/// Length of a recoverable signature
pub const SIGNATURE_LENGTH: usize = 65;

/// Produces signatures on behalf of the local masternode.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ConsensusSigner: fmt::Debug + Send + Sync {
    /// Address the signatures recover to
    fn address(&self) -> Address;

    /// Signs a 32 byte digest
    fn sign_hash(&self, hash: &B256) -> BrdposResult<Signature>;
}

/// In-process secp256k1 signer.
#[derive(Clone)]
pub struct LocalSigner {
    secret: SecretKey,
    address: Address,
}

impl LocalSigner {
    /// Creates a signer from a raw 32 byte private key
    pub fn from_bytes(key: &[u8; 32]) -> BrdposResult<Self> {
        let secret = SecretKey::from_slice(key)
            .map_err(|e| BrdposError::InvalidSignature(format!("bad private key: {e}")))?;
        let address = public_key_to_address(&secret.public_key(SECP256K1));
        Ok(Self { secret, address })
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner").field("address", &self.address).finish_non_exhaustive()
    }
}

impl ConsensusSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_hash(&self, hash: &B256) -> BrdposResult<Signature> {
        let message = Message::from_digest(hash.0);
        let (recovery_id, compact) =
            SECP256K1.sign_ecdsa_recoverable(&message, &self.secret).serialize_compact();
        let mut sig = [0u8; SIGNATURE_LENGTH];
        sig[..64].copy_from_slice(&compact);
        sig[64] = recovery_id.to_i32() as u8;
        Ok(Signature::copy_from_slice(&sig))
    }
}

/// Ethereum style address of a public key
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let serialized = public_key.serialize_uncompressed();
    Address::from_slice(&keccak256(&serialized[1..])[12..])
}

/// Recover the signer address from a signature over `hash`
pub fn recover_signer(hash: &B256, signature: &[u8]) -> BrdposResult<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(BrdposError::InvalidSignature(format!(
            "expected {SIGNATURE_LENGTH} bytes, got {}",
            signature.len()
        )));
    }
    let v = signature[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(v as i32)
        .map_err(|e| BrdposError::InvalidSignature(e.to_string()))?;
    let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|e| BrdposError::InvalidSignature(e.to_string()))?;
    let public_key = SECP256K1
        .recover_ecdsa(&Message::from_digest(hash.0), &sig)
        .map_err(|e| BrdposError::InvalidSignature(e.to_string()))?;
    Ok(public_key_to_address(&public_key))
}

/// Recover the signer and report whether it is one of `masternodes`
pub fn verify_signature(
    hash: &B256,
    signature: &[u8],
    masternodes: &[Address],
) -> BrdposResult<(bool, Address)> {
    if masternodes.is_empty() {
        return Err(BrdposError::MasternodesNotFound);
    }
    let signer = recover_signer(hash, signature)?;
    Ok((masternodes.contains(&signer), signer))
}

/// Digest the block producer signs
pub fn header_sig_hash(header: &BrcBlockHeader) -> B256 {
    header.seal_hash()
}

/// Recover the producer of a v2 header from its `validator` seal
pub fn recover_header_signer(header: &BrcBlockHeader) -> BrdposResult<Address> {
    if header.validator.is_empty() {
        return Err(BrdposError::MissingSeal);
    }
    recover_signer(&header_sig_hash(header), &header.validator)
}

/// Sign a header in place with the local signer
pub fn seal_header(header: &mut BrcBlockHeader, signer: &dyn ConsensusSigner) -> BrdposResult<()> {
    let sig = signer.sign_hash(&header_sig_hash(header))?;
    header.validator = sig;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn signer(byte: u8) -> LocalSigner {
        LocalSigner::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = signer(1);
        let hash = keccak256(b"brdpos");
        let sig = signer.sign_hash(&hash).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert_eq!(recover_signer(&hash, &sig).unwrap(), signer.address());

        // legacy v offset
        let mut legacy = sig.to_vec();
        legacy[64] += 27;
        assert_eq!(recover_signer(&hash, &legacy).unwrap(), signer.address());
    }

    #[test]
    fn test_recover_wrong_length() {
        assert_matches!(
            recover_signer(&B256::ZERO, &[0u8; 64]),
            Err(BrdposError::InvalidSignature(_))
        );
    }

    #[test]
    fn test_verify_signature_membership() {
        let a = signer(1);
        let b = signer(2);
        let hash = keccak256(b"vote");
        let sig = a.sign_hash(&hash).unwrap();

        let (ok, who) = verify_signature(&hash, &sig, &[a.address(), b.address()]).unwrap();
        assert!(ok);
        assert_eq!(who, a.address());

        let (ok, _) = verify_signature(&hash, &sig, &[b.address()]).unwrap();
        assert!(!ok);

        assert_matches!(verify_signature(&hash, &sig, &[]), Err(BrdposError::MasternodesNotFound));
    }

    #[test]
    fn test_seal_header() {
        let signer = signer(3);
        let mut header = BrcBlockHeader { number: 901, ..Default::default() };
        assert_matches!(recover_header_signer(&header), Err(BrdposError::MissingSeal));

        seal_header(&mut header, &signer).unwrap();
        assert_eq!(recover_header_signer(&header).unwrap(), signer.address());
    }
}
