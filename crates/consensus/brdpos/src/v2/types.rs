//! BRDPoS V2 header extra codec and signature hashes
//!
//! v2 headers carry `0x02 || rlp([round, [[hash, round, number], [signatures...], gapNumber]])`
//! in their extra data. Votes and timeouts sign the keccak256 of the RLP of [`VoteForSign`] and
//! [`TimeoutForSign`].

use super::{ExtraFieldsV2, QuorumCert, Round, TimeoutForSign, VoteForSign};
use crate::{
    constants::EXTRA_V2_VERSION,
    errors::{BrdposError, BrdposResult},
};
use alloc::{format, vec::Vec};
use alloy_primitives::{B256, Bytes, keccak256};
use alloy_rlp::Encodable;

/// Compute the signature hash for a Vote
pub fn vote_sig_hash(vote: &VoteForSign) -> B256 {
    keccak256(alloy_rlp::encode(vote))
}

/// Compute the signature hash for a Timeout
pub fn timeout_sig_hash(timeout: &TimeoutForSign) -> B256 {
    keccak256(alloy_rlp::encode(timeout))
}

/// Encode v2 extra fields with the version prefix
pub fn encode_extra_fields_v2(round: Round, quorum_cert: &QuorumCert) -> Bytes {
    let fields = ExtraFieldsV2::new(round, quorum_cert.clone());
    let mut out = Vec::with_capacity(1 + fields.length());
    out.push(EXTRA_V2_VERSION);
    fields.encode(&mut out);
    out.into()
}

/// Decode v2 extra fields, rejecting any other version byte and trailing bytes
pub fn decode_extra_fields_v2(bytes: &[u8]) -> BrdposResult<ExtraFieldsV2> {
    let Some((&version, payload)) = bytes.split_first() else {
        return Err(BrdposError::BadExtra("extra field is empty".into()));
    };
    if version != EXTRA_V2_VERSION {
        return Err(BrdposError::BadExtra(format!("not a v2 block, version: {version}")));
    }
    alloy_rlp::decode_exact::<ExtraFieldsV2>(payload)
        .map_err(|e| BrdposError::BadExtra(format!("failed to decode extra fields: {e}")))
}
