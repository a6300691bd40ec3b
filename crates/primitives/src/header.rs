//! BRC block header with BRDPoS validator fields.

use alloc::vec::Vec;
use alloy_primitives::{Address, B256, B64, Bloom, Bytes, U256, bytes::BufMut, keccak256};
use alloy_rlp::{Decodable, Encodable, Header as RlpHeader};

/// Length in bytes of a packed validator address.
pub const ADDRESS_LENGTH: usize = 20;

/// BRC block header.
///
/// This is the pre-London Ethereum header followed by three consensus fields used by BRDPoS:
/// - `validators`: packed 20-byte addresses of the masternodes of a new epoch (epoch switch
///   blocks only)
/// - `validator`: the 65-byte seal signature of the block producer
/// - `penalties`: packed 20-byte addresses penalized for the outgoing epoch
///
/// RLP encoding order: the 15 standard fields, then `validators`, `validator`, `penalties`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct BrcBlockHeader {
    /// The Keccak 256-bit hash of the parent block's header, in its entirety.
    pub parent_hash: B256,
    /// The Keccak 256-bit hash of the ommers list portion of this block.
    pub ommers_hash: B256,
    /// The 160-bit address to which all fees collected from the successful mining of this block
    /// be transferred.
    pub beneficiary: Address,
    /// The Keccak 256-bit hash of the root node of the state trie.
    pub state_root: B256,
    /// The Keccak 256-bit hash of the root node of the transactions trie.
    pub transactions_root: B256,
    /// The Keccak 256-bit hash of the root node of the receipts trie.
    pub receipts_root: B256,
    /// The Bloom filter composed from indexable information contained in each log entry.
    pub logs_bloom: Bloom,
    /// Block difficulty. BRDPoS v2 blocks always carry a difficulty of one.
    pub difficulty: U256,
    /// Number of ancestor blocks. The genesis block has a number of zero.
    pub number: u64,
    /// Current limit of gas expenditure per block.
    pub gas_limit: u64,
    /// Total gas used in transactions in this block.
    pub gas_used: u64,
    /// Unix timestamp in seconds at this block's inception.
    pub timestamp: u64,
    /// Consensus extra data. Legacy blocks carry vanity, checkpoint signers and seal; v2 blocks
    /// carry a version byte followed by RLP encoded round and quorum certificate.
    pub extra_data: Bytes,
    /// Reserved, always zero.
    pub mix_hash: B256,
    /// Reserved, always zero for v2 blocks.
    pub nonce: B64,
    /// Packed masternode addresses. Empty for non epoch switch blocks.
    pub validators: Bytes,
    /// Seal signature of the producer.
    pub validator: Bytes,
    /// Packed penalized addresses.
    pub penalties: Bytes,
}

impl BrcBlockHeader {
    /// Computes the hash of the header via keccak256 over all 18 fields.
    pub fn hash_slow(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(&buf)
    }

    /// Computes the hash the producer signs: every field except the `validator` seal.
    pub fn seal_hash(&self) -> B256 {
        let payload_length = self.payload_length(false);
        let mut buf = Vec::with_capacity(payload_length + alloy_rlp::length_of_length(payload_length));
        RlpHeader { list: true, payload_length }.encode(&mut buf);
        self.encode_fields(&mut buf, false);
        keccak256(&buf)
    }

    /// Masternode addresses packed into the `validators` field.
    pub fn validator_addresses(&self) -> Vec<Address> {
        unpack_addresses(&self.validators)
    }

    /// Penalized addresses packed into the `penalties` field.
    pub fn penalty_addresses(&self) -> Vec<Address> {
        unpack_addresses(&self.penalties)
    }

    /// Returns the first byte of the extra data, if any.
    pub fn extra_version(&self) -> Option<u8> {
        self.extra_data.first().copied()
    }

    fn payload_length(&self, with_seal: bool) -> usize {
        let mut length = self.parent_hash.length() +
            self.ommers_hash.length() +
            self.beneficiary.length() +
            self.state_root.length() +
            self.transactions_root.length() +
            self.receipts_root.length() +
            self.logs_bloom.length() +
            self.difficulty.length() +
            self.number.length() +
            self.gas_limit.length() +
            self.gas_used.length() +
            self.timestamp.length() +
            self.extra_data.length() +
            self.mix_hash.length() +
            self.nonce.length() +
            self.validators.length();
        if with_seal {
            length += self.validator.length();
        }
        length + self.penalties.length()
    }

    fn encode_fields(&self, out: &mut dyn BufMut, with_seal: bool) {
        self.parent_hash.encode(out);
        self.ommers_hash.encode(out);
        self.beneficiary.encode(out);
        self.state_root.encode(out);
        self.transactions_root.encode(out);
        self.receipts_root.encode(out);
        self.logs_bloom.encode(out);
        self.difficulty.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.timestamp.encode(out);
        self.extra_data.encode(out);
        self.mix_hash.encode(out);
        self.nonce.encode(out);
        self.validators.encode(out);
        if with_seal {
            self.validator.encode(out);
        }
        self.penalties.encode(out);
    }
}

/// Packs addresses back to back, the layout used by `validators` and `penalties`.
pub fn pack_addresses(addresses: &[Address]) -> Bytes {
    let mut out = Vec::with_capacity(addresses.len() * ADDRESS_LENGTH);
    for address in addresses {
        out.extend_from_slice(address.as_slice());
    }
    out.into()
}

/// Splits packed bytes into addresses. A trailing partial address is ignored.
pub fn unpack_addresses(bytes: &[u8]) -> Vec<Address> {
    bytes.chunks_exact(ADDRESS_LENGTH).map(Address::from_slice).collect()
}

impl Encodable for BrcBlockHeader {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader { list: true, payload_length: self.payload_length(true) }.encode(out);
        self.encode_fields(out, true);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length(true);
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for BrcBlockHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();

        let header = Self {
            parent_hash: Decodable::decode(buf)?,
            ommers_hash: Decodable::decode(buf)?,
            beneficiary: Decodable::decode(buf)?,
            state_root: Decodable::decode(buf)?,
            transactions_root: Decodable::decode(buf)?,
            receipts_root: Decodable::decode(buf)?,
            logs_bloom: Decodable::decode(buf)?,
            difficulty: Decodable::decode(buf)?,
            number: Decodable::decode(buf)?,
            gas_limit: Decodable::decode(buf)?,
            gas_used: Decodable::decode(buf)?,
            timestamp: Decodable::decode(buf)?,
            extra_data: Decodable::decode(buf)?,
            mix_hash: Decodable::decode(buf)?,
            nonce: Decodable::decode(buf)?,
            validators: Decodable::decode(buf)?,
            validator: Decodable::decode(buf)?,
            penalties: Decodable::decode(buf)?,
        };

        let consumed = started_len - buf.len();
        if consumed != rlp_head.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_head.payload_length,
                got: consumed,
            });
        }
        Ok(header)
    }
}
