//! Block header, block, and compact block types.

use umbrad_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u32,
    pub parent: Hash256,
    pub timestamp: i64,
    pub tx_root: Hash256,
    pub producer_id: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_mode(true)
    }

    /// Serialization the block id commits to. The producer signature is
    /// excluded since it signs the id.
    pub fn consensus_encode_for_id(&self) -> Vec<u8> {
        self.encode_with_mode(false)
    }

    pub fn block_id(&self) -> Hash256 {
        sha256d(&self.consensus_encode_for_id())
    }

    fn encode_with_mode(&self, include_signature: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.height);
        encoder.write_hash(&self.parent);
        encoder.write_i64_le(self.timestamp);
        encoder.write_hash(&self.tx_root);
        encoder.write_var_bytes(&self.producer_id);
        if include_signature {
            encoder.write_var_bytes(&self.signature);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            height: decoder.read_u32_le()?,
            parent: decoder.read_hash()?,
            timestamp: decoder.read_i64_le()?,
            tx_root: decoder.read_hash()?,
            producer_id: decoder.read_var_bytes()?,
            signature: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_id(&self) -> Hash256 {
        self.header.block_id()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    /// Merkle root over the block's txids.
    pub fn computed_tx_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(block)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Binary merkle root over txids, duplicating the last node of odd layers.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = *layer.last().expect("non-empty layer");
            layer.push(last);
        }
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            let mut buf = [0u8; 64];
            buf[0..32].copy_from_slice(&pair[0]);
            buf[32..64].copy_from_slice(&pair[1]);
            next.push(sha256d(&buf));
        }
        layer = next;
    }
    layer[0]
}

pub const FINGERPRINT_LEN: usize = 8;

/// Truncated txid used by the compact block encoding.
pub type TxFingerprint = [u8; FINGERPRINT_LEN];

pub fn tx_fingerprint(txid: &Hash256) -> TxFingerprint {
    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&txid[..FINGERPRINT_LEN]);
    out
}

/// Compact block announcement: the full header plus one lossy fingerprint
/// per transaction. Receivers resolve fingerprints against their mempool
/// and fetch whatever fails to resolve. The block id of the compact form
/// equals the block id of the full block since both hash the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XThinnerBlock {
    pub header: BlockHeader,
    pub fingerprints: Vec<TxFingerprint>,
}

impl XThinnerBlock {
    pub fn from_block(block: &Block) -> Self {
        Self {
            header: block.header.clone(),
            fingerprints: block
                .transactions
                .iter()
                .map(|tx| tx_fingerprint(&tx.txid()))
                .collect(),
        }
    }

    pub fn block_id(&self) -> Hash256 {
        self.header.block_id()
    }

    pub fn tx_count(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_varint(self.fingerprints.len() as u64);
        for fingerprint in &self.fingerprints {
            encoder.write_bytes(fingerprint);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut fingerprints = Vec::with_capacity(count);
        for _ in 0..count {
            fingerprints.push(decoder.read_fixed::<FINGERPRINT_LEN>()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            fingerprints,
        })
    }
}
