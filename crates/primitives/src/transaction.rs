//! Transaction types and serialization.
//!
//! Privacy fields (commitments, ciphertexts, proofs) are opaque byte
//! payloads here; proving and verification live behind external
//! collaborators. The node only needs deterministic ids, nullifier and
//! txo-root accessors, and the canonical wire encoding.

use umbrad_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;

const TAG_STANDARD: u8 = 0;
const TAG_COINBASE: u8 = 1;
const TAG_STAKE: u8 = 2;
const TAG_TREASURY: u8 = 3;
const TAG_MINT: u8 = 4;

/// A shielded transaction output: a commitment binding amount, asset,
/// script, salt, and state, plus the ciphertext for the recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub commitment: Hash256,
    pub ciphertext: Vec<u8>,
}

impl Encodable for Output {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.commitment);
        encoder.write_var_bytes(&self.ciphertext);
    }
}

impl Decodable for Output {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let commitment = decoder.read_hash()?;
        let ciphertext = decoder.read_var_bytes()?;
        Ok(Self {
            commitment,
            ciphertext,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StandardTransaction {
    pub outputs: Vec<Output>,
    pub nullifiers: Vec<Hash256>,
    pub txo_root: Hash256,
    pub locktime: i64,
    pub fee: u64,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CoinbaseTransaction {
    pub validator_id: Vec<u8>,
    pub new_coins: u64,
    pub outputs: Vec<Output>,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StakeTransaction {
    pub validator_id: Vec<u8>,
    pub amount: u64,
    pub nullifier: Hash256,
    pub txo_root: Hash256,
    pub locktime: i64,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TreasuryTransaction {
    pub amount: u64,
    pub outputs: Vec<Output>,
    pub proposal_hash: Hash256,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MintTransaction {
    pub asset_id: Hash256,
    pub new_tokens: u64,
    pub outputs: Vec<Output>,
    pub nullifiers: Vec<Hash256>,
    pub txo_root: Hash256,
    pub fee: u64,
    pub mint_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    Standard(StandardTransaction),
    Coinbase(CoinbaseTransaction),
    Stake(StakeTransaction),
    Treasury(TreasuryTransaction),
    Mint(MintTransaction),
}

impl Transaction {
    /// Deterministic id over the canonical serialization.
    pub fn txid(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    /// Stand-in for a transaction the mempool could not resolve. The slot
    /// is expected to be repaired before the tx-root check passes.
    pub fn placeholder() -> Self {
        Transaction::Standard(StandardTransaction::default())
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            Transaction::Standard(tx) => &tx.outputs,
            Transaction::Coinbase(tx) => &tx.outputs,
            Transaction::Stake(_) => &[],
            Transaction::Treasury(tx) => &tx.outputs,
            Transaction::Mint(tx) => &tx.outputs,
        }
    }

    pub fn nullifiers(&self) -> Vec<Hash256> {
        match self {
            Transaction::Standard(tx) => tx.nullifiers.clone(),
            Transaction::Coinbase(_) | Transaction::Treasury(_) => Vec::new(),
            Transaction::Stake(tx) => vec![tx.nullifier],
            Transaction::Mint(tx) => tx.nullifiers.clone(),
        }
    }

    /// The txo accumulator root the proof was built against, if any.
    pub fn txo_root(&self) -> Option<Hash256> {
        match self {
            Transaction::Standard(tx) => Some(tx.txo_root),
            Transaction::Stake(tx) => Some(tx.txo_root),
            Transaction::Mint(tx) => Some(tx.txo_root),
            Transaction::Coinbase(_) | Transaction::Treasury(_) => None,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Transaction::Standard(tx) => tx.fee,
            Transaction::Mint(tx) => tx.fee,
            _ => 0,
        }
    }
}

fn write_outputs(encoder: &mut Encoder, outputs: &[Output]) {
    encoder.write_varint(outputs.len() as u64);
    for output in outputs {
        output.consensus_encode(encoder);
    }
}

fn read_outputs(decoder: &mut Decoder) -> Result<Vec<Output>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut outputs = Vec::with_capacity(count);
    for _ in 0..count {
        outputs.push(Output::consensus_decode(decoder)?);
    }
    Ok(outputs)
}

fn write_hashes(encoder: &mut Encoder, hashes: &[Hash256]) {
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_hash(hash);
    }
}

fn read_hashes(decoder: &mut Decoder) -> Result<Vec<Hash256>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(decoder.read_hash()?);
    }
    Ok(hashes)
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        match self {
            Transaction::Standard(tx) => {
                encoder.write_u8(TAG_STANDARD);
                write_outputs(encoder, &tx.outputs);
                write_hashes(encoder, &tx.nullifiers);
                encoder.write_hash(&tx.txo_root);
                encoder.write_i64_le(tx.locktime);
                encoder.write_u64_le(tx.fee);
                encoder.write_var_bytes(&tx.proof);
            }
            Transaction::Coinbase(tx) => {
                encoder.write_u8(TAG_COINBASE);
                encoder.write_var_bytes(&tx.validator_id);
                encoder.write_u64_le(tx.new_coins);
                write_outputs(encoder, &tx.outputs);
                encoder.write_var_bytes(&tx.signature);
                encoder.write_var_bytes(&tx.proof);
            }
            Transaction::Stake(tx) => {
                encoder.write_u8(TAG_STAKE);
                encoder.write_var_bytes(&tx.validator_id);
                encoder.write_u64_le(tx.amount);
                encoder.write_hash(&tx.nullifier);
                encoder.write_hash(&tx.txo_root);
                encoder.write_i64_le(tx.locktime);
                encoder.write_var_bytes(&tx.signature);
                encoder.write_var_bytes(&tx.proof);
            }
            Transaction::Treasury(tx) => {
                encoder.write_u8(TAG_TREASURY);
                encoder.write_u64_le(tx.amount);
                write_outputs(encoder, &tx.outputs);
                encoder.write_hash(&tx.proposal_hash);
                encoder.write_var_bytes(&tx.proof);
            }
            Transaction::Mint(tx) => {
                encoder.write_u8(TAG_MINT);
                encoder.write_hash(&tx.asset_id);
                encoder.write_u64_le(tx.new_tokens);
                write_outputs(encoder, &tx.outputs);
                write_hashes(encoder, &tx.nullifiers);
                encoder.write_hash(&tx.txo_root);
                encoder.write_u64_le(tx.fee);
                encoder.write_var_bytes(&tx.mint_key);
                encoder.write_var_bytes(&tx.signature);
                encoder.write_var_bytes(&tx.proof);
            }
        }
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tag = decoder.read_u8()?;
        match tag {
            TAG_STANDARD => Ok(Transaction::Standard(StandardTransaction {
                outputs: read_outputs(decoder)?,
                nullifiers: read_hashes(decoder)?,
                txo_root: decoder.read_hash()?,
                locktime: decoder.read_i64_le()?,
                fee: decoder.read_u64_le()?,
                proof: decoder.read_var_bytes()?,
            })),
            TAG_COINBASE => Ok(Transaction::Coinbase(CoinbaseTransaction {
                validator_id: decoder.read_var_bytes()?,
                new_coins: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                signature: decoder.read_var_bytes()?,
                proof: decoder.read_var_bytes()?,
            })),
            TAG_STAKE => Ok(Transaction::Stake(StakeTransaction {
                validator_id: decoder.read_var_bytes()?,
                amount: decoder.read_u64_le()?,
                nullifier: decoder.read_hash()?,
                txo_root: decoder.read_hash()?,
                locktime: decoder.read_i64_le()?,
                signature: decoder.read_var_bytes()?,
                proof: decoder.read_var_bytes()?,
            })),
            TAG_TREASURY => Ok(Transaction::Treasury(TreasuryTransaction {
                amount: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                proposal_hash: decoder.read_hash()?,
                proof: decoder.read_var_bytes()?,
            })),
            TAG_MINT => Ok(Transaction::Mint(MintTransaction {
                asset_id: decoder.read_hash()?,
                new_tokens: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                nullifiers: read_hashes(decoder)?,
                txo_root: decoder.read_hash()?,
                fee: decoder.read_u64_le()?,
                mint_key: decoder.read_var_bytes()?,
                signature: decoder.read_var_bytes()?,
                proof: decoder.read_var_bytes()?,
            })),
            _ => Err(DecodeError::InvalidData("unknown transaction tag")),
        }
    }
}
