//! Block rule checks and the error taxonomy the ingest pipeline
//! dispatches on.

use umbrad_consensus::{hash256_to_hex, Hash256};

/// A rule violation that makes a block invalid against the current tip.
/// The ingest pipeline maps each kind to a peer-scoring outcome, so the
/// distinction between `InvalidTxRoot`, `DoesNotConnect`, and the rest is
/// load-bearing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleError {
    /// The header tx root does not match the merkle root of the block's
    /// transactions. Either our mempool decode collided or the block is
    /// garbage; the pipeline tries a repair before judging.
    InvalidTxRoot,
    /// The block does not extend the current tip. Usually a race with a
    /// block we just finalized at the same height.
    DoesNotConnect,
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    DuplicateTxid,
    DuplicateNullifier,
    UnknownTxoRoot,
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleError::InvalidTxRoot => write!(f, "tx root does not match transactions"),
            RuleError::DoesNotConnect => write!(f, "block does not connect to tip"),
            RuleError::InvalidHeader(message) => write!(f, "{message}"),
            RuleError::InvalidTransaction(message) => write!(f, "{message}"),
            RuleError::DuplicateTxid => write!(f, "duplicate transaction in block"),
            RuleError::DuplicateNullifier => write!(f, "nullifier already spent"),
            RuleError::UnknownTxoRoot => write!(f, "transaction references unknown txo root"),
        }
    }
}

impl std::error::Error for RuleError {}

/// The block is ahead of our tip or hangs off a parent we have never
/// seen. It may well be valid; we cannot judge it yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrphanBlockError {
    pub height: u32,
    pub parent: Hash256,
}

impl std::fmt::Display for OrphanBlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "orphan block at height {} with parent {}",
            self.height,
            hash256_to_hex(&self.parent)
        )
    }
}

impl std::error::Error for OrphanBlockError {}
