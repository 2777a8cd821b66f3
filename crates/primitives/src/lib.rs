//! Core wire types: blocks, transactions, and their canonical encoding.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod transaction;

pub use block::{merkle_root, tx_fingerprint, Block, BlockHeader, TxFingerprint, XThinnerBlock};
pub use transaction::{Output, Transaction};
