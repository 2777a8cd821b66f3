//! Transaction mempool and the xthinner compact-block decoder.
//!
//! Transaction admission policy proper lives with the proof/signature
//! collaborators; this pool tracks validated transactions by txid and by
//! the truncated-txid fingerprint the compact block encoding uses.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use umbrad_consensus::Hash256;
use umbrad_primitives::block::{tx_fingerprint, Block, TxFingerprint, XThinnerBlock};
use umbrad_primitives::encoding::encode;
use umbrad_primitives::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolError {
    AlreadyInMempool,
    MempoolFull,
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::AlreadyInMempool => write!(f, "transaction already in mempool"),
            MempoolError::MempoolFull => write!(f, "mempool is full"),
        }
    }
}

impl std::error::Error for MempoolError {}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub time: u64,
}

impl MempoolEntry {
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    by_fingerprint: HashMap<TxFingerprint, Vec<Hash256>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_fingerprint: HashMap::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn insert(&mut self, tx: Transaction) -> Result<(), MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInMempool);
        }
        let raw = encode(&tx);
        if self.max_bytes > 0 && self.total_bytes + raw.len() > self.max_bytes {
            return Err(MempoolError::MempoolFull);
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let fingerprint = tx_fingerprint(&txid);
        let bucket = self.by_fingerprint.entry(fingerprint).or_default();
        // Buckets stay sorted so fingerprint collisions resolve to the
        // same txid no matter the insertion order.
        let position = bucket.partition_point(|existing| existing < &txid);
        bucket.insert(position, txid);

        self.total_bytes += raw.len();
        self.entries.insert(
            txid,
            MempoolEntry {
                txid,
                tx,
                raw,
                time,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size());
        let fingerprint = tx_fingerprint(txid);
        if let Some(bucket) = self.by_fingerprint.get_mut(&fingerprint) {
            bucket.retain(|candidate| candidate != txid);
            if bucket.is_empty() {
                self.by_fingerprint.remove(&fingerprint);
            }
        }
        Some(entry)
    }

    /// Drop every transaction a freshly connected block contains.
    pub fn remove_block_txs(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.remove(&tx.txid());
        }
    }

    /// Reconstruct a block from a compact announcement against the
    /// current pool. Infallible and deterministic for a given pool: a
    /// fingerprint with several candidates resolves to the smallest
    /// txid, and an unresolvable slot is filled with a placeholder and
    /// reported in the missing list for the caller to repair.
    pub fn decode_xthinner(&self, compact: &XThinnerBlock) -> (Block, Vec<u32>) {
        let mut transactions = Vec::with_capacity(compact.tx_count());
        let mut missing = Vec::new();
        for (index, fingerprint) in compact.fingerprints.iter().enumerate() {
            let resolved = self
                .by_fingerprint
                .get(fingerprint)
                .and_then(|bucket| bucket.first())
                .and_then(|txid| self.entries.get(txid));
            match resolved {
                Some(entry) => transactions.push(entry.tx.clone()),
                None => {
                    transactions.push(Transaction::placeholder());
                    missing.push(index as u32);
                }
            }
        }
        (
            Block {
                header: compact.header.clone(),
                transactions,
            },
            missing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_primitives::block::{merkle_root, BlockHeader, CURRENT_VERSION};
    use umbrad_primitives::transaction::{Output, StandardTransaction};

    fn tx(tag: u8) -> Transaction {
        Transaction::Standard(StandardTransaction {
            outputs: vec![Output {
                commitment: [tag; 32],
                ciphertext: vec![tag; 32],
            }],
            nullifiers: vec![[tag; 32]],
            txo_root: [0u8; 32],
            locktime: 0,
            fee: 100,
            proof: Vec::new(),
        })
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        let tx_root = merkle_root(
            &transactions
                .iter()
                .map(|tx| tx.txid())
                .collect::<Vec<_>>(),
        );
        Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                height: 1,
                parent: [1u8; 32],
                timestamp: 1_700_000_000,
                tx_root,
                producer_id: vec![0xaa],
                signature: vec![0xbb],
            },
            transactions,
        }
    }

    #[test]
    fn insert_get_remove() {
        let mut pool = Mempool::new(0);
        let tx1 = tx(1);
        let txid = tx1.txid();
        pool.insert(tx1.clone()).expect("insert");
        assert!(matches!(
            pool.insert(tx1),
            Err(MempoolError::AlreadyInMempool)
        ));
        assert!(pool.contains(&txid));
        assert!(pool.total_bytes() > 0);
        pool.remove(&txid).expect("remove");
        assert!(pool.is_empty());
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn byte_cap_rejects_when_full() {
        let mut pool = Mempool::new(1);
        assert!(matches!(pool.insert(tx(1)), Err(MempoolError::MempoolFull)));
    }

    #[test]
    fn decode_with_everything_pooled() {
        let mut pool = Mempool::new(0);
        let transactions = vec![tx(1), tx(2), tx(3)];
        for tx in &transactions {
            pool.insert(tx.clone()).expect("insert");
        }
        let block = block_of(transactions);
        let compact = XThinnerBlock::from_block(&block);

        let (decoded, missing) = pool.decode_xthinner(&compact);
        assert!(missing.is_empty());
        assert_eq!(decoded, block);
        assert_eq!(decoded.computed_tx_root(), block.header.tx_root);
    }

    #[test]
    fn decode_reports_missing_slots_in_order() {
        let mut pool = Mempool::new(0);
        let transactions = vec![tx(1), tx(2), tx(3), tx(4)];
        pool.insert(transactions[1].clone()).expect("insert");
        let block = block_of(transactions.clone());
        let compact = XThinnerBlock::from_block(&block);

        let (decoded, missing) = pool.decode_xthinner(&compact);
        assert_eq!(missing, vec![0, 2, 3]);
        assert_eq!(decoded.transactions[1], transactions[1]);
        assert_eq!(decoded.transactions[0], Transaction::placeholder());
        // Placeholder slots break the tx root until repaired.
        assert_ne!(decoded.computed_tx_root(), block.header.tx_root);
    }

    #[test]
    fn decode_is_deterministic_for_empty_pool() {
        let pool = Mempool::new(0);
        let block = block_of(vec![tx(1), tx(2)]);
        let compact = XThinnerBlock::from_block(&block);
        let (first, missing_first) = pool.decode_xthinner(&compact);
        let (second, missing_second) = pool.decode_xthinner(&compact);
        assert_eq!(first, second);
        assert_eq!(missing_first, missing_second);
        assert_eq!(missing_first, vec![0, 1]);
    }

    #[test]
    fn remove_block_txs_clears_connected_transactions() {
        let mut pool = Mempool::new(0);
        let transactions = vec![tx(1), tx(2)];
        for tx in &transactions {
            pool.insert(tx.clone()).expect("insert");
        }
        let block = block_of(transactions);
        pool.remove_block_txs(&block);
        assert!(pool.is_empty());
    }
}
