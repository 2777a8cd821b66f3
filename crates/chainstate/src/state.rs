//! The connected chain: block storage, nullifier set, txo accumulator,
//! and the connect-time validation entry points used by the ingest
//! pipeline.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use umbrad_consensus::{ChainParams, Hash256};
use umbrad_primitives::block::Block;
use umbrad_primitives::encoding::DecodeError;
use umbrad_primitives::hash::sha256d;
use umbrad_primitives::transaction::Output;
use umbrad_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::validation::{OrphanBlockError, RuleError};

pub const DEFAULT_MAX_NULLIFIERS: usize = 100_000;
pub const DEFAULT_MAX_TXO_ROOTS: usize = 500;

const META_TIP: &[u8] = b"tip";
const META_ACCUMULATOR: &[u8] = b"accumulator";

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Decode(DecodeError),
    NotInitialized,
    DoesNotExtendTip,
    Genesis(&'static str),
    CorruptIndex(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::NotInitialized => write!(f, "chain state not initialized"),
            ChainStateError::DoesNotExtendTip => write!(f, "block does not extend best block tip"),
            ChainStateError::Genesis(message) => write!(f, "{message}"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

/// Outcome classification for `check_connect_block`. The ingest pipeline
/// dispatches its whole state machine on this.
#[derive(Debug)]
pub enum BlockError {
    Orphan(OrphanBlockError),
    Rule(RuleError),
    Chain(ChainStateError),
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockError::Orphan(err) => write!(f, "{err}"),
            BlockError::Rule(err) => write!(f, "{err}"),
            BlockError::Chain(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<OrphanBlockError> for BlockError {
    fn from(err: OrphanBlockError) -> Self {
        BlockError::Orphan(err)
    }
}

impl From<RuleError> for BlockError {
    fn from(err: RuleError) -> Self {
        BlockError::Rule(err)
    }
}

impl From<ChainStateError> for BlockError {
    fn from(err: ChainStateError) -> Self {
        BlockError::Chain(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub timestamp: i64,
}

fn encode_tip(tip: &ChainTip) -> Vec<u8> {
    let mut out = Vec::with_capacity(44);
    out.extend_from_slice(&tip.hash);
    out.extend_from_slice(&tip.height.to_be_bytes());
    out.extend_from_slice(&tip.timestamp.to_be_bytes());
    out
}

fn decode_tip(bytes: &[u8]) -> Result<ChainTip, ChainStateError> {
    if bytes.len() != 44 {
        return Err(ChainStateError::CorruptIndex("malformed tip record"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[0..32]);
    let height = u32::from_be_bytes(bytes[32..36].try_into().expect("tip height bytes"));
    let timestamp = i64::from_be_bytes(bytes[36..44].try_into().expect("tip timestamp bytes"));
    Ok(ChainTip {
        hash,
        height,
        timestamp,
    })
}

/// Fold one output commitment into the txo accumulator.
fn accumulator_add(root: &Hash256, commitment: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(root);
    buf[32..64].copy_from_slice(commitment);
    sha256d(&buf)
}

/// Accumulator root after appending `outputs` to the state rooted at
/// `base`. The genesis stake transaction anchors against the root of the
/// genesis coinbase outputs computed this way.
pub fn accumulator_root_after(base: Hash256, outputs: &[Output]) -> Hash256 {
    let mut root = base;
    for output in outputs {
        root = accumulator_add(&root, &output.commitment);
    }
    root
}

/// Bounded recently-seen cache in front of a store column. Positives are
/// authoritative; misses fall through to the datastore.
struct FifoSet {
    set: HashSet<Hash256>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl FifoSet {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.set.contains(hash)
    }

    fn insert(&mut self, hash: Hash256) {
        if self.capacity == 0 || !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    tip: Mutex<Option<ChainTip>>,
    nullifiers: Mutex<FifoSet>,
    txo_roots: Mutex<FifoSet>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(store: Arc<S>, params: ChainParams) -> Result<Self, ChainStateError> {
        Self::new_with_cache_capacity(store, params, DEFAULT_MAX_NULLIFIERS, DEFAULT_MAX_TXO_ROOTS)
    }

    pub fn new_with_cache_capacity(
        store: Arc<S>,
        params: ChainParams,
        max_nullifiers: usize,
        max_txo_roots: usize,
    ) -> Result<Self, ChainStateError> {
        let tip = match store.get(Column::Meta, META_TIP)? {
            Some(bytes) => Some(decode_tip(&bytes)?),
            None => None,
        };
        Ok(Self {
            store,
            params,
            tip: Mutex::new(tip),
            nullifiers: Mutex::new(FifoSet::new(max_nullifiers)),
            txo_roots: Mutex::new(FifoSet::new(max_txo_roots)),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn best_block(&self) -> Option<ChainTip> {
        *self.tip.lock().expect("tip lock")
    }

    pub fn contains_block(&self, block_id: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.store.get(Column::BlockIndex, block_id)?.is_some())
    }

    pub fn get_block_by_id(&self, block_id: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::BlockIndex, block_id)? else {
            return Ok(None);
        };
        Ok(Some(Block::consensus_decode(&bytes)?))
    }

    pub fn block_id_at_height(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::HeightIndex, &height.to_be_bytes())? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainStateError::CorruptIndex("malformed height index record"))?;
        Ok(Some(hash))
    }

    pub fn contains_nullifier(&self, nullifier: &Hash256) -> Result<bool, ChainStateError> {
        if self
            .nullifiers
            .lock()
            .expect("nullifier cache lock")
            .contains(nullifier)
        {
            return Ok(true);
        }
        let found = self.store.get(Column::Nullifier, nullifier)?.is_some();
        if found {
            self.nullifiers
                .lock()
                .expect("nullifier cache lock")
                .insert(*nullifier);
        }
        Ok(found)
    }

    pub fn contains_txo_root(&self, root: &Hash256) -> Result<bool, ChainStateError> {
        if self
            .txo_roots
            .lock()
            .expect("txo root cache lock")
            .contains(root)
        {
            return Ok(true);
        }
        let found = self.store.get(Column::TxoRoot, root)?.is_some();
        if found {
            self.txo_roots
                .lock()
                .expect("txo root cache lock")
                .insert(*root);
        }
        Ok(found)
    }

    pub fn accumulator_root(&self) -> Result<Hash256, ChainStateError> {
        match self.store.get(Column::Meta, META_ACCUMULATOR)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("malformed accumulator record")),
            None => Ok([0u8; 32]),
        }
    }

    /// Full stateful validity check against the current tip. Read-only:
    /// the caller decides whether to connect, orphan, or discard.
    pub fn check_connect_block(&self, block: &Block) -> Result<(), BlockError> {
        let tip = self
            .best_block()
            .ok_or(ChainStateError::NotInitialized)
            .map_err(BlockError::Chain)?;
        let header = &block.header;

        // Connectivity classification comes first; everything after it
        // assumes the block claims the next slot.
        if header.height > tip.height + 1 {
            return Err(OrphanBlockError {
                height: header.height,
                parent: header.parent,
            }
            .into());
        }
        if header.height <= tip.height {
            return Err(RuleError::DoesNotConnect.into());
        }
        if header.parent != tip.hash {
            if self.contains_block(&header.parent)? {
                // Parent is an old connected block: a stale fork tip.
                return Err(RuleError::DoesNotConnect.into());
            }
            return Err(OrphanBlockError {
                height: header.height,
                parent: header.parent,
            }
            .into());
        }

        if header.version == 0 {
            return Err(RuleError::InvalidHeader("unsupported block version").into());
        }
        if header.producer_id.is_empty() {
            return Err(RuleError::InvalidHeader("missing producer id").into());
        }
        if header.signature.is_empty() {
            return Err(RuleError::InvalidHeader("missing producer signature").into());
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if header.timestamp > now + self.params.max_future_block_secs {
            return Err(RuleError::InvalidHeader("block timestamp too far in the future").into());
        }
        if header.timestamp < tip.timestamp {
            return Err(RuleError::InvalidHeader("block timestamp before parent").into());
        }

        if block.transactions.is_empty() {
            return Err(RuleError::InvalidTransaction("block has no transactions").into());
        }

        // The tx-root check runs before any per-transaction rule so that a
        // lossy mempool decode surfaces as InvalidTxRoot (repairable)
        // rather than as a bannable violation of a downstream rule.
        if block.computed_tx_root() != header.tx_root {
            return Err(RuleError::InvalidTxRoot.into());
        }

        if !block.transactions[0].is_coinbase() {
            return Err(RuleError::InvalidTransaction("first transaction must be coinbase").into());
        }
        if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(
                RuleError::InvalidTransaction("coinbase outside the first position").into(),
            );
        }

        let mut txids = HashSet::with_capacity(block.transactions.len());
        let mut block_nullifiers = HashSet::new();
        for tx in &block.transactions {
            if !txids.insert(tx.txid()) {
                return Err(RuleError::DuplicateTxid.into());
            }
            for nullifier in tx.nullifiers() {
                if !block_nullifiers.insert(nullifier) {
                    return Err(RuleError::DuplicateNullifier.into());
                }
                if self.contains_nullifier(&nullifier)? {
                    return Err(RuleError::DuplicateNullifier.into());
                }
            }
            if let Some(root) = tx.txo_root() {
                if !self.contains_txo_root(&root)? {
                    return Err(RuleError::UnknownTxoRoot.into());
                }
            }
        }

        Ok(())
    }

    /// Apply a block to the chain as a single atomic batch. Idempotent
    /// for block ids that are already connected.
    pub fn connect_block(&self, block: &Block) -> Result<(), ChainStateError> {
        let block_id = block.block_id();
        if self.contains_block(&block_id)? {
            return Ok(());
        }

        let tip = self.best_block();
        match tip {
            Some(tip) if block.header.parent != tip.hash => {
                return Err(ChainStateError::DoesNotExtendTip);
            }
            None if block.header.height != 0 => {
                return Err(ChainStateError::NotInitialized);
            }
            _ => {}
        }

        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, block_id, block.consensus_encode());
        batch.put(
            Column::HeightIndex,
            block.header.height.to_be_bytes(),
            block_id,
        );

        let mut spent = Vec::new();
        let mut root = self.accumulator_root()?;
        for tx in &block.transactions {
            for nullifier in tx.nullifiers() {
                batch.put(Column::Nullifier, nullifier, block_id);
                spent.push(nullifier);
            }
            root = accumulator_root_after(root, tx.outputs());
        }
        batch.put(
            Column::TxoRoot,
            root,
            block.header.height.to_be_bytes(),
        );
        batch.put(Column::Meta, META_ACCUMULATOR, root);

        let new_tip = ChainTip {
            hash: block_id,
            height: block.header.height,
            timestamp: block.header.timestamp,
        };
        batch.put(Column::Meta, META_TIP, encode_tip(&new_tip));

        self.store.write_batch(&batch)?;

        *self.tip.lock().expect("tip lock") = Some(new_tip);
        {
            let mut cache = self.nullifiers.lock().expect("nullifier cache lock");
            for nullifier in spent {
                cache.insert(nullifier);
            }
        }
        self.txo_roots
            .lock()
            .expect("txo root cache lock")
            .insert(root);

        Ok(())
    }

    /// Connect the genesis block into an empty datastore. The genesis
    /// stake transaction is exempt from the usual txo-root rule: it may
    /// anchor against the root derived from the coinbase outputs of its
    /// own block, since staking cannot predate the first block.
    pub fn init_genesis(&self, block: &Block) -> Result<(), ChainStateError> {
        if self.best_block().is_some() {
            if self.contains_block(&block.block_id())? {
                return Ok(());
            }
            return Err(ChainStateError::Genesis(
                "datastore already contains a different chain",
            ));
        }

        if block.header.height != 0 {
            return Err(ChainStateError::Genesis("genesis height must be zero"));
        }
        if block.header.parent != [0u8; 32] {
            return Err(ChainStateError::Genesis("genesis parent must be zero"));
        }
        if block.computed_tx_root() != block.header.tx_root {
            return Err(ChainStateError::Genesis("genesis tx root mismatch"));
        }
        let Some(first) = block.transactions.first() else {
            return Err(ChainStateError::Genesis("genesis has no transactions"));
        };
        if !first.is_coinbase() {
            return Err(ChainStateError::Genesis(
                "genesis must begin with a coinbase",
            ));
        }
        let coinbase_root = accumulator_root_after([0u8; 32], first.outputs());
        for tx in &block.transactions[1..] {
            if let Some(root) = tx.txo_root() {
                if root != coinbase_root {
                    return Err(ChainStateError::Genesis(
                        "genesis stake must anchor to its own coinbase outputs",
                    ));
                }
            }
        }

        self.connect_block(block)
    }
}
