//! Block ingest coordination: decode compact announcements, repair them
//! from peers, validate against the chain, hand candidates to consensus,
//! and connect whatever finalizes. Owns the orphan, active-inventory,
//! and inflight-request maps.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use umbrad_chainstate::{BlockError, ChainState, RuleError};
use umbrad_consensus::{hash256_to_hex, Hash256, Policy};
use umbrad_primitives::block::{Block, XThinnerBlock};
use umbrad_storage::KeyValueStore;

use crate::chain_service::ChainServiceClient;
use crate::engine::{BlockRequest, Consensus, Status};
use crate::mempool::Mempool;
use crate::p2p::PeerRegistry;
use crate::peer_book::PeerBook;

/// Behavioral penalty when a block is invalid beyond repair.
const BANSCORE_INVALID_BLOCK: u32 = 101;
/// Behavioral penalty when the originator cannot back up its own
/// announcement, or a repaired block still fails the rules.
const BANSCORE_FAILED_REPAIR: u32 = 34;
/// Transient penalty for a block that lost a height race.
const BANSCORE_HEIGHT_RACE: u32 = 10;

const ORPHAN_SWEEP_INTERVAL_SECS: u64 = 30;

struct OrphanBlock {
    block: Block,
    relaying_peer: SocketAddr,
    first_seen: Instant,
}

pub struct BlockIngest<S, C> {
    chain: Arc<ChainState<S>>,
    mempool: Arc<Mutex<Mempool>>,
    engine: Arc<C>,
    client: Arc<ChainServiceClient>,
    peer_book: Arc<PeerBook>,
    registry: Arc<PeerRegistry>,
    policy: Policy,
    // Lock order when more than one is ever needed: orphans, then
    // inventory, then inflight. No await happens under any of them.
    orphan_blocks: RwLock<HashMap<Hash256, OrphanBlock>>,
    active_inventory: RwLock<HashMap<Hash256, Block>>,
    inflight_requests: RwLock<HashSet<Hash256>>,
    shutdown: watch::Receiver<bool>,
}

impl<S, C> BlockIngest<S, C>
where
    S: KeyValueStore + Send + Sync + 'static,
    C: Consensus,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainState<S>>,
        mempool: Arc<Mutex<Mempool>>,
        engine: Arc<C>,
        client: Arc<ChainServiceClient>,
        peer_book: Arc<PeerBook>,
        registry: Arc<PeerRegistry>,
        policy: Policy,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            mempool,
            engine,
            client,
            peer_book,
            registry,
            policy,
            orphan_blocks: RwLock::new(HashMap::new()),
            active_inventory: RwLock::new(HashMap::new()),
            inflight_requests: RwLock::new(HashSet::new()),
            shutdown,
        })
    }

    /// Entry point for a compact block announcement relayed by a peer.
    pub async fn handle_incoming_block(
        self: Arc<Self>,
        compact: &XThinnerBlock,
        relaying_peer: SocketAddr,
    ) -> Result<(), BlockError> {
        let block = self.decode_xthinner(compact, relaying_peer).await;
        self.process_block(block, relaying_peer, false).await
    }

    /// Decode against the mempool and repair missing slots: first from
    /// the announcer, then from anyone else connected. Helper peers that
    /// cannot answer are not penalized; they never claimed to have the
    /// block.
    async fn decode_xthinner(
        &self,
        compact: &XThinnerBlock,
        relaying_peer: SocketAddr,
    ) -> Block {
        let (mut block, missing) = {
            let mempool = self.mempool.lock().expect("mempool lock");
            mempool.decode_xthinner(compact)
        };
        if missing.is_empty() {
            return block;
        }

        let block_id = compact.block_id();
        match self
            .client
            .get_block_txs(relaying_peer, block_id, &missing)
            .await
        {
            Ok(txs) => {
                for (i, tx) in txs.into_iter().enumerate() {
                    block.transactions[missing[i] as usize] = tx;
                }
                return block;
            }
            Err(err) => {
                log_debug!(
                    "Block {} originator {} failed to supply missing txs: {}",
                    hash256_to_hex(&block_id),
                    relaying_peer,
                    err
                );
                self.peer_book
                    .increase_banscore(relaying_peer, BANSCORE_FAILED_REPAIR, 0);
            }
        }

        for peer in self.registry.snapshot() {
            if peer == relaying_peer {
                continue;
            }
            if let Ok(txs) = self.client.get_block_txs(peer, block_id, &missing).await {
                for (i, tx) in txs.into_iter().enumerate() {
                    block.transactions[missing[i] as usize] = tx;
                }
                return block;
            }
        }
        // Unfilled slots keep their placeholders; the tx-root check will
        // route the block into the txid repair path.
        block
    }

    /// The ingest state machine. `recheck` is set when re-entering after
    /// a txid repair, at which point a second rule failure is on the
    /// originator.
    pub fn process_block(
        self: Arc<Self>,
        block: Block,
        relaying_peer: SocketAddr,
        recheck: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BlockError>> + Send>> {
        Box::pin(async move { self.process_block_inner(block, relaying_peer, recheck).await })
    }

    async fn process_block_inner(
        self: Arc<Self>,
        block: Block,
        relaying_peer: SocketAddr,
        recheck: bool,
    ) -> Result<(), BlockError> {
        let block_id = block.block_id();
        match self.chain.check_connect_block(&block) {
            Ok(()) => {}
            Err(BlockError::Orphan(orphan)) => {
                // Possibly valid, judged too early. Keep it and circle
                // back when its parent connects.
                {
                    let mut orphans = self.orphan_blocks.write().expect("orphan lock");
                    orphans.insert(
                        block_id,
                        OrphanBlock {
                            block,
                            relaying_peer,
                            first_seen: Instant::now(),
                        },
                    );
                }
                self.engine.block_referenced(orphan.parent, relaying_peer);
                return Err(orphan.into());
            }
            Err(BlockError::Rule(rule)) => {
                if recheck {
                    // The peer already got one repair round; a block
                    // that still fails is its announcer's fault.
                    self.peer_book
                        .increase_banscore(relaying_peer, BANSCORE_FAILED_REPAIR, 0);
                    return Err(rule.into());
                }
                match rule {
                    RuleError::InvalidTxRoot => {
                        // Either our mempool collided during decode or
                        // the block is garbage. The txid list settles it.
                        match self.fetch_block_txids(&block, relaying_peer).await {
                            Ok(patched) => {
                                return Arc::clone(&self)
                                    .process_block(patched, relaying_peer, true)
                                    .await
                            }
                            Err(err) => {
                                log_debug!(
                                    "Block {} txid repair via originator {} failed: {}",
                                    hash256_to_hex(&block_id),
                                    relaying_peer,
                                    err
                                );
                                self.peer_book.increase_banscore(
                                    relaying_peer,
                                    BANSCORE_FAILED_REPAIR,
                                    0,
                                );
                            }
                        }
                        for peer in self.registry.snapshot() {
                            if peer == relaying_peer {
                                continue;
                            }
                            if let Ok(patched) = self.fetch_block_txids(&block, peer).await {
                                return Arc::clone(&self)
                                    .process_block(patched, relaying_peer, true)
                                    .await;
                            }
                            // Helpers that cannot answer stay unscored.
                        }
                        return Err(rule.into());
                    }
                    RuleError::DoesNotConnect => {
                        // Likely a race against a block we just
                        // finalized at the same height.
                        self.peer_book
                            .increase_banscore(relaying_peer, 0, BANSCORE_HEIGHT_RACE);
                        return Err(rule.into());
                    }
                    _ => {
                        self.peer_book
                            .increase_banscore(relaying_peer, BANSCORE_INVALID_BLOCK, 0);
                        return Err(rule.into());
                    }
                }
            }
            Err(err) => return Err(err),
        }

        // Compare-and-set into the active inventory: a concurrent second
        // arrival of the same id must not reach the engine twice.
        {
            let mut inventory = self.active_inventory.write().expect("inventory lock");
            match inventory.entry(block_id) {
                Entry::Occupied(_) => return Ok(()),
                Entry::Vacant(slot) => {
                    slot.insert(block.clone());
                }
            }
        }
        {
            let mut orphans = self.orphan_blocks.write().expect("orphan lock");
            orphans.remove(&block_id);
        }

        let (callback_tx, callback_rx) = oneshot::channel();
        let start = Instant::now();
        self.engine.new_block(block_id, true, callback_tx);

        let ingest = Arc::clone(&self);
        tokio::spawn(async move {
            ingest.await_consensus(block, callback_rx, start).await;
        });
        Ok(())
    }

    async fn await_consensus(
        self: Arc<Self>,
        block: Block,
        callback: oneshot::Receiver<Status>,
        start: Instant,
    ) {
        let block_id = block.block_id();
        let mut shutdown = self.shutdown.clone();
        let status = tokio::select! {
            status = callback => match status {
                Ok(status) => status,
                // Engine dropped the callback; shutdown cleanup owns
                // the inventory entry.
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        match status {
            Status::Finalized => {
                log_debug!(
                    "Block {} finalized in {} ms",
                    hash256_to_hex(&block_id),
                    start.elapsed().as_millis()
                );
                match self.chain.connect_block(&block) {
                    Ok(()) => {
                        log_info!(
                            "New block: {} (height: {}, transactions: {})",
                            hash256_to_hex(&block_id),
                            block.header.height,
                            block.transactions.len()
                        );
                        let mut mempool = self.mempool.lock().expect("mempool lock");
                        mempool.remove_block_txs(&block);
                    }
                    Err(err) => {
                        log_warn!(
                            "Connect block error: block {}: {}",
                            hash256_to_hex(&block_id),
                            err
                        );
                    }
                }
            }
            Status::Rejected => {
                log_debug!("Block {} rejected by consensus", hash256_to_hex(&block_id));
            }
        }

        {
            let mut inventory = self.active_inventory.write().expect("inventory lock");
            inventory.remove(&block_id);
        }

        if status == Status::Finalized {
            // At most one stored orphan gets its chance per finalize.
            let next = {
                let orphans = self.orphan_blocks.read().expect("orphan lock");
                orphans
                    .values()
                    .find(|orphan| orphan.block.header.height == block.header.height + 1)
                    .map(|orphan| (orphan.block.clone(), orphan.relaying_peer))
            };
            if let Some((orphan, peer)) = next {
                let _ = Arc::clone(&self).process_block(orphan, peer, false).await;
            }
        }
    }

    /// Reconcile our reconstruction against the peer's txid list and
    /// re-fetch exactly the slots that differ, preserving order.
    async fn fetch_block_txids(
        &self,
        block: &Block,
        peer: SocketAddr,
    ) -> Result<Block, String> {
        let block_id = block.block_id();
        let txids = self.client.get_block_txids(peer, block_id).await?;
        if txids.len() != block.transactions.len() {
            return Err("getblocktxids: peer returned unexpected number of ids".to_string());
        }
        let mut missing = Vec::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            if tx.txid() != txids[i] {
                missing.push(i as u32);
            }
        }
        if missing.is_empty() {
            // Our transactions already match the announced list, so the
            // tx root failure is inherent to the block.
            return Err("block invalid".to_string());
        }
        let txs = self.client.get_block_txs(peer, block_id, &missing).await?;
        let mut patched = block.clone();
        for (i, tx) in txs.into_iter().enumerate() {
            patched.transactions[missing[i] as usize] = tx;
        }
        Ok(patched)
    }

    /// Lookup used by the chain service. Serves from the active
    /// inventory first so peers can repair their own decodes of blocks
    /// we announced before consensus settles them.
    pub fn fetch_block(&self, block_id: &Hash256) -> Option<Block> {
        {
            let inventory = self.active_inventory.read().expect("inventory lock");
            if let Some(block) = inventory.get(block_id) {
                return Some(block.clone());
            }
        }
        self.chain.get_block_by_id(block_id).ok().flatten()
    }

    /// Consensus hook: fetch a block some peer has a preference for. The
    /// inflight set dedups concurrent requests; entries expire on a hard
    /// timer so a lost block can be asked for again.
    pub async fn request_block(self: Arc<Self>, block_id: Hash256, peer: SocketAddr) {
        {
            let inflight = self.inflight_requests.read().expect("inflight lock");
            if inflight.contains(&block_id) {
                return;
            }
        }
        {
            let mut inflight = self.inflight_requests.write().expect("inflight lock");
            if !inflight.insert(block_id) {
                return;
            }
        }

        let block = match self.client.get_block(peer, block_id).await {
            Ok(block) => block,
            Err(err) => {
                log_debug!(
                    "Block request {} to {} failed: {}",
                    hash256_to_hex(&block_id),
                    peer,
                    err
                );
                let mut inflight = self.inflight_requests.write().expect("inflight lock");
                inflight.remove(&block_id);
                return;
            }
        };

        let _ = Arc::clone(&self).process_block(block, peer, false).await;

        let ingest = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ingest.policy.inflight_ttl_secs)).await;
            let mut inflight = ingest.inflight_requests.write().expect("inflight lock");
            inflight.remove(&block_id);
        });
    }

    /// Drain the engine's request channel into `request_block`.
    pub async fn run_request_loop(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<BlockRequest>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                request = requests.recv() => {
                    let Some((block_id, peer)) = request else {
                        return;
                    };
                    let ingest = Arc::clone(&self);
                    tokio::spawn(async move {
                        ingest.request_block(block_id, peer).await;
                    });
                }
            }
        }
    }

    /// Periodically drop orphans nobody ever extended.
    pub async fn run_orphan_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(ORPHAN_SWEEP_INTERVAL_SECS)) => {}
            }
            let evicted = self.evict_stale_orphans();
            if evicted > 0 {
                log_debug!("Evicted {} stale orphan block(s)", evicted);
            }
        }
    }

    fn evict_stale_orphans(&self) -> usize {
        let ttl = Duration::from_secs(self.policy.orphan_ttl_secs);
        let mut orphans = self.orphan_blocks.write().expect("orphan lock");
        let before = orphans.len();
        orphans.retain(|_, orphan| orphan.first_seen.elapsed() < ttl);
        before - orphans.len()
    }
}
