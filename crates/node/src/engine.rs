//! Bridge to the consensus engine.
//!
//! The coordinator sees consensus through the narrow `Consensus` trait:
//! hand over a block id with an initial preference and a one-shot status
//! callback, and surface ids referenced by peers that we have not seen.
//! The engine reaches back through a constructor-injected request
//! channel rather than holding a reference to the coordinator, which
//! keeps the coordinator/consensus dependency one-directional.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use umbrad_consensus::Hash256;

/// Terminal verdict for a block under consideration. Exactly one status
/// is delivered per `new_block` call, unless the node shuts down first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Finalized,
    Rejected,
}

/// A block a peer referenced that we need to go fetch: (block id, the
/// peer that knows it).
pub type BlockRequest = (Hash256, SocketAddr);

pub trait Consensus: Send + Sync + 'static {
    /// Submit a validated block for a decision. Non-blocking; the engine
    /// eventually sends exactly one `Status` on `callback`, or never if
    /// the node is shutting down.
    fn new_block(&self, block_id: Hash256, initial_preference: bool, callback: oneshot::Sender<Status>);

    /// A peer referenced `block_id` (e.g. as the parent of something it
    /// relayed). If the engine has not seen it, it asks for a fetch.
    fn block_referenced(&self, block_id: Hash256, peer: SocketAddr);
}

/// Single-validator finality. With no quorum to sample, a candidate we
/// prefer is final the moment it is submitted, and a candidate we do not
/// prefer is rejected. The sampling engine that replaces this when a
/// validator set is online is an external collaborator speaking the same
/// `Consensus` contract.
pub struct ConsensusEngine {
    known: Mutex<HashSet<Hash256>>,
    requested: Mutex<HashSet<Hash256>>,
    request_block: mpsc::UnboundedSender<BlockRequest>,
}

impl ConsensusEngine {
    pub fn new(request_block: mpsc::UnboundedSender<BlockRequest>) -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
            requested: Mutex::new(HashSet::new()),
            request_block,
        }
    }
}

impl Consensus for ConsensusEngine {
    fn new_block(
        &self,
        block_id: Hash256,
        initial_preference: bool,
        callback: oneshot::Sender<Status>,
    ) {
        self.known.lock().expect("known set lock").insert(block_id);
        self.requested
            .lock()
            .expect("requested set lock")
            .remove(&block_id);
        let status = if initial_preference {
            Status::Finalized
        } else {
            Status::Rejected
        };
        // The waiter may already be gone on shutdown.
        let _ = callback.send(status);
    }

    fn block_referenced(&self, block_id: Hash256, peer: SocketAddr) {
        if self.known.lock().expect("known set lock").contains(&block_id) {
            return;
        }
        if !self
            .requested
            .lock()
            .expect("requested set lock")
            .insert(block_id)
        {
            return;
        }
        let _ = self.request_block.send((block_id, peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:9901".parse().expect("addr")
    }

    #[tokio::test]
    async fn preferred_blocks_finalize() {
        let (request_tx, _request_rx) = mpsc::unbounded_channel();
        let engine = ConsensusEngine::new(request_tx);
        let (tx, rx) = oneshot::channel();
        engine.new_block([1u8; 32], true, tx);
        assert_eq!(rx.await.expect("status"), Status::Finalized);

        let (tx, rx) = oneshot::channel();
        engine.new_block([2u8; 32], false, tx);
        assert_eq!(rx.await.expect("status"), Status::Rejected);
    }

    #[tokio::test]
    async fn unknown_references_request_a_fetch_once() {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let engine = ConsensusEngine::new(request_tx);

        engine.block_referenced([3u8; 32], peer());
        engine.block_referenced([3u8; 32], peer());
        assert_eq!(request_rx.recv().await, Some(([3u8; 32], peer())));
        assert!(request_rx.try_recv().is_err());

        // Once the block arrives, references stop triggering fetches.
        let (tx, _rx) = oneshot::channel();
        engine.new_block([4u8; 32], true, tx);
        engine.block_referenced([4u8; 32], peer());
        assert!(request_rx.try_recv().is_err());
    }
}
