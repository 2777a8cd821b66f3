use std::sync::Arc;

use umbrad_chainstate::genesis::genesis_block;
use umbrad_chainstate::state::{accumulator_root_after, ChainState};
use umbrad_chainstate::{BlockError, ChainStateError, RuleError};
use umbrad_consensus::params::{chain_params, Network};
use umbrad_consensus::Hash256;
use umbrad_primitives::block::{merkle_root, Block, BlockHeader, CURRENT_VERSION};
use umbrad_primitives::transaction::{
    CoinbaseTransaction, Output, StandardTransaction, Transaction,
};
use umbrad_storage::memory::MemoryStore;

fn new_chain() -> ChainState<MemoryStore> {
    let params = chain_params(Network::Regtest);
    let chain = ChainState::new(Arc::new(MemoryStore::new()), params.clone()).expect("chain state");
    chain
        .init_genesis(&genesis_block(&params))
        .expect("init genesis");
    chain
}

fn coinbase(height: u32) -> Transaction {
    Transaction::Coinbase(CoinbaseTransaction {
        validator_id: vec![0xaa; 36],
        new_coins: 50,
        outputs: vec![Output {
            commitment: {
                let mut commitment = [0u8; 32];
                commitment[0..4].copy_from_slice(&height.to_be_bytes());
                commitment
            },
            ciphertext: vec![0x11; 48],
        }],
        signature: vec![0xbb; 64],
        proof: Vec::new(),
    })
}

fn spend(nullifier_tag: u8, txo_root: Hash256) -> Transaction {
    Transaction::Standard(StandardTransaction {
        outputs: vec![Output {
            commitment: [nullifier_tag ^ 0xff; 32],
            ciphertext: vec![0x22; 48],
        }],
        nullifiers: vec![[nullifier_tag; 32]],
        txo_root,
        locktime: 0,
        fee: 10,
        proof: vec![0x33; 8],
    })
}

fn build_block(chain: &ChainState<MemoryStore>, mut extra: Vec<Transaction>) -> Block {
    let tip = chain.best_block().expect("tip");
    let height = tip.height + 1;
    let mut transactions = vec![coinbase(height)];
    transactions.append(&mut extra);
    let tx_root = merkle_root(
        &transactions
            .iter()
            .map(|tx| tx.txid())
            .collect::<Vec<_>>(),
    );
    Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            height,
            parent: tip.hash,
            timestamp: tip.timestamp + 1,
            tx_root,
            producer_id: vec![0xaa; 36],
            signature: vec![0xcc; 64],
        },
        transactions,
    }
}

#[test]
fn genesis_connects_and_is_idempotent() {
    let params = chain_params(Network::Regtest);
    let chain = ChainState::new(Arc::new(MemoryStore::new()), params.clone()).expect("chain state");
    let genesis = genesis_block(&params);

    chain.init_genesis(&genesis).expect("first init");
    chain.init_genesis(&genesis).expect("second init is a no-op");

    let tip = chain.best_block().expect("tip");
    assert_eq!(tip.height, 0);
    assert_eq!(tip.hash, genesis.block_id());
    assert!(chain.contains_block(&genesis.block_id()).expect("contains"));
    // The genesis stake anchor becomes a known root.
    let Transaction::Stake(stake) = &genesis.transactions[1] else {
        panic!("genesis stake expected");
    };
    assert!(chain.contains_txo_root(&stake.txo_root).expect("root"));
}

#[test]
fn genesis_rejects_bad_stake_anchor() {
    let params = chain_params(Network::Regtest);
    let chain = ChainState::new(Arc::new(MemoryStore::new()), params.clone()).expect("chain state");
    let mut genesis = genesis_block(&params);
    if let Transaction::Stake(stake) = &mut genesis.transactions[1] {
        stake.txo_root = [0xde; 32];
    }
    genesis.header.tx_root = merkle_root(
        &genesis
            .transactions
            .iter()
            .map(|tx| tx.txid())
            .collect::<Vec<_>>(),
    );
    assert!(matches!(
        chain.init_genesis(&genesis),
        Err(ChainStateError::Genesis(_))
    ));
}

#[test]
fn connects_sequential_blocks() {
    let chain = new_chain();
    let block1 = build_block(&chain, Vec::new());
    chain.check_connect_block(&block1).expect("check block 1");
    chain.connect_block(&block1).expect("connect block 1");

    let root = chain.accumulator_root().expect("root");
    let block2 = build_block(&chain, vec![spend(0x01, root)]);
    chain.check_connect_block(&block2).expect("check block 2");
    chain.connect_block(&block2).expect("connect block 2");

    let tip = chain.best_block().expect("tip");
    assert_eq!(tip.height, 2);
    assert_eq!(tip.hash, block2.block_id());
    assert_eq!(
        chain.block_id_at_height(1).expect("height 1"),
        Some(block1.block_id())
    );
    assert_eq!(
        chain
            .get_block_by_id(&block2.block_id())
            .expect("get block"),
        Some(block2.clone())
    );
    assert!(chain.contains_nullifier(&[0x01; 32]).expect("nullifier"));

    // Connecting the tip again is a no-op.
    chain.connect_block(&block2).expect("idempotent connect");
    assert_eq!(chain.best_block().expect("tip").height, 2);
}

#[test]
fn classifies_orphans_and_stale_blocks() {
    let chain = new_chain();
    let block1 = build_block(&chain, Vec::new());

    // Height beyond tip+1 is an orphan.
    let mut ahead = block1.clone();
    ahead.header.height = 5;
    assert!(matches!(
        chain.check_connect_block(&ahead),
        Err(BlockError::Orphan(_))
    ));

    // Unknown parent at the next height is an orphan too.
    let mut unknown_parent = block1.clone();
    unknown_parent.header.parent = [0x77; 32];
    assert!(matches!(
        chain.check_connect_block(&unknown_parent),
        Err(BlockError::Orphan(_))
    ));

    chain.connect_block(&block1).expect("connect");

    // A second block claiming the connected height is a stale race.
    let mut stale = block1.clone();
    stale.header.timestamp += 1;
    assert!(matches!(
        chain.check_connect_block(&stale),
        Err(BlockError::Rule(RuleError::DoesNotConnect))
    ));
}

#[test]
fn rejects_rule_violations() {
    let chain = new_chain();

    // Tampered tx root.
    let mut bad_root = build_block(&chain, Vec::new());
    bad_root.header.tx_root = [0x99; 32];
    assert!(matches!(
        chain.check_connect_block(&bad_root),
        Err(BlockError::Rule(RuleError::InvalidTxRoot))
    ));

    // Missing producer signature.
    let mut unsigned = build_block(&chain, Vec::new());
    unsigned.header.signature = Vec::new();
    assert!(matches!(
        chain.check_connect_block(&unsigned),
        Err(BlockError::Rule(RuleError::InvalidHeader(_)))
    ));

    // Spend anchored to a root we have never seen.
    let bad_anchor = build_block(&chain, vec![spend(0x05, [0x44; 32])]);
    assert!(matches!(
        chain.check_connect_block(&bad_anchor),
        Err(BlockError::Rule(RuleError::UnknownTxoRoot))
    ));

    // Double spend across blocks.
    let root = chain.accumulator_root().expect("root");
    let block1 = build_block(&chain, vec![spend(0x07, root)]);
    chain.connect_block(&block1).expect("connect");
    let root = chain.accumulator_root().expect("root");
    let double_spend = build_block(&chain, vec![spend(0x07, root)]);
    assert!(matches!(
        chain.check_connect_block(&double_spend),
        Err(BlockError::Rule(RuleError::DuplicateNullifier))
    ));
}

#[test]
fn connect_refuses_non_extending_block() {
    let chain = new_chain();
    let block1 = build_block(&chain, Vec::new());
    chain.connect_block(&block1).expect("connect");

    let mut fork = build_block(&chain, Vec::new());
    fork.header.parent = [0x55; 32];
    assert!(matches!(
        chain.connect_block(&fork),
        Err(ChainStateError::DoesNotExtendTip)
    ));
}

#[test]
fn accumulator_root_tracks_outputs() {
    let chain = new_chain();
    let before = chain.accumulator_root().expect("root");
    let block1 = build_block(&chain, Vec::new());
    chain.connect_block(&block1).expect("connect");
    let after = chain.accumulator_root().expect("root");
    assert_ne!(before, after);
    assert_eq!(
        after,
        accumulator_root_after(before, block1.transactions[0].outputs())
    );
    assert!(chain.contains_txo_root(&after).expect("root known"));
}
