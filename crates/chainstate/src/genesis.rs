//! Deterministic genesis block construction.
//!
//! The genesis block both creates the initial coins and stakes them, so
//! that the chain has a validator from block zero. Its stake transaction
//! anchors against the accumulator root of the coinbase outputs in the
//! same block, which `ChainState::init_genesis` accepts as a one-time
//! exception to the txo-root rule.

use umbrad_consensus::ChainParams;
use umbrad_primitives::block::{merkle_root, Block, BlockHeader, CURRENT_VERSION};
use umbrad_primitives::transaction::{
    CoinbaseTransaction, Output, StakeTransaction, Transaction,
};

use crate::state::accumulator_root_after;

const GENESIS_VALIDATOR_ID: [u8; 38] = [
    0x00, 0x24, 0x08, 0x01, 0x12, 0x20, 0xb5, 0x62, 0xe4, 0x8c, 0xa1, 0x18, 0xdb, 0x0f, 0x24,
    0xa5, 0x3c, 0xfb, 0xae, 0x9f, 0x6a, 0x3a, 0x67, 0xf8, 0x63, 0xe6, 0x03, 0x15, 0x95, 0xd6,
    0x43, 0xb7, 0xd8, 0x91, 0x62, 0x1a, 0xc2, 0x80,
];

const GENESIS_NULLIFIER: [u8; 32] = [
    0x93, 0x1b, 0xf9, 0xe8, 0x29, 0x31, 0x54, 0x91, 0x46, 0x3f, 0xee, 0xd6, 0x21, 0xc3, 0xb9,
    0x64, 0x66, 0x3a, 0x12, 0xe0, 0x5a, 0xc9, 0x64, 0xc9, 0x38, 0xb2, 0xe7, 0x0b, 0xf7, 0x5f,
    0x14, 0xd0,
];

pub fn genesis_block(params: &ChainParams) -> Block {
    let coinbase = CoinbaseTransaction {
        validator_id: GENESIS_VALIDATOR_ID.to_vec(),
        new_coins: params.genesis_coins,
        outputs: vec![
            Output {
                commitment: [0x8a; 32],
                ciphertext: vec![0xce; 96],
            },
            Output {
                commitment: [0x48; 32],
                ciphertext: vec![0xa6; 96],
            },
        ],
        signature: vec![0x63; 64],
        proof: Vec::new(),
    };
    let coinbase_root = accumulator_root_after([0u8; 32], &coinbase.outputs);

    let stake = StakeTransaction {
        validator_id: GENESIS_VALIDATOR_ID.to_vec(),
        amount: params.genesis_coins / 2,
        nullifier: GENESIS_NULLIFIER,
        txo_root: coinbase_root,
        locktime: 0,
        signature: vec![0x83; 64],
        proof: Vec::new(),
    };

    let transactions = vec![Transaction::Coinbase(coinbase), Transaction::Stake(stake)];
    let tx_root = merkle_root(
        &transactions
            .iter()
            .map(|tx| tx.txid())
            .collect::<Vec<_>>(),
    );

    Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            height: 0,
            parent: [0u8; 32],
            timestamp: params.genesis_time,
            tx_root,
            producer_id: GENESIS_VALIDATOR_ID.to_vec(),
            signature: vec![0x01; 64],
        },
        transactions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_consensus::params::{chain_params, Network};

    #[test]
    fn genesis_is_deterministic_and_distinct_per_network() {
        let regtest = genesis_block(&chain_params(Network::Regtest));
        let again = genesis_block(&chain_params(Network::Regtest));
        assert_eq!(regtest.block_id(), again.block_id());
        assert_eq!(regtest.computed_tx_root(), regtest.header.tx_root);

        let mainnet = genesis_block(&chain_params(Network::Mainnet));
        assert_ne!(mainnet.block_id(), regtest.block_id());
    }

    #[test]
    fn genesis_stake_anchors_to_coinbase_outputs() {
        let block = genesis_block(&chain_params(Network::Regtest));
        let Transaction::Coinbase(coinbase) = &block.transactions[0] else {
            panic!("genesis must begin with a coinbase");
        };
        let Transaction::Stake(stake) = &block.transactions[1] else {
            panic!("genesis must stake its coinbase");
        };
        assert_eq!(
            stake.txo_root,
            accumulator_root_after([0u8; 32], &coinbase.outputs)
        );
    }
}
