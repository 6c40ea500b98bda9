//! Genesis block construction for Cinder networks.
//!
//! The genesis block is fixed per network: zero parent, no transactions,
//! a network-specific timestamp. Every node derives the same genesis id.

#![allow(dead_code)]

use crate::block::types::Block;
use crate::network_type::NetworkType;
use crate::types::BlockHash;

/// Mainnet launch timestamp (2024-03-01 00:00:00 UTC)
const MAINNET_GENESIS_TIMESTAMP: i64 = 1_709_251_200;

/// Testnet reset timestamp (2024-06-01 00:00:00 UTC)
const TESTNET_GENESIS_TIMESTAMP: i64 = 1_717_200_000;

pub fn genesis_block(network: NetworkType) -> Block {
    let timestamp = match network {
        NetworkType::Mainnet => MAINNET_GENESIS_TIMESTAMP,
        NetworkType::Testnet => TESTNET_GENESIS_TIMESTAMP,
    };
    Block::new([0u8; 32], timestamp, Vec::new())
}

pub fn genesis_id(network: NetworkType) -> BlockHash {
    genesis_block(network).hash()
}
