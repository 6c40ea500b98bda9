//! Block types for the Cinder blockchain.

#![allow(dead_code)]

use crate::types::{BlockHash, Hash256, TxHash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build a merkle tree from a list of hashes
fn build_merkle_root(mut hashes: Vec<Hash256>) -> Hash256 {
    if hashes.is_empty() {
        return [0u8; 32];
    }

    while hashes.len() > 1 {
        if hashes.len() % 2 == 1 {
            hashes.push(*hashes.last().unwrap());
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    hashes[0]
}

/// Calculate merkle root over transaction ids
pub fn calculate_merkle_root(tx_hashes: &[TxHash]) -> Hash256 {
    build_merkle_root(tx_hashes.to_vec())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_id: BlockHash,
    pub merkle_root: Hash256,
    pub timestamp: i64,
    pub nonce: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Ids of the transactions confirmed by this block, in block order
    pub tx_hashes: Vec<TxHash>,
}

impl Block {
    pub fn new(prev_id: BlockHash, timestamp: i64, tx_hashes: Vec<TxHash>) -> Self {
        Self {
            header: BlockHeader {
                version: 1,
                prev_id,
                merkle_root: calculate_merkle_root(&tx_hashes),
                timestamp,
                nonce: 0,
            },
            tx_hashes,
        }
    }

    /// Block id: hash of the serialized header
    pub fn hash(&self) -> BlockHash {
        let blob = bincode::serialize(&self.header).expect("header serialization cannot fail");
        Sha256::digest(&blob).into()
    }

    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block serialization cannot fail")
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(blob)
    }

    /// Shape validation applied before the block touches the store: the
    /// declared merkle root must match the carried tx ids.
    pub fn is_well_formed(&self) -> bool {
        self.header.merkle_root == calculate_merkle_root(&self.tx_hashes)
    }
}
