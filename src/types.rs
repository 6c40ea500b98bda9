//! Core data types for the Cinder blockchain

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];
pub type BlockHash = Hash256;
pub type TxHash = Hash256;

/// Transport-assigned connection identifier, unique per process lifetime.
pub type PeerId = u64;

/// Short hex form of a hash for log lines
pub fn short_hash(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx: TxHash,
    pub vout: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub recipient: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub timestamp: i64,
}

impl Transaction {
    pub fn txid(&self) -> TxHash {
        let blob = bincode::serialize(self).expect("transaction serialization cannot fail");
        Sha256::digest(&blob).into()
    }

    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).expect("transaction serialization cannot fail")
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(blob)
    }
}

/// Hash of a raw transaction blob as transmitted on the wire
pub fn blob_txid(blob: &[u8]) -> TxHash {
    Sha256::digest(blob).into()
}

/// Verdict returned by the core for one submitted transaction blob
#[derive(Clone, Copy, Debug, Default)]
pub struct TxVerdict {
    pub verification_failed: bool,
    pub should_be_relayed: bool,
    pub added_to_pool: bool,
}

/// Verdict returned by the core for one submitted block blob
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockVerdict {
    pub verification_failed: bool,
    pub added_to_main_chain: bool,
    pub marked_as_orphaned: bool,
    pub already_have: bool,
    /// Chain length after this block when added to the main chain
    pub height: u64,
}

/// Snapshot of core health for the stats surface
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreStats {
    pub blockchain_height: u64,
    pub tx_pool_size: usize,
    pub orphans_seen: u64,
}
