//! Sync-data handshake payload and its wire codec.
//!
//! The payload is the first thing exchanged on every connection: it tells the
//! remote side where our chain currently ends so each peer can decide whether
//! to synchronize from the other.

use crate::types::BlockHash;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncData {
    pub client_version: String,
    /// Chain length (top index + 1)
    pub current_height: u64,
    pub top_id: BlockHash,
    pub last_checkpoint_height: u64,
}

impl SyncData {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("Failed to serialize sync data: {}", e))
    }

    pub fn decode(blob: &[u8]) -> Result<Self, String> {
        bincode::deserialize(blob).map_err(|e| format!("Failed to deserialize sync data: {}", e))
    }
}
