use crate::network::handshake::SyncData;
use crate::types::{BlockHash, TxHash};
use serde::{Deserialize, Serialize};

/// One block body together with the blobs of every transaction it confirms,
/// in the block's own order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub block: Vec<u8>,
    pub txs: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ProtocolMessage {
    /// Sync-data exchange; first frame on every connection, re-sent on
    /// idle resync. Receivers reply with `is_response` set so the exchange
    /// terminates after one round trip.
    Handshake { data: SyncData, is_response: bool },
    /// Freshly mined block announcement with relay hop counter
    NotifyNewBlock {
        block_entry: BlockEntry,
        hop: u32,
    },
    NotifyNewTransactions {
        txs: Vec<Vec<u8>>,
    },
    /// Short chain history, densest near the tip, genesis last
    RequestChain {
        block_ids: Vec<BlockHash>,
    },
    /// Contiguous run of our chain ids starting at the newest id from the
    /// request we also have
    ResponseChainEntry {
        block_ids: Vec<BlockHash>,
        start_height: u64,
        total_height: u64,
    },
    RequestGetObjects {
        blocks: Vec<BlockHash>,
        txs: Vec<TxHash>,
    },
    ResponseGetObjects {
        blocks: Vec<BlockEntry>,
        txs: Vec<Vec<u8>>,
        missed_ids: Vec<BlockHash>,
        current_blockchain_height: u64,
    },
}

impl ProtocolMessage {
    /// Get the message type name as a string (for logging/debugging)
    pub fn message_type(&self) -> &'static str {
        match self {
            ProtocolMessage::Handshake { .. } => "Handshake",
            ProtocolMessage::NotifyNewBlock { .. } => "NotifyNewBlock",
            ProtocolMessage::NotifyNewTransactions { .. } => "NotifyNewTransactions",
            ProtocolMessage::RequestChain { .. } => "RequestChain",
            ProtocolMessage::ResponseChainEntry { .. } => "ResponseChainEntry",
            ProtocolMessage::RequestGetObjects { .. } => "RequestGetObjects",
            ProtocolMessage::ResponseGetObjects { .. } => "ResponseGetObjects",
        }
    }

    /// True for messages a peer sends only in reply to one of ours
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::ResponseChainEntry { .. } | ProtocolMessage::ResponseGetObjects { .. }
        )
    }
}
