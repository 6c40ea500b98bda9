//! Global constants for the Cinder daemon
//!
//! Centralizes protocol and chain constants so limits are tuned in one place.

/// Chain-level constants
pub mod chain {
    /// Target spacing between blocks, used for "days behind" estimates
    pub const TARGET_BLOCK_SPACING_SECS: i64 = 120;

    /// Number of most recent block ids kept dense in a short chain history
    /// before the spacing turns exponential
    pub const SHORT_HISTORY_DENSE_TAIL: usize = 10;
}

/// Synchronization protocol constants
pub mod protocol {
    /// How many block bodies one objects request asks for
    pub const BLOCKS_SYNC_BATCH_COUNT: usize = 200;

    /// Upper bound on block ids accepted in one incoming objects request
    pub const MAX_BLOCKS_REQUEST_COUNT: usize = 500;

    /// Upper bound on tx ids accepted in one incoming objects request
    pub const MAX_TXS_REQUEST_COUNT: usize = 500;

    /// Cap on block ids returned in one chain entry response
    pub const MAX_CHAIN_ENTRY_IDS: usize = 10_000;
}

/// Network timing constants
pub mod network {
    /// Interval between handler idle ticks (quorum recount + core maintenance)
    pub const IDLE_TICK_SECS: u64 = 2;

    /// Interval between connection-table log dumps
    pub const LOG_CONNECTIONS_SECS: u64 = 60;

    /// Failures recorded against an IP before the transport refuses reconnects
    pub const MAX_IP_FAILS: u32 = 5;
}
