use libmule_core::Id16;
use serde::Serialize;

use super::TransferState;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferCounters {
    /// Payload bytes received, including redundant ones.
    pub fetched_bytes: u64,
    pub redundant_bytes: u64,
    pub failed_hashes: u64,
    pub passed_pieces: u64,
    /// Upload requests received from peers.
    pub requested: u64,
    /// Upload requests we agreed to serve.
    pub accepted: u64,
    /// Bytes uploaded.
    pub transferred: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub hash: Id16,
    pub state: TransferState,
    pub paused: bool,
    pub upload_only: bool,
    pub sequential: bool,
    pub error: Option<String>,
    pub total_pieces: u32,
    pub num_have: u32,
    pub total_bytes: u64,
    pub have_bytes: u64,
    pub num_links: usize,
    pub num_known_peers: usize,
    pub download_bps: u64,
    pub queue_position: usize,
    pub counters: TransferCounters,
}
