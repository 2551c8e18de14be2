use serde::Serialize;

use crate::{bandwidth::ChannelState, piece_picker::SpeedClass};

#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct PeerCounters {
    pub fetched_bytes: u64,
    pub fetched_blocks: u64,
    /// Bytes of blocks that were already downloaded from someone else.
    pub redundant_bytes: u64,
    pub uploaded_bytes: u64,
    pub requests_sent: u64,
    pub timeouts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerLinkStats {
    pub addr: String,
    pub counters: PeerCounters,
    pub download_bps: u64,
    pub speed: SpeedClass,
    pub snubbed: bool,
    pub requested: usize,
    pub outstanding: usize,
    pub upload_state: ChannelState,
    pub download_state: ChannelState,
}
