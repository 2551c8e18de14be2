use std::sync::Arc;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use libmule_core::constants::BLOCK_SIZE;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandwidthConfig {
    pub upload_bps: Option<usize>,
    pub download_bps: Option<usize>,
}

/// Index into a peer link's per-direction channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload = 0,
    Download = 1,
}

/// What a peer link's channel in one direction is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Idle,
    /// Refused by the bandwidth quota.
    Limit,
    /// Waiting for the remote side.
    Network,
    /// Waiting for a disk job.
    Disk,
    /// Nothing to request until earlier pieces become available.
    Sequential,
}

/// A byte quota for one direction. `None` means unlimited.
pub struct BandwidthChannel(RwLock<Arc<Option<RateLimiter>>>);

impl BandwidthChannel {
    fn new_inner(bps: Option<usize>) -> Arc<Option<RateLimiter>> {
        let bps = match bps {
            Some(bps) => bps,
            None => return Arc::new(None),
        };
        let b_per_100_ms = bps.div_ceil(10);
        Arc::new(Some(
            RateLimiter::builder()
                .interval(Duration::from_millis(100))
                .refill(b_per_100_ms)
                // a full block has to fit into the bucket regardless of the limit
                .max((BLOCK_SIZE as usize).max(bps))
                .initial(b_per_100_ms)
                .build(),
        ))
    }

    pub fn new(bps: Option<usize>) -> Self {
        Self(RwLock::new(Self::new_inner(bps)))
    }

    pub fn is_limited(&self) -> bool {
        self.0.read().is_some()
    }

    /// Takes `size` bytes of quota if they are available right now.
    pub fn try_acquire(&self, size: usize) -> bool {
        let lim = self.0.read().clone();
        match lim.as_ref() {
            Some(rl) => rl.try_acquire(size),
            None => true,
        }
    }

    pub fn set(&self, limit: Option<usize>) {
        let new = Self::new_inner(limit);
        *self.0.write() = new;
    }
}

pub struct BandwidthManager {
    pub(crate) down: BandwidthChannel,
    pub(crate) up: BandwidthChannel,
}

impl Default for BandwidthManager {
    fn default() -> Self {
        Self::new(BandwidthConfig::default())
    }
}

impl BandwidthManager {
    pub fn new(config: BandwidthConfig) -> Self {
        Self {
            down: BandwidthChannel::new(config.download_bps),
            up: BandwidthChannel::new(config.upload_bps),
        }
    }

    pub fn channel(&self, direction: Direction) -> &BandwidthChannel {
        match direction {
            Direction::Upload => &self.up,
            Direction::Download => &self.down,
        }
    }

    pub fn set_upload_bps(&self, bps: Option<usize>) {
        self.up.set(bps);
    }

    pub fn set_download_bps(&self, bps: Option<usize>) {
        self.down.set(bps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_grants() {
        let ch = BandwidthChannel::new(None);
        assert!(!ch.is_limited());
        for _ in 0..100 {
            assert!(ch.try_acquire(BLOCK_SIZE as usize));
        }
    }

    #[tokio::test]
    async fn test_limited_refuses_when_exhausted() {
        let ch = BandwidthChannel::new(Some(1000));
        assert!(ch.is_limited());
        assert!(ch.try_acquire(100));
        assert!(!ch.try_acquire(BLOCK_SIZE as usize));

        ch.set(None);
        assert!(ch.try_acquire(BLOCK_SIZE as usize));
    }
}
