//! Messages exchanged between the engine and the per-peer I/O tasks.
//!
//! Wire encoding lives outside the engine: the I/O layer decodes the ed2k
//! opcodes into [`PeerMessage`] and encodes [`WriterRequest`] back.

use arrayvec::ArrayVec;
use bytes::Bytes;
use libmule_core::{Id16, constants::MAX_RANGES_PER_REQUEST};

use crate::type_aliases::BF;

/// Half-open byte range `[start, end)` in file coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl From<std::ops::Range<u64>> for ByteRange {
    fn from(r: std::ops::Range<u64>) -> Self {
        Self::new(r.start, r.end)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

/// One "request parts" message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub hash: Id16,
    pub ranges: ArrayVec<ByteRange, MAX_RANGES_PER_REQUEST>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Which pieces the peer has. An empty bitmap means a complete source.
    FileStatus(BF),
    HavePiece(u32),
    /// The peer agreed to upload to us; we can send block requests.
    AcceptUpload,
    /// The peer queued us instead of uploading.
    QueueRanking(u32),
    SendingPart { start: u64, data: Bytes },
    /// The peer won't serve our outstanding ranges.
    OutOfParts,
    NoFile,
    RequestParts(RangeRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterRequest {
    /// Ask the peer to start uploading `hash` to us.
    StartUpload { hash: Id16 },
    RequestParts(RangeRequest),
    SendingPart { hash: Id16, start: u64, data: Bytes },
    Disconnect,
}

/// Merges adjacent ranges and packs them into as few requests as possible.
pub fn batch_ranges(hash: Id16, ranges: impl IntoIterator<Item = ByteRange>) -> Vec<RangeRequest> {
    let mut merged: Vec<ByteRange> = Vec::new();
    for r in ranges {
        match merged.last_mut() {
            Some(last) if last.end == r.start => last.end = r.end,
            _ => merged.push(r),
        }
    }

    merged
        .chunks(MAX_RANGES_PER_REQUEST)
        .map(|chunk| RangeRequest {
            hash,
            ranges: chunk.iter().copied().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_merges_adjacent() {
        let reqs = batch_ranges(
            Id16::default(),
            [
                ByteRange::new(0, 10),
                ByteRange::new(10, 20),
                ByteRange::new(30, 40),
            ],
        );
        assert_eq!(reqs.len(), 1);
        assert_eq!(
            reqs[0].ranges.as_slice(),
            &[ByteRange::new(0, 20), ByteRange::new(30, 40)]
        );
    }

    #[test]
    fn test_batch_splits_into_requests_of_three() {
        let ranges = (0..7u64).map(|i| ByteRange::new(i * 100, i * 100 + 50));
        let reqs = batch_ranges(Id16::default(), ranges);
        assert_eq!(
            reqs.iter().map(|r| r.ranges.len()).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert!(batch_ranges(Id16::default(), []).is_empty());
    }
}
