//! Disk work requested by a transfer and executed by the session.
//!
//! A transfer never touches storage itself: it queues [`DiskJob`]s, the
//! session runs them on the blocking pool and feeds each
//! [`DiskCompletion`] back to the transfer on the session loop.

use std::ops::Range;

use bytes::Bytes;
use libmule_core::{Id16, lengths::PieceBlock};
use md4w::IMd4;

use crate::{message::ByteRange, storage::TransferStorage, type_aliases::PeerHandle};

#[derive(Debug)]
pub enum DiskJob {
    Allocate {
        len: u64,
    },
    Write {
        peer: PeerHandle,
        block: PieceBlock,
        offset: u64,
        data: Vec<u8>,
    },
    Hash {
        piece: u32,
        range: Range<u64>,
    },
    Read {
        peer: PeerHandle,
        range: ByteRange,
    },
}

#[derive(Debug)]
pub enum DiskCompletion {
    Allocate {
        result: anyhow::Result<()>,
    },
    Write {
        peer: PeerHandle,
        block: PieceBlock,
        result: anyhow::Result<()>,
    },
    Hash {
        piece: u32,
        result: anyhow::Result<Id16>,
    },
    Read {
        peer: PeerHandle,
        range: ByteRange,
        result: anyhow::Result<Bytes>,
    },
}

// Hashing reads this much at a time.
const HASH_READ_BUF: usize = 65536;

pub fn hash_range(storage: &dyn TransferStorage, range: Range<u64>) -> anyhow::Result<Id16> {
    let mut h = md4w::Md4::new();
    let mut buf = vec![0u8; HASH_READ_BUF];
    let mut offset = range.start;
    while offset < range.end {
        let len = ((range.end - offset) as usize).min(HASH_READ_BUF);
        storage.pread_exact(offset, &mut buf[..len])?;
        h.update(&buf[..len]);
        offset += len as u64;
    }
    Ok(Id16::new(h.finish()))
}

fn read_range(storage: &dyn TransferStorage, range: ByteRange) -> anyhow::Result<Bytes> {
    let mut buf = vec![0u8; range.len() as usize];
    storage.pread_exact(range.start, &mut buf)?;
    Ok(Bytes::from(buf))
}

/// Runs one job to completion. Blocking.
pub fn run_job(storage: &dyn TransferStorage, job: DiskJob) -> DiskCompletion {
    match job {
        DiskJob::Allocate { len } => DiskCompletion::Allocate {
            result: storage.ensure_len(len),
        },
        DiskJob::Write {
            peer,
            block,
            offset,
            data,
        } => DiskCompletion::Write {
            peer,
            block,
            result: storage.pwrite_all(offset, &data),
        },
        DiskJob::Hash { piece, range } => DiskCompletion::Hash {
            piece,
            result: hash_range(storage, range),
        },
        DiskJob::Read { peer, range } => DiskCompletion::Read {
            peer,
            range,
            result: read_range(storage, range),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn test_hash_matches_md4() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let s = InMemoryStorage::with_content(data.clone());
        let h = hash_range(&s, 1000..150_000).unwrap();
        assert_eq!(h, Id16::new(md4w::md4(&data[1000..150_000])));
    }

    #[test]
    fn test_run_jobs() {
        let s = InMemoryStorage::new();
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 4662));
        assert!(matches!(
            run_job(&s, DiskJob::Allocate { len: 10 }),
            DiskCompletion::Allocate { result: Ok(()) }
        ));
        run_job(
            &s,
            DiskJob::Write {
                peer,
                block: PieceBlock::new(0, 0),
                offset: 2,
                data: vec![7, 8, 9],
            },
        );
        match run_job(
            &s,
            DiskJob::Read {
                peer,
                range: ByteRange::new(1, 5),
            },
        ) {
            DiskCompletion::Read { result, .. } => {
                assert_eq!(&result.unwrap()[..], &[0, 7, 8, 9])
            }
            other => panic!("unexpected {other:?}"),
        }
        match run_job(
            &s,
            DiskJob::Read {
                peer,
                range: ByteRange::new(8, 20),
            },
        ) {
            DiskCompletion::Read { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
