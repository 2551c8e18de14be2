use libmule_core::Id16;

use crate::type_aliases::PeerHandle;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection attempt exceeded its deadline")]
    AdmissionTimeout,

    #[error("block request timed out")]
    RequestTimeout,

    #[error("piece {piece} failed hash verification")]
    HashMismatch { piece: u32 },

    #[error("disk error: {0:#}")]
    Disk(#[source] anyhow::Error),

    #[error("peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    #[error(transparent)]
    Lengths(#[from] libmule_core::Error),

    #[error("expected {expected} piece hashes, got {actual}")]
    BadHashset { expected: usize, actual: usize },

    #[error("piece hashes don't add up to file hash {0}")]
    HashsetMismatch(Id16),

    #[error("transfer {0} not found")]
    TransferNotFound(Id16),

    #[error("transfer {0} already exists")]
    TransferAlreadyExists(Id16),

    #[error("peer {0} not found")]
    PeerNotFound(PeerHandle),

    #[error("peer {0} is already connected")]
    PeerAlreadyConnected(PeerHandle),

    #[error("transfer already has the maximum number of peers")]
    TooManyPeers,

    #[error("transfer is not accepting connections in its current state")]
    TransferNotReady,

    #[error("transfer has no piece picker")]
    NoPicker,

    #[error("session is dead")]
    SessionDestroyed,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        Self::PeerProtocolViolation(msg.into())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
