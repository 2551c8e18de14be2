//! The piece-transfer engine of an eDonkey2000-style file sharing client.
//!
//! It decides which byte ranges to request from which peers, bounds the
//! number of half-open outbound connections, verifies pieces against their
//! MD4 hashes and picks which known peers are worth dialing. Wire encoding
//! and the handshake live outside: peers are plugged in through
//! [`PeerConnector`] and decoded [`PeerMessage`]s.
//!
//! # Overview
//! The main type to start off with is [`Session`]. The building blocks it
//! drives ([`ConnectionQueue`], [`PiecePicker`], [`PeerLink`], [`Transfer`],
//! [`PeerPolicy`]) are usable on their own and don't do any I/O.

pub mod alerts;
pub mod bandwidth;
pub mod connection_queue;
pub mod disk;
mod error;
pub mod message;
pub mod peer_link;
pub mod piece_picker;
pub mod policy;
pub mod resume_data;
mod session;
pub mod storage;
pub mod transfer;
#[cfg(feature = "tracing-subscriber-utils")]
pub mod tracing_subscriber_config_utils;
mod type_aliases;

pub use alerts::{Alert, AlertKind};
pub use bandwidth::{BandwidthConfig, ChannelState, Direction};
pub use connection_queue::{ConnectPriority, ConnectionQueue, Ticket};
pub use error::{Error, Result};
pub use message::{ByteRange, PeerMessage, RangeRequest, WriterRequest};
pub use peer_link::{LinkSettings, PeerLink, SchedulingContext, classify_speed};
pub use piece_picker::{PickOptions, PiecePicker, SpeedClass};
pub use policy::{KnownPeer, PeerPolicy, PeerSource};
pub use resume_data::{ResumeData, ResumeDataStore};
pub use session::{PeerConnector, Session, SessionOptions};
pub use storage::{FilesystemStorage, InMemoryStorage, TransferStorage};
pub use transfer::{AddTransferParams, PieceState, Transfer, TransferSettings, TransferState, TransferStatus};
pub use type_aliases::{BF, PeerHandle, PeerRx, PeerTx};

pub use libmule_core::Id16;
pub use libmule_core::constants::*;
pub use libmule_core::lengths::{Lengths, PieceBlock, ValidPieceIndex};

#[cfg(test)]
mod tests;

/// The cargo version of libmule.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
