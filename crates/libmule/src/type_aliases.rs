use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub type PeerHandle = SocketAddr;

pub type PeerTx = tokio::sync::mpsc::UnboundedSender<crate::message::WriterRequest>;
pub type PeerRx = tokio::sync::mpsc::UnboundedReceiver<crate::message::WriterRequest>;
