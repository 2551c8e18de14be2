use libmule_core::Id16;
use serde::Serialize;

use crate::type_aliases::PeerHandle;

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub hash: Id16,
    pub kind: AlertKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    Added,
    Removed,
    Paused,
    Resumed,
    StateChanged { state: crate::transfer::TransferState },
    PieceFinished { piece: u32 },
    HashFailed { piece: u32 },
    PeerConnected { peer: PeerHandle },
    PeerDisconnected { peer: PeerHandle, reason: String },
    /// Every wanted piece is verified.
    Finished,
    /// Every piece is verified.
    Completed,
    Error { error: String },
    ResumeDataSaved,
}

#[derive(Clone, Debug)]
pub struct SessionAlertBus {
    alert_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl SessionAlertBus {
    pub fn new() -> Self {
        let (alert_tx, _) = tokio::sync::broadcast::channel(128);
        Self { alert_tx }
    }

    pub(crate) fn new_transfer_bus(&self, hash: Id16) -> TransferAlertBus {
        let (alert_tx, _) = tokio::sync::broadcast::channel(128);
        TransferAlertBus {
            hash,
            session_bus: self.clone(),
            alert_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }
}

impl Default for SessionAlertBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct TransferAlertBus {
    hash: Id16,
    session_bus: SessionAlertBus,
    alert_tx: tokio::sync::broadcast::Sender<AlertKind>,
}

impl TransferAlertBus {
    pub(crate) fn emit(&self, kind: AlertKind) {
        let _ = self.alert_tx.send(kind.clone());
        let _ = self.session_bus.alert_tx.send(Alert {
            hash: self.hash,
            kind,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AlertKind> {
        self.alert_tx.subscribe()
    }
}
