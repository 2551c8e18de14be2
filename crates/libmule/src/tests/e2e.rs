use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use libmule_core::{Id16, lengths::Lengths};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc::unbounded_channel};
use tracing::{Instrument, debug, error_span};

use super::test_util::{hashset, random_content, setup_test_logging};
use crate::{
    Alert, AlertKind, PeerConnector, PeerMessage, PeerTx, ResumeDataStore, Session, SessionOptions,
    TransferState, WriterRequest,
    storage::{InMemoryStorage, TransferStorage},
    transfer::AddTransferParams,
    type_aliases::{BF, PeerRx},
};

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(10, 0, 0, n), 4662))
}

/// Pretends every dialed address is a seed serving `data`. Addresses in
/// `unreachable` fail to connect.
struct MockSeeds {
    data: Arc<Vec<u8>>,
    unreachable: HashSet<SocketAddr>,
    dialed: Mutex<Vec<SocketAddr>>,
}

impl MockSeeds {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            unreachable: HashSet::new(),
            dialed: Mutex::new(Vec::new()),
        }
    }
}

async fn serve_as_seed(session: Session, hash: Id16, addr: SocketAddr, data: Arc<Vec<u8>>, mut rx: PeerRx) {
    while let Some(req) = rx.recv().await {
        let replies = match req {
            WriterRequest::StartUpload { .. } => {
                vec![PeerMessage::FileStatus(BF::new()), PeerMessage::AcceptUpload]
            }
            WriterRequest::RequestParts(req) => req
                .ranges
                .iter()
                .map(|r| PeerMessage::SendingPart {
                    start: r.start,
                    data: Bytes::copy_from_slice(&data[r.start as usize..r.end as usize]),
                })
                .collect(),
            WriterRequest::SendingPart { .. } => Vec::new(),
            WriterRequest::Disconnect => break,
        };
        for msg in replies {
            if let Err(e) = session.peer_message(hash, addr, msg).await {
                debug!("peer message rejected: {e}");
            }
        }
    }
}

#[async_trait]
impl PeerConnector for MockSeeds {
    async fn connect(&self, session: Session, hash: Id16, addr: SocketAddr) -> anyhow::Result<PeerTx> {
        self.dialed.lock().push(addr);
        if self.unreachable.contains(&addr) {
            bail!("connection refused");
        }
        let (tx, rx) = unbounded_channel();
        tokio::spawn(
            serve_as_seed(session, hash, addr, self.data.clone(), rx)
                .instrument(error_span!("mock_seed", %addr)),
        );
        Ok(tx)
    }
}

async fn wait_for_state(session: &Session, hash: Id16, state: TransferState) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let status = session.transfer_status(hash).await?;
            if status.state == state {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timeout waiting for {state:?}"))?
}

fn drain(alerts: &mut broadcast::Receiver<Alert>, hash: Id16) -> Vec<AlertKind> {
    let mut out = Vec::new();
    while let Ok(a) = alerts.try_recv() {
        if a.hash == hash {
            out.push(a.kind);
        }
    }
    out
}

fn test_options() -> SessionOptions {
    SessionOptions {
        half_open_limit: 1,
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_e2e_download_from_seeds() -> anyhow::Result<()> {
    setup_test_logging();

    // 3 pieces, the last one short, with a short last block.
    let lengths = Lengths::new(10_000, 4096, 1000)?;
    let data = random_content(1, 10_000);
    let (hash, piece_hashes) = hashset(&lengths, &data);

    let resume_dir = tempfile::TempDir::with_prefix("libmule-e2e")?;
    let mut connector = MockSeeds::new(data.clone());
    connector.unreachable.insert(addr(1));
    let connector = Arc::new(connector);
    let session = Session::new(
        SessionOptions {
            resume_folder: Some(resume_dir.path().to_owned()),
            ..test_options()
        },
        connector.clone(),
    )
    .await?;
    let mut alerts = session.subscribe_alerts();

    let storage = Arc::new(InMemoryStorage::new());
    session
        .add_transfer(
            AddTransferParams {
                hash,
                size: 10_000,
                piece_hashes,
                peers: vec![addr(1), addr(2), addr(3)],
                lengths: Some(lengths),
                ..Default::default()
            },
            storage.clone(),
        )
        .await?;

    wait_for_state(&session, hash, TransferState::Seeding).await?;
    assert_eq!(storage.snapshot(), data);
    assert!(!connector.dialed.lock().is_empty());

    let status = session.transfer_status(hash).await?;
    assert_eq!(status.num_have, 3);
    assert_eq!(status.counters.passed_pieces, 3);
    assert_eq!(status.counters.failed_hashes, 0);
    assert!(session.connection_queue().num_connecting() <= 1);

    session.save_resume_data().await?;
    let alerts = drain(&mut alerts, hash);
    for piece in 0..3 {
        assert!(alerts.contains(&AlertKind::PieceFinished { piece }));
    }
    assert!(alerts.contains(&AlertKind::Finished));
    assert!(alerts.contains(&AlertKind::Completed));
    assert!(alerts.contains(&AlertKind::ResumeDataSaved));

    session.shutdown().await;

    let store = ResumeDataStore::new(resume_dir.path().to_owned()).await?;
    let rd = store.load(&hash).await?.context("resume data not saved")?;
    assert_eq!(rd.have_pieces().count_ones(), 3);
    Ok(())
}

#[tokio::test]
async fn test_e2e_resume_skips_download() -> anyhow::Result<()> {
    setup_test_logging();

    let lengths = Lengths::new(5000, 2048, 512)?;
    let data = random_content(2, 5000);
    let (hash, piece_hashes) = hashset(&lengths, &data);
    let resume_dir = tempfile::TempDir::with_prefix("libmule-e2e-resume")?;
    let params = || AddTransferParams {
        hash,
        size: 5000,
        piece_hashes: piece_hashes.clone(),
        lengths: Some(lengths),
        seed_mode: true,
        ..Default::default()
    };
    let opts = SessionOptions {
        resume_folder: Some(resume_dir.path().to_owned()),
        ..test_options()
    };

    let session = Session::new(opts.clone(), Arc::new(MockSeeds::new(data.clone()))).await?;
    session
        .add_transfer(params(), Arc::new(InMemoryStorage::with_content(data.clone())))
        .await?;
    wait_for_state(&session, hash, TransferState::Seeding).await?;
    session.pause(hash).await?;
    session.shutdown().await;

    // Garbage on "disk" would fail a check, so getting to seeding proves
    // the resume data was used.
    let session = Session::new(opts, Arc::new(MockSeeds::new(data.clone()))).await?;
    let mut p = params();
    p.seed_mode = false;
    let storage: Arc<dyn TransferStorage> = Arc::new(InMemoryStorage::with_content(vec![0; 5000]));
    session.add_transfer(p, storage).await?;
    let status = session.transfer_status(hash).await?;
    assert!(status.paused);
    session.resume(hash).await?;
    wait_for_state(&session, hash, TransferState::Seeding).await?;

    session.remove_transfer(hash).await?;
    assert!(matches!(
        session.transfer_status(hash).await,
        Err(crate::Error::TransferNotFound(_))
    ));
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_e2e_serves_incoming_peer() -> anyhow::Result<()> {
    setup_test_logging();

    let lengths = Lengths::new(3000, 1024, 256)?;
    let data = random_content(3, 3000);
    let (hash, piece_hashes) = hashset(&lengths, &data);
    let session = Session::new(test_options(), Arc::new(MockSeeds::new(Vec::new()))).await?;
    session
        .add_transfer(
            AddTransferParams {
                hash,
                size: 3000,
                piece_hashes,
                lengths: Some(lengths),
                seed_mode: true,
                ..Default::default()
            },
            Arc::new(InMemoryStorage::with_content(data.clone())),
        )
        .await?;
    wait_for_state(&session, hash, TransferState::Seeding).await?;

    let (tx, mut rx) = unbounded_channel();
    session.incoming_connection(hash, addr(9), tx).await?;
    session
        .peer_message(hash, addr(9), PeerMessage::FileStatus(BF::repeat(false, 3)))
        .await?;
    let mut ranges = arrayvec::ArrayVec::new();
    ranges.push(crate::ByteRange::new(1000, 2100));
    session
        .peer_message(
            hash,
            addr(9),
            PeerMessage::RequestParts(crate::RangeRequest { hash, ranges }),
        )
        .await?;

    let sent = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(WriterRequest::SendingPart { start, data, .. }) => return Some((start, data)),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await?
    .context("writer closed")?;
    assert_eq!(sent.0, 1000);
    assert_eq!(&sent.1[..], &data[1000..2100]);

    let status = session.transfer_status(hash).await?;
    assert_eq!(status.counters.transferred, 1100);
    assert_eq!(session.peer_stats(hash).await?.len(), 1);

    session.peer_disconnected(hash, addr(9), "closed by peer");
    session.shutdown().await;
    Ok(())
}
