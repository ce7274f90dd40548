use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{atomic, atomic::AtomicU64, Arc},
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Instrument;
use crate::{
    table::{FileEntry, FileTable, PeerEntry, PeerTable, TableError},
    wire::{PacketKind, TrackerPacket, TrackerSideCodec, WireError},
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PIECE_LEN, HANDSHAKE_PORT, MAX_PEER_NUM,
};

pub type Result<T> = std::result::Result<T, TrackerError>;

// Identities for control connections; a reconnecting peer gets a fresh one.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("peer closed the stream before registering")]
    NoRegister,

    #[error("expected REGISTER, got {0:?}")]
    BadHandshake(PacketKind),

}

#[derive(Debug, Clone)]
pub struct TrackerConfig {

    pub listen_addr: SocketAddr,

    // Seconds between peer KEEP_ALIVEs; liveness window is 3x this.
    pub heartbeat_interval: u32,

    // Piece size dictated to every peer.
    pub piece_len: u32,

}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], HANDSHAKE_PORT)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            piece_len: DEFAULT_PIECE_LEN,
        }
    }
}

// Central coordinator: the authoritative file table, the registered
// peers, and the loops that keep both fresh.
pub struct Tracker {
    ctx: Arc<TrackerContext>,
}

pub(crate) struct TrackerContext {
    pub peers: PeerTable,
    pub files: FileTable,
    pub config: TrackerConfig,
    pub cancel: CancellationToken,
}

impl Tracker {

    pub fn new(config: TrackerConfig, cancel: CancellationToken) -> Self {
        Tracker {
            ctx: Arc::new(TrackerContext {
                peers: PeerTable::new(),
                files: FileTable::new(),
                config,
                cancel,
            }),
        }
    }

    // Accepts peers and ages out dead ones until cancellation.
    #[tracing::instrument(name = "tracker", skip_all)]
    pub async fn run(&self) -> Result<()> {

        let listener = TcpListener::bind(self.ctx.config.listen_addr).await?;
        tracing::info!("listening on {}", listener.local_addr()?);
        let mut sweeper = time::interval(time::Duration::from_secs(
            self.ctx.config.heartbeat_interval as u64,
        ));

        loop {
            tokio::select! {

                _ = self.ctx.cancel.cancelled() => break,

                _ = sweeper.tick() => self.ctx.sweep(),

                conn = listener.accept() => {
                    let (stream, address) = match conn {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("inbound connection error: {}", e);
                            continue;
                        }
                    };
                    let ctx = Arc::clone(&self.ctx);
                    let span = tracing::info_span!("peer", addr = %address);
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(ctx, stream).await {
                            tracing::warn!("peer connection ended: {}", e);
                        }
                    }.instrument(span));
                }
            }
        }

        Ok(())
    }
}

// One task per control connection. The first packet must be REGISTER;
// after that the stream carries KEEP_ALIVEs and FILE_UPDATEs inbound
// and TRACKER_SYNC broadcasts outbound. A closed stream is proof of
// death.
async fn handle_peer(ctx: Arc<TrackerContext>, stream: TcpStream) -> Result<()> {

    let socket = Framed::new(stream, TrackerSideCodec);
    let (mut sink, mut stream) = socket.split();

    let register = match stream.next().await {
        Some(pkt) => pkt?,
        None => return Err(TrackerError::NoRegister),
    };
    if register.kind != PacketKind::Register {
        return Err(TrackerError::BadHandshake(register.kind));
    }
    let ip = register.ip;
    let conn_id = NEXT_CONN_ID.fetch_add(1, atomic::Ordering::Relaxed);
    tracing::info!("registered peer {} (p2p port {})", ip, register.port);

    // A reconnecting peer supersedes its old registration.
    if ctx.peers.delete_by_ip(&ip) {
        tracing::warn!("dropped stale registration for {}", ip);
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.peers.add(PeerEntry::new(ip.clone(), conn_id, tx));

    // First TRACKER_SYNC carries the parameters the peer needs to run.
    sink.send(ctx.sync_packet()).await?;

    let result = loop {
        tokio::select! {

            pkt = stream.next() => {
                let pkt = match pkt {
                    Some(Ok(pkt)) => pkt,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                };
                match pkt.kind {
                    PacketKind::KeepAlive => {
                        if let Err(e) = ctx.peers.refresh_timestamp(&pkt.ip) {
                            tracing::warn!("keep alive refused: {}", e);
                        }
                    }
                    PacketKind::FileUpdate => {
                        tracing::info!("file update from {} with {} entries", pkt.ip, pkt.entries.len());
                        ctx.peers.refresh_timestamp(&pkt.ip).ok();
                        ctx.merge(&pkt.ip, pkt.entries);
                        ctx.files.print();
                        ctx.broadcast();
                    }
                    PacketKind::Register => tracing::warn!("duplicate REGISTER from {}", pkt.ip),
                }
            }

            out = rx.recv() => match out {
                Some(pkt) => sink.send(pkt).await?,
                None => break Ok(()),
            },

            _ = ctx.cancel.cancelled() => break Ok(()),
        }
    };

    ctx.drop_peer(&ip, conn_id);
    result
}

impl TrackerContext {

    fn sync_packet(&self) -> TrackerPacket {
        TrackerPacket {
            heartbeat_interval: self.config.heartbeat_interval,
            piece_len: self.config.piece_len,
            entries: self.files.entries(),
        }
    }

    // Folds one peer's FILE_UPDATE into the authoritative table. Entries
    // are keyed by name: a strictly newer timestamp replaces the entry
    // and resets its sources to the sender, an equal timestamp adds the
    // sender as another source, an older one is ignored. Files the
    // sender no longer lists lose the sender's IP and disappear entirely
    // once no source remains.
    pub(crate) fn merge(&self, sender: &str, entries: Vec<FileEntry>) {

        let listed: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();

        for mut file in entries {
            file.sources = vec![sender.to_string()];
            match self.files.search_by_name(&file.name) {
                None => self.files.append(file),
                Some(current) => {
                    if file.timestamp > current.timestamp {
                        self.files.update(&file.name, &file);
                    } else if file.timestamp == current.timestamp
                        && !current.sources.iter().any(|s| s == sender)
                    {
                        let mut updated = current;
                        if updated.sources.len() < MAX_PEER_NUM {
                            updated.sources.push(sender.to_string());
                            self.files.update(&file.name, &updated);
                        } else {
                            tracing::warn!("source list for {} is full", file.name);
                        }
                    }
                }
            }
        }

        for current in self.files.entries() {
            if listed.contains(&current.name) || !current.sources.iter().any(|s| s == sender) {
                continue;
            }
            let mut updated = current.clone();
            updated.sources.retain(|s| s != sender);
            if updated.sources.is_empty() {
                tracing::info!("{} lost its last source, dropping", current.name);
                self.files.delete_by_name(&current.name);
            } else {
                self.files.update(&current.name, &updated);
            }
        }
    }

    // Sends the merged table to every live peer.
    fn broadcast(&self) {
        let entries = self.files.entries();
        for peer in self.peers.snapshot() {
            let packet = TrackerPacket {
                heartbeat_interval: self.config.heartbeat_interval,
                piece_len: self.config.piece_len,
                entries: entries.clone(),
            };
            if peer.tx.send(packet).is_err() {
                tracing::trace!("peer {} has gone away", peer.ip);
            }
        }
    }

    // Drops peers unheard for three heartbeat intervals and purges
    // their IPs from every file's sources.
    fn sweep(&self) {
        let max_age = 3 * self.config.heartbeat_interval as u64;
        let dead = self.peers.sweep(max_age);
        if dead.is_empty() {
            return;
        }
        let mut changed = false;
        for peer in &dead {
            tracing::warn!("peer {} timed out", peer.ip);
            changed |= self.files.purge_source(&peer.ip);
        }
        if changed {
            self.broadcast();
        }
    }

    fn drop_peer(&self, ip: &str, conn_id: u64) {
        if self.peers.delete_connection(ip, conn_id) {
            tracing::info!("peer {} disconnected", ip);
            if self.files.purge_source(ip) {
                self.broadcast();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::S_IFREG;

    fn test_ctx() -> TrackerContext {
        TrackerContext {
            peers: PeerTable::new(),
            files: FileTable::new(),
            config: TrackerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn entry(name: &str, timestamp: u64, ip: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            size: 512,
            timestamp,
            file_type: S_IFREG,
            sources: vec![ip.to_string()],
        }
    }

    #[test]
    fn test_merge_inserts_new_entries() {
        let ctx = test_ctx();
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);

        let merged = ctx.files.search_by_name("a.txt").unwrap();
        assert_eq!(merged.timestamp, 100);
        assert_eq!(merged.sources, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_merge_newer_wins_and_resets_sources() {
        let ctx = test_ctx();
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);
        ctx.merge("10.0.0.2", vec![entry("a.txt", 100, "10.0.0.2")]);
        assert_eq!(
            ctx.files.search_by_name("a.txt").unwrap().sources,
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        );

        // Peer 2 edits the file: the stale holder is no longer a source.
        ctx.merge("10.0.0.2", vec![entry("a.txt", 200, "10.0.0.2")]);
        let merged = ctx.files.search_by_name("a.txt").unwrap();
        assert_eq!(merged.timestamp, 200);
        assert_eq!(merged.sources, vec!["10.0.0.2".to_string()]);

        // An update carrying an older timestamp changes nothing.
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);
        assert_eq!(ctx.files.search_by_name("a.txt").unwrap().timestamp, 200);
    }

    #[test]
    fn test_merge_equal_timestamp_is_idempotent() {
        let ctx = test_ctx();
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);
        assert_eq!(
            ctx.files.search_by_name("a.txt").unwrap().sources,
            vec!["10.0.0.1".to_string()],
        );
    }

    #[test]
    fn test_merge_removes_sender_from_dropped_files() {
        // S5 shape: the last holder deleting a file removes it globally.
        let ctx = test_ctx();
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1"), entry("b.txt", 100, "10.0.0.1")]);
        ctx.merge("10.0.0.2", vec![entry("a.txt", 100, "10.0.0.2")]);

        // Peer 1 deleted both files locally.
        ctx.merge("10.0.0.1", vec![]);

        // a.txt survives on peer 2; b.txt lost its only source.
        assert_eq!(
            ctx.files.search_by_name("a.txt").unwrap().sources,
            vec!["10.0.0.2".to_string()],
        );
        assert!(ctx.files.search_by_name("b.txt").is_none());
    }

    #[test]
    fn test_sweep_purges_dead_peer_sources() {
        let ctx = test_ctx();
        let (tx, _rx) = mpsc::unbounded_channel();
        ctx.peers.add(PeerEntry {
            ip: "10.0.0.1".to_string(),
            conn_id: 0,
            tx,
            last_heard: 0,
        });
        ctx.merge("10.0.0.1", vec![entry("a.txt", 100, "10.0.0.1")]);

        ctx.sweep();
        assert!(ctx.peers.is_empty());
        assert!(ctx.files.search_by_name("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_register_and_sync_over_socket() {
        use crate::wire::{PeerPacket, PeerSideCodec};
        use tokio_util::codec::Framed;

        let ctx = Arc::new(test_ctx());
        ctx.merge("10.0.0.9", vec![entry("seed.txt", 77, "10.0.0.9")]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_peer(server_ctx, stream).await.ok();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut socket = Framed::new(stream, PeerSideCodec);
        socket.send(PeerPacket::register("10.0.0.5", 6768)).await.unwrap();

        // REGISTER is answered with the current merged table.
        let sync = socket.next().await.unwrap().unwrap();
        assert_eq!(sync.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(sync.piece_len, DEFAULT_PIECE_LEN);
        assert_eq!(sync.entries.len(), 1);
        assert_eq!(sync.entries[0].name, "seed.txt");

        // A file update is merged and broadcast back to us.
        socket
            .send(PeerPacket::file_update("10.0.0.5", vec![entry("new.txt", 42, "10.0.0.5")]))
            .await
            .unwrap();
        let sync = socket.next().await.unwrap().unwrap();
        assert_eq!(sync.entries.len(), 2);
        assert!(ctx.files.search_by_name("new.txt").is_some());

        // Closing the stream is proof of death: the peer is dropped and
        // its files are purged.
        drop(socket);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !ctx.peers.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer not dropped on disconnect");
        assert!(ctx.files.search_by_name("new.txt").is_none());
        assert!(ctx.files.search_by_name("seed.txt").is_some());
    }
}
