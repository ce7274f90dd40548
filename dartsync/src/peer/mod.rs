use std::{
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::{
    table::{DownloadTable, FileEntry, FileTable},
    wire::WireError,
};

pub mod session;
pub mod reconcile;
pub mod download;
pub mod upload;
pub mod monitor;
pub mod interlock;

use interlock::Interlock;
use monitor::FileAlerts;

pub type Result<T> = std::result::Result<T, PeerError>;
pub type SessionTx = mpsc::UnboundedSender<SessionCommand>;
pub type SessionRx = mpsc::UnboundedReceiver<SessionCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("control stream to tracker closed")]
    TrackerClosed,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands to the tracker session task.
pub enum SessionCommand {

    // Gossip the current local file table to the tracker.
    PushTable,

    Shutdown,

}

// Everything a peer's tasks share, created once in main and passed
// explicitly to every task entry point.
#[derive(Debug)]
pub struct PeerContext {

    // Watched directory; all table names are relative to it.
    pub dir: PathBuf,

    // Our own IP as seen on the control stream.
    pub ip: String,

    // Port our upload listener serves pieces on.
    pub p2p_port: u16,

    // Both dictated by the tracker in the first TRACKER_SYNC.
    pub piece_len: u64,
    pub heartbeat_interval: Duration,

    pub filetable: FileTable,

    pub downloads: DownloadTable,

    pub interlock: Arc<Interlock>,

    pub session_tx: SessionTx,

    pub cancel: CancellationToken,

    // Local table changed since the last gossip.
    dirty: AtomicBool,

}

impl PeerContext {

    pub fn new(
        dir: PathBuf,
        ip: String,
        p2p_port: u16,
        piece_len: u64,
        heartbeat_interval: Duration,
        session_tx: SessionTx,
        cancel: CancellationToken,
    ) -> Self {
        PeerContext {
            dir,
            ip,
            p2p_port,
            piece_len,
            heartbeat_interval,
            filetable: FileTable::new(),
            downloads: DownloadTable::new(),
            interlock: Arc::new(Interlock::new()),
            session_tx,
            cancel,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    // Seeds the local table from a scan of the watched directory, so the
    // first reconciliation does not mistake files we already hold for
    // remote additions.
    pub fn load_local_table(&self) -> std::io::Result<()> {
        for name in monitor::scan_names(&self.dir)? {
            match FileEntry::create(&name, &self.dir, &self.ip) {
                Ok(entry) => self.filetable.append(entry),
                Err(e) => tracing::warn!("cannot stat {}: {}", name, e),
            }
        }
        tracing::info!("loaded {} local entries", self.filetable.len());
        self.mark_dirty();
        Ok(())
    }

    fn push_table_if_dirty(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.session_tx.send(SessionCommand::PushTable).ok();
        }
    }
}

// The monitor's callback table. Callbacks only mutate the local table;
// gossip goes out on the tick so one FILE_UPDATE covers a whole poll.
impl FileAlerts for PeerContext {

    fn on_add(&self, name: &str) {
        match FileEntry::create(name, &self.dir, &self.ip) {
            Ok(entry) => {
                tracing::info!("local add: {}", name);
                // The monitor can re-report a file the engine or the
                // initial scan already recorded.
                if !self.filetable.update(name, &entry) {
                    self.filetable.append(entry);
                }
                self.mark_dirty();
            }
            Err(e) => tracing::warn!("cannot stat new file {}: {}", name, e),
        }
    }

    fn on_modify(&self, name: &str) {
        match FileEntry::create(name, &self.dir, &self.ip) {
            Ok(entry) => {
                tracing::info!("local modify: {}", name);
                if !self.filetable.update(name, &entry) {
                    self.filetable.append(entry);
                }
                self.mark_dirty();
            }
            Err(e) => tracing::warn!("cannot stat modified file {}: {}", name, e),
        }
    }

    fn on_delete(&self, name: &str) {
        if self.filetable.delete_by_name(name) {
            tracing::info!("local delete: {}", name);
            self.mark_dirty();
        }
    }

    fn on_sync(&self) {
        // Initial scan finished; push the table even if the directory is empty.
        self.mark_dirty();
        self.session_tx.send(SessionCommand::PushTable).ok();
        self.dirty.store(false, Ordering::Release);
    }

    fn on_tick(&self) {
        self.push_table_if_dirty();
    }
}

// Table names come off the wire; only plain relative paths may touch
// the filesystem.
pub(crate) fn is_clean_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < crate::FILE_NAME_MAX_LEN
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
