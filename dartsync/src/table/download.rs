use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::Notify;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {

    // Not yet claimed by any worker.
    #[default]
    Pending,

    // Claimed by exactly one worker.
    Claimed,

    // Received and written to its temp part file.
    Done,

    // Abandoned because the download was cancelled.
    Failed,

}

// One contiguous byte range of a file in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPiece {

    // Byte offset of the piece within the file.
    pub start: u64,

    // Bytes in this piece, <= piece_len.
    pub size: u32,

    // Zero-based index.
    pub piece_num: u32,

    pub state: PieceState,

}

#[derive(Debug, Default)]
struct PieceSet {
    pieces: Vec<DownloadPiece>,
    successful_pieces: u32,
}

// In-flight state for one file being assembled from pieces. Workers
// synchronise exclusively through `get_unclaimed_piece`; the orchestrator
// waits on the notify, signalled by `mark_done` and by cancellation.
#[derive(Debug)]
pub struct DownloadEntry {

    pub file_name: String,

    pub num_pieces: u32,

    state: Mutex<PieceSet>,

    cancelled: AtomicBool,

    notify: Notify,

}

impl DownloadEntry {

    pub fn new(file_name: &str, size: u64, piece_len: u64) -> Self {
        let num_pieces = ((size + piece_len - 1) / piece_len) as u32;
        let pieces = (0..num_pieces)
            .map(|i| {
                let start = i as u64 * piece_len;
                DownloadPiece {
                    start,
                    size: piece_len.min(size - start) as u32,
                    piece_num: i,
                    state: PieceState::Pending,
                }
            })
            .collect();

        DownloadEntry {
            file_name: file_name.to_string(),
            num_pieces,
            state: Mutex::new(PieceSet { pieces, successful_pieces: 0 }),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    // Atomically transitions one pending piece to claimed and returns it.
    // Ties among racing workers are broken by iteration order. Returns
    // none once nothing is pending or the download was cancelled.
    pub fn get_unclaimed_piece(&self) -> Option<DownloadPiece> {
        if self.is_cancelled() {
            return None;
        }
        let mut state = self.lock();
        let piece = state
            .pieces
            .iter_mut()
            .find(|p| p.state == PieceState::Pending)?;
        piece.state = PieceState::Claimed;
        Some(*piece)
    }

    // Returns a claimed piece to the pending pool after a transfer
    // failure, or marks it failed if the download is already cancelled.
    pub fn readd_piece(&self, piece_num: u32) {
        let cancelled = self.is_cancelled();
        let mut state = self.lock();
        if let Some(piece) = state
            .pieces
            .iter_mut()
            .find(|p| p.piece_num == piece_num && p.state == PieceState::Claimed)
        {
            piece.state = if cancelled { PieceState::Failed } else { PieceState::Pending };
        }
    }

    pub fn mark_done(&self, piece_num: u32) {
        let mut state = self.lock();
        if let Some(piece) = state
            .pieces
            .iter_mut()
            .find(|p| p.piece_num == piece_num && p.state == PieceState::Claimed)
        {
            piece.state = PieceState::Done;
            state.successful_pieces += 1;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn successful_pieces(&self) -> u32 {
        self.lock().successful_pieces
    }

    pub fn is_complete(&self) -> bool {
        self.successful_pieces() == self.num_pieces
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pieces(&self) -> Vec<DownloadPiece> {
        self.lock().pieces.clone()
    }

    // Waits until every piece is done or the entry is cancelled.
    // Returns true when the download completed.
    pub async fn wait_complete(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return false;
            }
            if self.is_complete() {
                return true;
            }
            notified.await;
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, PieceSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Active downloads keyed by file name, at most one entry per file.
#[derive(Debug, Default)]
pub struct DownloadTable {
    entries: Mutex<HashMap<String, Arc<DownloadEntry>>>,
}

impl DownloadTable {

    pub fn new() -> Self {
        DownloadTable::default()
    }

    // Inserts the entry unless one with the same name is already in
    // flight; returns a handle on success.
    pub fn add(&self, entry: DownloadEntry) -> Option<Arc<DownloadEntry>> {
        let mut entries = self.lock();
        if entries.contains_key(&entry.file_name) {
            return None;
        }
        let entry = Arc::new(entry);
        entries.insert(entry.file_name.clone(), Arc::clone(&entry));
        Some(entry)
    }

    pub fn search_by_file_name(&self, name: &str) -> Option<Arc<DownloadEntry>> {
        self.lock().get(name).cloned()
    }

    // Removes the entry, cancelling it so workers and the waiting
    // orchestrator observe the disappearance.
    pub fn remove_by_file_name(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DownloadEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
