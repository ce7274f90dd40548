mod file;
mod peer;
mod download;

pub use file::{FileEntry, FileTable, S_IFDIR, S_IFMT, S_IFREG};
pub use peer::{PeerEntry, PeerTable};
pub use download::{DownloadEntry, DownloadPiece, DownloadTable, PieceState};

#[derive(thiserror::Error, Debug)]
pub enum TableError {

    #[error("peer {0} is not registered")]
    UnknownPeer(String),

    #[error("peer {ip} was last heard {stored}, which is after {now}")]
    ClockSkew { ip: String, stored: u64, now: u64 },

}

pub type Result<T> = std::result::Result<T, TableError>;
