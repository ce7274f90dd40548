use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod config;
pub mod table;
pub mod wire;
pub mod peer;
pub mod tracker;

// Control connections between peers and the tracker.
pub const HANDSHAKE_PORT: u16 = 6767;

// Piece transfers between peers.
pub const P2P_PORT: u16 = 6768;

// Fixed width of an IP address field on the wire.
pub const IP_LEN: usize = 16;

// Fixed width of a file name field on the wire.
pub const FILE_NAME_MAX_LEN: usize = 256;

// Maximum number of source IPs advertised per file.
pub const MAX_PEER_NUM: usize = 8;

// Period of the polling file monitor. Interlock unblocks are delayed by
// this much so the monitor observes the engine's mutation first.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(2);

// Tracker defaults, pushed to peers in every TRACKER_SYNC.
pub const DEFAULT_HEARTBEAT_INTERVAL: u32 = 10;
pub const DEFAULT_PIECE_LEN: u32 = 0x40000;

// Seconds since the epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
