use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use crate::{unix_now, wire::TrackerPacket};
use super::{Result, TableError};

// One registered peer. The sender is the write side of the peer's
// control stream, owned by its connection task.
#[derive(Debug, Clone)]
pub struct PeerEntry {

    pub ip: String,

    // Identity of the control connection, the stand-in for its socket
    // fd. A reconnecting peer gets a fresh one, so the superseded
    // handler cannot tear down the new registration on its way out.
    pub conn_id: u64,

    pub tx: mpsc::UnboundedSender<TrackerPacket>,

    // Unix time the peer last sent anything on the control stream.
    pub last_heard: u64,

}

impl PeerEntry {
    pub fn new(ip: String, conn_id: u64, tx: mpsc::UnboundedSender<TrackerPacket>) -> Self {
        PeerEntry {
            ip,
            conn_id,
            tx,
            last_heard: unix_now(),
        }
    }
}

// Registered peers with liveness timestamps, under one mutex.
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: Mutex<Vec<PeerEntry>>,
}

impl PeerTable {

    pub fn new() -> Self {
        PeerTable::default()
    }

    pub fn add(&self, entry: PeerEntry) {
        self.lock().push(entry);
    }

    pub fn delete_by_ip(&self, ip: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.ip != ip);
        entries.len() != before
    }

    // Removes only the registration made over the given connection.
    pub fn delete_connection(&self, ip: &str, conn_id: u64) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.ip != ip || e.conn_id != conn_id);
        entries.len() != before
    }

    pub fn search_by_ip(&self, ip: &str) -> Option<PeerEntry> {
        self.lock().iter().find(|e| e.ip == ip).cloned()
    }

    pub fn exists(&self, entry: &PeerEntry) -> bool {
        self.lock().iter().any(|e| e.ip == entry.ip)
    }

    // Sets the peer's last-heard time to now. Refuses when the stored
    // timestamp is already in the future (clock-skew guard).
    pub fn refresh_timestamp(&self, ip: &str) -> Result<()> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.ip == ip)
            .ok_or_else(|| TableError::UnknownPeer(ip.to_string()))?;

        let now = unix_now();
        if entry.last_heard > now {
            return Err(TableError::ClockSkew {
                ip: ip.to_string(),
                stored: entry.last_heard,
                now,
            });
        }
        entry.last_heard = now;
        Ok(())
    }

    // Removes and returns every peer unheard for more than `max_age` seconds.
    pub fn sweep(&self, max_age: u64) -> Vec<PeerEntry> {
        let mut entries = self.lock();
        let now = unix_now();
        let (dead, live): (Vec<PeerEntry>, Vec<PeerEntry>) = entries
            .drain(..)
            .partition(|e| now.saturating_sub(e.last_heard) > max_age);
        *entries = live;
        dead
    }

    pub fn snapshot(&self) -> Vec<PeerEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PeerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str) -> PeerEntry {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerEntry::new(ip.to_string(), 0, tx)
    }

    #[test]
    fn test_add_search_delete() {
        let table = PeerTable::new();
        table.add(peer("10.0.0.1"));
        table.add(peer("10.0.0.2"));

        assert_eq!(table.len(), 2);
        assert!(table.exists(&peer("10.0.0.1")));
        assert_eq!(table.search_by_ip("10.0.0.2").unwrap().ip, "10.0.0.2");
        assert!(table.search_by_ip("10.0.0.3").is_none());

        assert!(table.delete_by_ip("10.0.0.1"));
        assert!(!table.delete_by_ip("10.0.0.1"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_connection_spares_newer_registration() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        table.add(PeerEntry::new("10.0.0.1".to_string(), 1, tx.clone()));
        table.add(PeerEntry::new("10.0.0.1".to_string(), 2, tx));

        // The stale connection's exit must not drop the fresh one.
        assert!(table.delete_connection("10.0.0.1", 1));
        assert_eq!(table.search_by_ip("10.0.0.1").unwrap().conn_id, 2);
        assert!(!table.delete_connection("10.0.0.1", 1));
    }

    #[test]
    fn test_refresh_timestamp() {
        let table = PeerTable::new();
        table.add(peer("10.0.0.1"));

        // Age the entry, then refresh it back to now.
        table.lock()[0].last_heard = unix_now() - 100;
        table.refresh_timestamp("10.0.0.1").unwrap();
        assert!(unix_now() - table.search_by_ip("10.0.0.1").unwrap().last_heard <= 1);

        assert!(matches!(
            table.refresh_timestamp("10.0.0.9"),
            Err(TableError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_refresh_timestamp_rejects_future_stamp() {
        let table = PeerTable::new();
        table.add(peer("10.0.0.1"));
        table.lock()[0].last_heard = unix_now() + 1000;

        assert!(matches!(
            table.refresh_timestamp("10.0.0.1"),
            Err(TableError::ClockSkew { .. })
        ));
    }

    #[test]
    fn test_sweep_removes_stale_peers() {
        let table = PeerTable::new();
        table.add(peer("10.0.0.1"));
        table.add(peer("10.0.0.2"));
        table.lock()[0].last_heard = unix_now() - 100;

        let dead = table.sweep(30);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].ip, "10.0.0.1");
        assert_eq!(table.len(), 1);
        assert!(table.search_by_ip("10.0.0.2").is_some());
    }
}
