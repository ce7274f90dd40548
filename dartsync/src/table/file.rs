use std::{
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::UNIX_EPOCH,
};

// Stat mode bits carried in FileEntry::file_type.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

// One file or directory known to a table. `name` is relative to the
// watched root and unique within its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {

    pub name: String,

    // Byte count; 0 for directories.
    pub size: u64,

    // Last modification time, seconds since the epoch. The sole ordering
    // used to decide "newer"; ties mean no action.
    pub timestamp: u64,

    // Host stat mode bits.
    pub file_type: u32,

    // IPs advertising the file. On a peer's local table this is exactly
    // the peer's own IP; on the tracker's table, every peer holding it.
    pub sources: Vec<String>,

}

impl FileEntry {

    // Stats `root/name` and builds an entry with the peer's own IP as
    // the only source.
    pub fn create(name: &str, root: &Path, own_ip: &str) -> std::io::Result<Self> {
        let meta = std::fs::metadata(root.join(name))?;
        let timestamp = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let file_type = if meta.is_dir() { S_IFDIR } else { S_IFREG };

        Ok(FileEntry {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            timestamp,
            file_type,
            sources: vec![own_ip.to_string()],
        })
    }

    pub fn is_dir(&self) -> bool {
        self.file_type & S_IFMT == S_IFDIR
    }
}

// Ordered collection of file entries behind a single mutex. Insertion
// order is preserved for deterministic serialisation; lookup is linear
// by name.
#[derive(Debug, Default)]
pub struct FileTable {
    entries: Mutex<Vec<FileEntry>>,
}

impl FileTable {

    pub fn new() -> Self {
        FileTable::default()
    }

    // Builds a table from a deserialised entry chain, preserving order.
    // A duplicate name keeps whichever entry has the greater timestamp.
    pub fn from_entries(list: Vec<FileEntry>) -> Self {
        let table = FileTable::new();
        {
            let mut entries = table.lock();
            for entry in list {
                match entries.iter_mut().find(|e| e.name == entry.name) {
                    Some(existing) => {
                        if entry.timestamp > existing.timestamp {
                            tracing::warn!("duplicate entry for {}, keeping newer", entry.name);
                            *existing = entry;
                        } else {
                            tracing::warn!("duplicate entry for {}, dropped", entry.name);
                        }
                    }
                    None => entries.push(entry),
                }
            }
        }
        table
    }

    pub fn append(&self, entry: FileEntry) {
        self.lock().push(entry);
    }

    pub fn search_by_name(&self, name: &str) -> Option<FileEntry> {
        self.lock().iter().find(|e| e.name == name).cloned()
    }

    // Returns false when no entry carries the name.
    pub fn delete_by_name(&self, name: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    // Replaces size, timestamp, file_type and sources in place. The name
    // is never changed. Returns false when the entry is absent.
    pub fn update(&self, name: &str, new: &FileEntry) -> bool {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.size = new.size;
                entry.timestamp = new.timestamp;
                entry.file_type = new.file_type;
                entry.sources = new.sources.clone();
                true
            }
            None => false,
        }
    }

    // Removes `ip` from every entry's sources, dropping entries whose
    // sources become empty. Returns whether anything changed.
    pub fn purge_source(&self, ip: &str) -> bool {
        let mut entries = self.lock();
        let mut changed = false;
        entries.retain_mut(|entry| {
            let before = entry.sources.len();
            entry.sources.retain(|s| s != ip);
            changed |= entry.sources.len() != before;
            !entry.sources.is_empty()
        });
        changed
    }

    // Snapshot of the entries in table order.
    pub fn entries(&self) -> Vec<FileEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn print(&self) {
        for entry in self.lock().iter() {
            tracing::debug!(
                "{} size={} ts={} dir={} sources={:?}",
                entry.name,
                entry.size,
                entry.timestamp,
                entry.is_dir(),
                entry.sources,
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FileEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
