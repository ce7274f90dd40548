use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use super::interlock::{FileOp, Interlock};

// Callback table handed to the monitor at startup. Add/modify/delete
// fire per changed path; sync fires once after the first scan; tick
// fires after every scan.
pub trait FileAlerts: Send + Sync {
    fn on_add(&self, name: &str);
    fn on_modify(&self, name: &str);
    fn on_delete(&self, name: &str);
    fn on_sync(&self);
    fn on_tick(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stat {
    size: u64,
    timestamp: u64,
    is_dir: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Change {
    Added(String),
    Modified(String),
    Deleted(String),
}

// Polling watcher over the peer's directory. Starts from an empty
// baseline so pre-existing files surface as adds on the first pass.
// The baseline advances every scan regardless of suppression, so a
// blocked event is dropped for good rather than deferred.
pub fn spawn(
    root: std::path::PathBuf,
    interlock: Arc<Interlock>,
    alerts: Arc<dyn FileAlerts>,
    poll: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(root, interlock, alerts, poll, cancel).await;
    })
}

#[tracing::instrument(name = "monitor", skip_all)]
async fn run(
    root: std::path::PathBuf,
    interlock: Arc<Interlock>,
    alerts: Arc<dyn FileAlerts>,
    poll: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("watching {:?} every {:?}", root, poll);
    let mut snapshot = HashMap::new();
    let mut first = true;
    let mut ticker = time::interval(poll);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let next = match scan(&root) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("scan failed: {}", e);
                continue;
            }
        };

        for change in diff(&snapshot, &next) {
            deliver(&interlock, alerts.as_ref(), &change);
        }
        snapshot = next;

        if first {
            first = false;
            alerts.on_sync();
        }
        alerts.on_tick();
    }
    tracing::info!("monitor stopped");
}

fn deliver(interlock: &Interlock, alerts: &dyn FileAlerts, change: &Change) {
    let (name, op) = match change {
        Change::Added(name) => (name, FileOp::Add),
        Change::Modified(name) => (name, FileOp::Write),
        Change::Deleted(name) => (name, FileOp::Delete),
    };
    if interlock.is_blocked(name, op) {
        tracing::trace!("suppressed {:?} for {}", op, name);
        return;
    }
    match change {
        Change::Added(name) => alerts.on_add(name),
        Change::Modified(name) => alerts.on_modify(name),
        Change::Deleted(name) => alerts.on_delete(name),
    }
}

// Recursive snapshot of the watched tree, keyed by root-relative name.
// In-flight `<name>.part.<i>` temp files are invisible to the monitor.
fn scan(root: &Path) -> io::Result<HashMap<String, Stat>> {
    let mut map = HashMap::new();
    scan_dir(root, "", &mut map)?;
    Ok(map)
}

// Names currently in the watched tree, for the startup table seed.
pub(crate) fn scan_names(root: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = scan(root)?.into_keys().collect();
    names.sort();
    Ok(names)
}

fn scan_dir(dir: &Path, prefix: &str, map: &mut HashMap<String, Stat>) -> io::Result<()> {
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(file_name) = file_name.to_str() else {
            tracing::warn!("skipping non-utf8 name in {:?}", dir);
            continue;
        };
        if is_part_file(file_name) {
            continue;
        }
        let name = if prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", prefix, file_name)
        };

        // The entry may vanish between readdir and stat.
        let meta = match dirent.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::trace!("cannot stat {}: {}", name, e);
                continue;
            }
        };
        let timestamp = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        if meta.is_dir() {
            map.insert(name.clone(), Stat { size: 0, timestamp, is_dir: true });
            scan_dir(&dirent.path(), &name, map)?;
        } else {
            map.insert(name, Stat { size: meta.len(), timestamp, is_dir: false });
        }
    }
    Ok(())
}

fn is_part_file(file_name: &str) -> bool {
    match file_name.rsplit_once(".part.") {
        Some((_, index)) => !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

// Sorted for deterministic delivery order.
fn diff(old: &HashMap<String, Stat>, new: &HashMap<String, Stat>) -> Vec<Change> {
    let mut changes = Vec::new();
    for (name, stat) in new {
        match old.get(name) {
            None => changes.push(Change::Added(name.clone())),
            Some(prev) if prev != stat => changes.push(Change::Modified(name.clone())),
            Some(_) => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            changes.push(Change::Deleted(name.clone()));
        }
    }
    changes.sort_by(|a, b| {
        let key = |c: &Change| match c {
            Change::Added(n) | Change::Modified(n) | Change::Deleted(n) => n.clone(),
        };
        key(a).cmp(&key(b))
    });
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl FileAlerts for Recorder {
        fn on_add(&self, name: &str) {
            self.events.lock().unwrap().push(format!("add {}", name));
        }
        fn on_modify(&self, name: &str) {
            self.events.lock().unwrap().push(format!("modify {}", name));
        }
        fn on_delete(&self, name: &str) {
            self.events.lock().unwrap().push(format!("delete {}", name));
        }
        fn on_sync(&self) {}
        fn on_tick(&self) {}
    }

    #[test]
    fn test_scan_is_recursive_and_skips_part_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), b"world").unwrap();
        std::fs::write(tmp.path().join("a.txt.part.0"), b"tmp").unwrap();

        let snapshot = scan(tmp.path()).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["a.txt"].size, 5);
        assert!(snapshot["sub"].is_dir);
        assert_eq!(snapshot["sub/b.txt"].size, 5);
        assert!(!snapshot.contains_key("a.txt.part.0"));
    }

    #[test]
    fn test_is_part_file() {
        assert!(is_part_file("a.txt.part.0"));
        assert!(is_part_file("a.txt.part.17"));
        assert!(!is_part_file("a.txt"));
        assert!(!is_part_file("a.part.x"));
        assert!(!is_part_file("partial.txt"));
    }

    #[test]
    fn test_diff_detects_changes() {
        let mut old = HashMap::new();
        old.insert("same".to_string(), Stat { size: 1, timestamp: 10, is_dir: false });
        old.insert("touched".to_string(), Stat { size: 1, timestamp: 10, is_dir: false });
        old.insert("gone".to_string(), Stat { size: 1, timestamp: 10, is_dir: false });

        let mut new = HashMap::new();
        new.insert("same".to_string(), Stat { size: 1, timestamp: 10, is_dir: false });
        new.insert("touched".to_string(), Stat { size: 2, timestamp: 11, is_dir: false });
        new.insert("fresh".to_string(), Stat { size: 1, timestamp: 12, is_dir: false });

        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                Change::Added("fresh".to_string()),
                Change::Deleted("gone".to_string()),
                Change::Modified("touched".to_string()),
            ]
        );
    }

    #[test]
    fn test_deliver_respects_interlock() {
        let interlock = Interlock::new();
        let recorder = Recorder::default();

        interlock.block("a.txt", FileOp::Add);
        deliver(&interlock, &recorder, &Change::Added("a.txt".to_string()));
        // Same path, different op: not suppressed.
        deliver(&interlock, &recorder, &Change::Deleted("a.txt".to_string()));
        interlock.unblock("a.txt", FileOp::Add);
        deliver(&interlock, &recorder, &Change::Added("a.txt".to_string()));

        let events = recorder.events.lock().unwrap();
        assert_eq!(*events, vec!["delete a.txt".to_string(), "add a.txt".to_string()]);
    }
}
