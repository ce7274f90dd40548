use std::sync::Arc;
use crate::{table::FileTable, MONITOR_POLL_INTERVAL};
use super::{download, interlock::FileOp, is_clean_name, PeerContext};

// One reconciliation pass: diff the freshly received tracker table
// against the local table and turn every difference into a create-dir,
// download or delete action. The forward sweep (adds and updates)
// always completes before the reverse sweep (deletions).
pub async fn run(ctx: &Arc<PeerContext>, tracker_table: &FileTable) {
    forward_sweep(ctx, tracker_table);
    reverse_sweep(ctx, tracker_table);
}

// The pass against the TRACKER_SYNC that answers REGISTER. The tracker
// has not yet merged our gossip, so anything local but unlisted is not
// deleted here; only the listener-driven passes do that.
pub async fn first_sync(ctx: &Arc<PeerContext>, tracker_table: &FileTable) {
    forward_sweep(ctx, tracker_table);
}

fn forward_sweep(ctx: &Arc<PeerContext>, tracker_table: &FileTable) {
    for file in tracker_table.entries() {
        if !is_clean_name(&file.name) {
            tracing::warn!("ignoring unsafe name from tracker: {:?}", file.name);
            continue;
        }

        match ctx.filetable.search_by_name(&file.name) {

            // Not known locally: create the directory, or fetch the file.
            None => {
                if file.is_dir() {
                    create_directory(ctx, &file);
                } else if ctx.downloads.search_by_file_name(&file.name).is_none() {
                    ctx.interlock.block(&file.name, FileOp::Add);
                    download::begin(ctx, &file, FileOp::Add);
                }
            }

            // Known but outdated: fetch, unless a download is already in
            // flight. Ties in timestamps mean equal, no action.
            Some(local) => {
                if file.timestamp > local.timestamp
                    && !file.is_dir()
                    && ctx.downloads.search_by_file_name(&file.name).is_none()
                {
                    ctx.interlock.block(&file.name, FileOp::Write);
                    download::begin(ctx, &file, FileOp::Write);
                }
            }
        }
    }
}

fn create_directory(ctx: &Arc<PeerContext>, file: &crate::table::FileEntry) {
    ctx.interlock.block(&file.name, FileOp::Add);
    let path = ctx.dir.join(&file.name);
    match std::fs::create_dir_all(&path) {
        Ok(()) => {
            tracing::info!("created directory {}", file.name);
            match crate::table::FileEntry::create(&file.name, &ctx.dir, &ctx.ip) {
                Ok(entry) => {
                    ctx.filetable.append(entry);
                    ctx.mark_dirty();
                }
                Err(e) => tracing::warn!("cannot stat new directory {}: {}", file.name, e),
            }
        }
        Err(e) => tracing::error!("cannot create directory {}: {}", file.name, e),
    }
    Arc::clone(&ctx.interlock).unblock_after(file.name.clone(), FileOp::Add, MONITOR_POLL_INTERVAL);
}

// Everything local that the tracker no longer lists gets removed, from
// disk first and then from the table. A download still in flight for
// such a file is cancelled; its workers observe the missing entry and
// exit.
fn reverse_sweep(ctx: &Arc<PeerContext>, tracker_table: &FileTable) {
    for local in ctx.filetable.entries() {
        if tracker_table.search_by_name(&local.name).is_some() {
            continue;
        }

        ctx.interlock.block(&local.name, FileOp::Delete);
        let path = ctx.dir.join(&local.name);
        let removed = if local.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };

        match removed {
            Ok(()) => tracing::info!("removed {}", local.name),
            // Already gone, e.g. swept away with a parent directory.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Keep the table entry so the next pass retries.
                tracing::error!("cannot remove {}: {}", local.name, e);
                Arc::clone(&ctx.interlock).unblock_after(local.name.clone(), FileOp::Delete, MONITOR_POLL_INTERVAL);
                continue;
            }
        }

        ctx.filetable.delete_by_name(&local.name);
        ctx.downloads.remove_by_file_name(&local.name);
        ctx.mark_dirty();
        Arc::clone(&ctx.interlock).unblock_after(local.name.clone(), FileOp::Delete, MONITOR_POLL_INTERVAL);
    }
}
