use std::{path::{Path, PathBuf}, sync::Arc};
use filetime::FileTime;
use futures::SinkExt;
use tokio::{io::AsyncReadExt, net::TcpStream};
use tokio_util::codec::FramedWrite;
use tracing::Instrument;
use crate::{
    table::{DownloadEntry, FileEntry},
    wire::{PieceRequest, PieceRequestCodec},
    MONITOR_POLL_INTERVAL,
};
use super::{interlock::FileOp, PeerContext};

// Starts a download-file task for `file` unless one is already in
// flight. The caller has blocked `(file.name, op)`; the task owns the
// matching unblock on every exit path.
pub(crate) fn begin(ctx: &Arc<PeerContext>, file: &FileEntry, op: FileOp) {
    let entry = DownloadEntry::new(&file.name, file.size, ctx.piece_len);
    let Some(entry) = ctx.downloads.add(entry) else {
        Arc::clone(&ctx.interlock).unblock_after(file.name.clone(), op, MONITOR_POLL_INTERVAL);
        return;
    };

    let ctx = Arc::clone(ctx);
    let file = file.clone();
    let span = tracing::info_span!("download", file = %file.name);
    tokio::spawn(async move { download_file(ctx, file, entry, op).await }.instrument(span));
}

async fn download_file(ctx: Arc<PeerContext>, file: FileEntry, entry: Arc<DownloadEntry>, op: FileOp) {

    tracing::info!(
        "fetching {} pieces from {} source(s)",
        entry.num_pieces,
        file.sources.len(),
    );

    // Nested names may arrive before their directory entry.
    if let Some(parent) = ctx.dir.join(&file.name).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("cannot create parent directory: {}", e);
        }
    }

    for ip in file.sources.iter().filter(|s| !s.is_empty()) {
        let span = tracing::info_span!("worker", source = %ip);
        tokio::spawn(
            source_worker(Arc::clone(&ctx), Arc::clone(&entry), ip.clone()).instrument(span),
        );
    }

    if !entry.wait_complete().await {
        tracing::info!("download cancelled");
        remove_parts(&ctx.dir, &file.name, entry.num_pieces);
        Arc::clone(&ctx.interlock).unblock_after(file.name.clone(), op, MONITOR_POLL_INTERVAL);
        return;
    }

    match reassemble(&ctx.dir, &file.name, entry.num_pieces) {
        Ok(()) => {
            let path = ctx.dir.join(&file.name);
            // Pin the mtime to the tracker's timestamp so the next
            // monitor pass does not see the download as a local edit.
            let mtime = FileTime::from_unix_time(file.timestamp as i64, 0);
            if let Err(e) = filetime::set_file_mtime(&path, mtime) {
                tracing::warn!("cannot set mtime: {}", e);
            }

            match FileEntry::create(&file.name, &ctx.dir, &ctx.ip) {
                Ok(mut local) => {
                    local.timestamp = file.timestamp;
                    if !ctx.filetable.update(&file.name, &local) {
                        ctx.filetable.append(local);
                    }
                    ctx.mark_dirty();
                }
                Err(e) => tracing::warn!("cannot stat finished download: {}", e),
            }

            ctx.downloads.remove_by_file_name(&file.name);
            tracing::info!("download complete");
        }
        Err(e) => {
            // The entry stays in the table; the local table is untouched.
            tracing::error!("reassembly failed: {}", e);
        }
    }

    Arc::clone(&ctx.interlock).unblock_after(file.name.clone(), op, MONITOR_POLL_INTERVAL);
}

// Pulls unclaimed pieces from one source until the pool drains or the
// download is cancelled. A piece is re-queued on any send or receive
// failure; two consecutive send failures give the connection up.
async fn source_worker(ctx: Arc<PeerContext>, entry: Arc<DownloadEntry>, ip: String) {

    let stream = match TcpStream::connect((ip.as_str(), ctx.p2p_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("cannot reach source: {}", e);
            return;
        }
    };
    let (mut rd, wr) = stream.into_split();
    let mut requests = FramedWrite::new(wr, PieceRequestCodec);
    let mut send_failed = false;

    while let Some(piece) = entry.get_unclaimed_piece() {

        let request = PieceRequest {
            file_name: entry.file_name.clone(),
            start: piece.start,
            size: piece.size,
            piece_num: piece.piece_num,
        };
        tracing::trace!("requesting piece {} ({} bytes)", piece.piece_num, piece.size);

        if let Err(e) = requests.send(request).await {
            tracing::warn!("request send failed: {}", e);
            entry.readd_piece(piece.piece_num);
            if send_failed {
                break;
            }
            send_failed = true;
            continue;
        }
        send_failed = false;

        let mut data = vec![0u8; piece.size as usize];
        if let Err(e) = rd.read_exact(&mut data).await {
            tracing::warn!("piece {} receive failed: {}", piece.piece_num, e);
            entry.readd_piece(piece.piece_num);
            continue;
        }

        let part = part_path(&ctx.dir, &entry.file_name, piece.piece_num);
        if let Err(e) = std::fs::write(&part, &data) {
            tracing::error!("cannot write {:?}: {}", part, e);
            entry.readd_piece(piece.piece_num);
            continue;
        }

        entry.mark_done(piece.piece_num);
        tracing::trace!("piece {} done", piece.piece_num);
    }

    requests.send(PieceRequest::sentinel()).await.ok();
}

pub(crate) fn part_path(dir: &Path, name: &str, piece_num: u32) -> PathBuf {
    dir.join(format!("{}.part.{}", name, piece_num))
}

// Concatenates `<name>.part.0 .. .part.{n-1}` into `<name>` and removes
// the temp files.
fn reassemble(dir: &Path, name: &str, num_pieces: u32) -> std::io::Result<()> {
    let mut out = std::fs::File::create(dir.join(name))?;
    for i in 0..num_pieces {
        let mut part = std::fs::File::open(part_path(dir, name, i))?;
        std::io::copy(&mut part, &mut out)?;
    }
    remove_parts(dir, name, num_pieces);
    Ok(())
}

fn remove_parts(dir: &Path, name: &str, num_pieces: u32) {
    for i in 0..num_pieces {
        std::fs::remove_file(part_path(dir, name, i)).ok();
    }
}
