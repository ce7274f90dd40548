use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;
use crate::{
    table::FileTable,
    wire::{PeerPacket, PeerSideCodec},
};
use super::{reconcile, PeerContext, PeerError, Result, SessionCommand, SessionRx};

// The peer's end of the persistent control stream. One task owns the
// socket: inbound TRACKER_SYNCs drive reconciliation, commands from the
// monitor push FILE_UPDATEs, and a ticker sends KEEP_ALIVEs. Sharing the
// stream keeps heartbeats ordered with file updates, so the tracker's
// view of our liveness never lags its view of our files.
pub struct TrackerSession {
    ctx: Arc<PeerContext>,
    socket: Framed<TcpStream, PeerSideCodec>,
    rx: SessionRx,
}

impl TrackerSession {

    pub fn new(ctx: Arc<PeerContext>, socket: Framed<TcpStream, PeerSideCodec>, rx: SessionRx) -> Self {
        TrackerSession { ctx, socket, rx }
    }

    // Runs until shutdown. A broken control stream is fatal: the error
    // propagates and the peer exits, there is no reconnect.
    #[tracing::instrument(name = "session", skip_all)]
    pub async fn run(self) -> Result<()> {

        let TrackerSession { ctx, socket, mut rx } = self;
        let (mut sink, mut stream) = socket.split();
        let mut heartbeat = time::interval(ctx.heartbeat_interval);

        loop {
            tokio::select! {

                pkt = stream.next() => match pkt {
                    Some(Ok(pkt)) => {
                        tracing::info!("tracker sync with {} entries", pkt.entries.len());
                        let tracker_table = FileTable::from_entries(pkt.entries);
                        tracker_table.print();
                        reconcile::run(&ctx, &tracker_table).await;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(PeerError::TrackerClosed),
                },

                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::PushTable) => {
                        let entries = ctx.filetable.entries();
                        tracing::info!("sending file update with {} entries", entries.len());
                        sink.send(PeerPacket::file_update(&ctx.ip, entries)).await?;
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },

                _ = heartbeat.tick() => {
                    tracing::trace!("keep alive");
                    sink.send(PeerPacket::keep_alive(&ctx.ip)).await?;
                }

                _ = ctx.cancel.cancelled() => break,
            }
        }

        tracing::info!("session closed");
        Ok(())
    }
}
