use std::{sync::Arc, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken};
use dartsync::{
    config::Config,
    peer::{
        monitor, reconcile, session::TrackerSession, upload,
        PeerContext, PeerError, Result, SessionCommand,
    },
    table::FileTable,
    wire::{PeerPacket, PeerSideCodec},
    MONITOR_POLL_INTERVAL, P2P_PORT,
};

#[tokio::main]
async fn main() {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let config = match Config::load("config") {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("syncing {:?} via tracker {}", config.directory, config.tracker_addr);

    if let Err(e) = run(config).await {
        tracing::error!("peer failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {

    // The control stream is established once; losing it later is fatal.
    let stream = TcpStream::connect(config.tracker_addr).await?;
    let ip = stream.local_addr()?.ip().to_string();
    let mut socket = Framed::new(stream, PeerSideCodec);

    socket.send(PeerPacket::register(&ip, P2P_PORT)).await?;
    tracing::info!("registered with tracker as {}", ip);

    // The first TRACKER_SYNC carries the piece size and heartbeat
    // interval; nothing can run before it arrives.
    let first = match socket.next().await {
        Some(pkt) => pkt?,
        None => return Err(PeerError::TrackerClosed),
    };
    tracing::info!(
        "synced: heartbeat {}s, piece len {}, {} entries",
        first.heartbeat_interval,
        first.piece_len,
        first.entries.len(),
    );

    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let ctx = Arc::new(PeerContext::new(
        config.directory,
        ip,
        P2P_PORT,
        first.piece_len.max(1) as u64,
        Duration::from_secs(first.heartbeat_interval.max(1) as u64),
        session_tx.clone(),
        cancel.clone(),
    ));

    // Seed the local table, then reconcile against the table that came
    // with the sync.
    if let Err(e) = ctx.load_local_table() {
        tracing::warn!("initial scan failed: {}", e);
    }
    reconcile::first_sync(&ctx, &FileTable::from_entries(first.entries)).await;

    let upload_handle = tokio::spawn(upload::run_listener(Arc::clone(&ctx)));
    let alerts: Arc<dyn monitor::FileAlerts> = ctx.clone() as Arc<dyn monitor::FileAlerts>;
    let monitor_handle = monitor::spawn(
        ctx.dir.clone(),
        Arc::clone(&ctx.interlock),
        alerts,
        MONITOR_POLL_INTERVAL,
        cancel.clone(),
    );
    let mut session_handle = tokio::spawn(TrackerSession::new(Arc::clone(&ctx), socket, session_rx).run());

    let session_result = tokio::select! {

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            session_tx.send(SessionCommand::Shutdown).ok();
            cancel.cancel();
            session_handle.await
        }

        res = &mut session_handle => {
            cancel.cancel();
            res
        }
    };

    if let Err(e) = monitor_handle.await {
        tracing::warn!("monitor task failed: {}", e);
    }
    match upload_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("p2p listener failed: {}", e),
        Err(e) => tracing::warn!("p2p listener task failed: {}", e),
    }

    match session_result {
        Ok(res) => res,
        Err(e) => Err(PeerError::Channel(e.to_string())),
    }
}
