use tokio_util::sync::CancellationToken;
use dartsync::tracker::{Tracker, TrackerConfig};

#[tokio::main]
async fn main() {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let cancel = CancellationToken::new();
    let tracker = Tracker::new(TrackerConfig::default(), cancel.clone());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            signal_cancel.cancel();
        }
    });

    if let Err(e) = tracker.run().await {
        tracing::error!("tracker failed: {}", e);
        std::process::exit(1);
    }
}
