use std::sync::Arc;
use futures::StreamExt;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::FramedRead;
use tracing::Instrument;
use super::{is_clean_name, PeerContext, Result};
use crate::wire::PieceRequestCodec;

// Accepts P2P connections and serves pieces until cancellation. One
// upload task per accepted connection.
#[tracing::instrument(name = "p2p", skip_all)]
pub async fn run_listener(ctx: Arc<PeerContext>) -> Result<()> {

    let listener = TcpListener::bind(("0.0.0.0", ctx.p2p_port)).await?;
    tracing::info!("serving pieces on {}", listener.local_addr()?);

    loop {
        tokio::select! {

            _ = ctx.cancel.cancelled() => break,

            conn = listener.accept() => {
                let (stream, address) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("inbound peer connection error: {}", e);
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                let span = tracing::info_span!("upload", peer = %address);
                tokio::spawn(async move {
                    if let Err(e) = upload(ctx, stream).await {
                        tracing::warn!("upload ended: {}", e);
                    }
                }.instrument(span));
            }
        }
    }

    Ok(())
}

// Serves piece requests on one connection. Exits when the downloader
// closes the stream or sends the sentinel request.
async fn upload(ctx: Arc<PeerContext>, stream: TcpStream) -> Result<()> {

    let (rd, mut wr) = stream.into_split();
    let mut requests = FramedRead::new(rd, PieceRequestCodec);

    while let Some(request) = requests.next().await {
        let request = request?;
        if request.is_sentinel() {
            tracing::trace!("end of stream");
            break;
        }
        if !is_clean_name(&request.file_name) || request.size as u64 > ctx.piece_len {
            tracing::warn!("rejecting bad request for {:?}", request.file_name);
            break;
        }
        tracing::trace!(
            "piece {} of {} requested ({} bytes at {})",
            request.piece_num,
            request.file_name,
            request.size,
            request.start,
        );

        let mut file = tokio::fs::File::open(ctx.dir.join(&request.file_name)).await?;
        file.seek(SeekFrom::Start(request.start)).await?;
        let mut data = vec![0u8; request.size as usize];
        file.read_exact(&mut data).await?;

        // The reply is exactly `size` raw bytes, no framing header.
        wr.write_all(&data).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::Path, time::Duration};
    use futures::SinkExt;
    use tokio_util::{codec::FramedWrite, sync::CancellationToken};
    use crate::wire::PieceRequest;

    fn test_ctx(dir: &Path, p2p_port: u16) -> Arc<PeerContext> {
        let (session_tx, _session_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(PeerContext::new(
            dir.to_path_buf(),
            "127.0.0.1".to_string(),
            p2p_port,
            256,
            Duration::from_secs(10),
            session_tx,
            CancellationToken::new(),
        ))
    }

    async fn connect(ctx: &Arc<PeerContext>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            upload(serve_ctx, stream).await.ok();
        });
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_upload_serves_requested_ranges() {
        let tmp = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        std::fs::write(tmp.path().join("data.bin"), &data).unwrap();

        let ctx = test_ctx(tmp.path(), 0);
        let stream = connect(&ctx).await;
        let (mut rd, wr) = stream.into_split();
        let mut requests = FramedWrite::new(wr, PieceRequestCodec);

        // Same connection reused for several pieces, out of order.
        for (start, size, piece_num) in [(256u64, 256u32, 1u32), (0, 256, 0), (512, 88, 2)] {
            requests
                .send(PieceRequest {
                    file_name: "data.bin".to_string(),
                    start,
                    size,
                    piece_num,
                })
                .await
                .unwrap();
            let mut body = vec![0u8; size as usize];
            rd.read_exact(&mut body).await.unwrap();
            assert_eq!(body, data[start as usize..start as usize + size as usize]);
        }

        requests.send(PieceRequest::sentinel()).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_closes_on_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path(), 0);
        let stream = connect(&ctx).await;
        let (mut rd, wr) = stream.into_split();
        let mut requests = FramedWrite::new(wr, PieceRequestCodec);

        requests
            .send(PieceRequest {
                file_name: "../../etc/shadow".to_string(),
                start: 0,
                size: 16,
                piece_num: 0,
            })
            .await
            .unwrap();

        // The uploader drops the connection without replying.
        let mut body = [0u8; 1];
        assert!(rd.read_exact(&mut body).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_missing_file_closes_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path(), 0);
        let stream = connect(&ctx).await;
        let (mut rd, wr) = stream.into_split();
        let mut requests = FramedWrite::new(wr, PieceRequestCodec);

        requests
            .send(PieceRequest {
                file_name: "missing.bin".to_string(),
                start: 0,
                size: 16,
                piece_num: 0,
            })
            .await
            .unwrap();

        let mut body = [0u8; 1];
        assert!(rd.read_exact(&mut body).await.is_err());
    }
}
