use crate::protocol::{HttpRewriter, ProxyReader, ProxyWriter};
use crate::server::stats::TrafficStats;
use crate::utils::error::{PolyProxyError, Result};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

fn is_connection_closed(err: &PolyProxyError) -> bool {
    matches!(
        err,
        PolyProxyError::Io(io) if matches!(
            io.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::NotConnected
                | ErrorKind::UnexpectedEof
        )
    )
}

/// Relay bytes in both directions until either side closes. The forward
/// direction optionally rewrites HTTP request lines in flight.
pub async fn relay<CR, CW, RR, RW>(
    client_reader: ProxyReader<CR>,
    client_writer: ProxyWriter<CW>,
    remote_reader: ProxyReader<RR>,
    remote_writer: ProxyWriter<RW>,
    stats: Arc<TrafficStats>,
    rewrite_requests: bool,
    conn_id: Uuid,
) -> Result<()>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    RR: AsyncRead + Unpin + Send + 'static,
    RW: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let rewriter = rewrite_requests.then(HttpRewriter::new);

    let upload = tokio::spawn(channel(
        client_reader,
        remote_writer,
        stats.clone(),
        cancel.clone(),
        rewriter,
        conn_id,
        "upload",
    ));
    let download = tokio::spawn(channel(
        remote_reader,
        client_writer,
        stats,
        cancel,
        None,
        conn_id,
        "download",
    ));

    let (up, down) = tokio::join!(upload, download);
    for side in [up, down] {
        side.map_err(|e| {
            PolyProxyError::Io(std::io::Error::other(format!("relay task join error: {e}")))
        })?;
    }
    debug!(conn = %conn_id, "relay finished");
    Ok(())
}

/// One relay direction: read whatever is available and forward it,
/// counting bytes. Errors terminate only this direction; the cancellation
/// token tears the sibling down.
async fn channel<R, W>(
    mut reader: ProxyReader<R>,
    mut writer: ProxyWriter<W>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
    mut rewriter: Option<HttpRewriter>,
    conn_id: Uuid,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    stats.channel_opened();
    let result = async {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(conn = %conn_id, direction, "relay cancelled");
                    return Ok(());
                }
                read = reader.read_some() => read?,
            };
            if data.is_empty() {
                trace!(conn = %conn_id, direction, "relay reached EOF");
                return Ok(());
            }
            let data = match &mut rewriter {
                Some(rewriter) => rewriter.feed(&data),
                None => data,
            };
            if data.is_empty() {
                continue;
            }
            stats.add_bytes(data.len() as u64);
            writer.write(&data).await?;
            writer.drain().await?;
        }
    }
    .await;

    if let Err(err) = result {
        if is_connection_closed(&err) {
            trace!(conn = %conn_id, direction, "peer closed mid-relay");
        } else {
            debug!(conn = %conn_id, direction, error = %err, "relay error");
        }
    }
    stats.channel_closed();
    cancel.cancel();
    let _ = writer.close().await;
}

/// Loop client bytes straight back to the client (echo target).
pub async fn echo<R, W>(
    mut reader: ProxyReader<R>,
    mut writer: ProxyWriter<W>,
    stats: Arc<TrafficStats>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    stats.channel_opened();
    let result = async {
        loop {
            let data = reader.read_some().await?;
            if data.is_empty() {
                return Ok::<(), PolyProxyError>(());
            }
            stats.add_bytes(data.len() as u64);
            writer.write(&data).await?;
            writer.drain().await?;
        }
    }
    .await;
    stats.channel_closed();
    let _ = writer.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relay_moves_bytes_both_ways_and_counts() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (mut origin, remote) = tokio::io::duplex(1024);

        let (server_r, server_w) = tokio::io::split(server);
        let (remote_r, remote_w) = tokio::io::split(remote);
        let stats = Arc::new(TrafficStats::new());

        let handle = tokio::spawn(relay(
            ProxyReader::new(server_r),
            ProxyWriter::new(server_w),
            ProxyReader::new(remote_r),
            ProxyWriter::new(remote_w),
            stats.clone(),
            false,
            Uuid::new_v4(),
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        handle.await.unwrap().unwrap();
        assert!(stats.bytes() >= 8);
        assert_eq!(stats.active_channels(), 0);
        assert_eq!(stats.total_channels(), 2);
    }

    #[tokio::test]
    async fn rewriting_relay_reframes_forwarded_requests() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (mut origin, remote) = tokio::io::duplex(1024);

        let (server_r, server_w) = tokio::io::split(server);
        let (remote_r, remote_w) = tokio::io::split(remote);

        let handle = tokio::spawn(relay(
            ProxyReader::new(server_r),
            ProxyWriter::new(server_w),
            ProxyReader::new(remote_r),
            ProxyWriter::new(remote_w),
            Arc::new(TrafficStats::new()),
            true,
            Uuid::new_v4(),
        ));

        client
            .write_all(b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut forwarded = Vec::new();
        origin.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(
            forwarded,
            b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
        );

        drop(origin);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn echo_loops_bytes_back() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (server_r, server_w) = tokio::io::split(server);
        let stats = Arc::new(TrafficStats::new());

        let handle = tokio::spawn(echo(
            ProxyReader::new(server_r),
            ProxyWriter::new(server_w),
            stats.clone(),
        ));

        client.write_all(b"marco").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"marco");

        client.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(stats.bytes(), 5);
    }
}
