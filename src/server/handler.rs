use crate::auth::AuthKeeper;
use crate::protocol::{
    dispatch, HandshakeCtx, Proto, ProxyReader, ProxyWriter, SockInfo, StaticBody, Target,
};
use crate::server::relay;
use crate::server::resolver::resolve;
use crate::server::stats::TrafficStats;
use crate::utils::error::{PolyProxyError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state handed to every accepted connection.
pub struct ClientCtx {
    pub protos: Arc<Vec<Proto>>,
    pub auth: Bytes,
    pub auth_keeper: Arc<AuthKeeper>,
    pub http_get: Arc<HashMap<String, StaticBody>>,
    pub upstream: Option<Arc<Upstream>>,
    pub stats: Arc<TrafficStats>,
}

/// Next proxy hop: every outbound connection is chained through it using
/// the handler's client-side connect.
pub struct Upstream {
    pub proto: Proto,
    pub host: String,
    pub port: u16,
    pub auth: Bytes,
}

pub async fn handle_client(
    stream: TcpStream,
    ctx: Arc<ClientCtx>,
    peer: SocketAddr,
) -> Result<()> {
    let conn_id = Uuid::new_v4();
    let sock = SockInfo::from_stream(&stream)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = ProxyReader::new(read_half);
    let mut writer = ProxyWriter::new(write_half);

    let auth_table = ctx.auth_keeper.table(peer.ip());
    let handshake = HandshakeCtx {
        auth: &ctx.auth,
        auth_table: &auth_table,
        reader_cipher: None,
        http_get: &ctx.http_get,
        sock: &sock,
    };

    let (proto, target) = dispatch(&ctx.protos, &mut reader, &mut writer, &handshake).await?;
    info!(
        conn = %conn_id,
        proto = proto.name(),
        peer = %peer,
        dest = %target,
        "handshake complete"
    );

    if target.is_echo() {
        return relay::echo(reader, writer, ctx.stats.clone()).await;
    }

    // HTTP forward-proxy sessions keep rewriting request lines in flight
    let rewrite = matches!(proto, Proto::Http) && !target.residual.is_empty();

    let remote = dial_remote(&ctx, &target).await?;
    if let Err(err) = remote.set_nodelay(true) {
        warn!(conn = %conn_id, "failed to set TCP_NODELAY on remote socket: {}", err);
    }
    let (remote_read, remote_write) = remote.into_split();
    let mut remote_reader = ProxyReader::new(remote_read);
    let mut remote_writer = ProxyWriter::new(remote_write);

    if let Some(upstream) = &ctx.upstream {
        upstream
            .proto
            .connect(
                &mut remote_reader,
                &mut remote_writer,
                &upstream.auth,
                &target.host,
                target.port,
                None,
            )
            .await?;
        debug!(conn = %conn_id, upstream = upstream.proto.name(), "upstream connect complete");
    }

    if !target.residual.is_empty() {
        remote_writer.write(&target.residual).await?;
        remote_writer.drain().await?;
    }

    relay::relay(
        reader,
        writer,
        remote_reader,
        remote_writer,
        ctx.stats.clone(),
        rewrite,
        conn_id,
    )
    .await
}

async fn dial_remote(ctx: &ClientCtx, target: &Target) -> Result<TcpStream> {
    let (host, port) = match &ctx.upstream {
        Some(upstream) => (upstream.host.as_str(), upstream.port),
        None => {
            if target.is_tunnel_placeholder() {
                return Err(PolyProxyError::Unsupported(
                    "tunnel destination requires an upstream proxy".to_string(),
                ));
            }
            (target.host.as_str(), target.port)
        }
    };

    let candidates = resolve(host, port).await?;
    let mut last_err: Option<std::io::Error> = None;
    for candidate in candidates {
        debug!("attempting remote connection to {}", candidate);
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(PolyProxyError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::other("no reachable remote addresses")
    })))
}
