use super::stream::{ProxyReader, ProxyWriter};
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Server-side SOCKS4 handshake. The version byte has already been
/// consumed by the dispatcher.
pub(crate) async fn parse<R, W>(
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    ctx: &HandshakeCtx<'_>,
) -> Result<Target>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let command = reader.read_u8().await?;
    if command != 0x01 {
        return Err(PolyProxyError::Malformed(format!(
            "unsupported SOCKS4 command 0x{:02x}",
            command
        )));
    }
    let port_bytes = reader.read_n(2).await?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    let ip = reader.read_n(4).await?;
    let userid = reader.read_until(b"\x00").await?;
    let userid = &userid[..userid.len() - 1];

    if !ctx.auth.is_empty() {
        if ctx.auth != userid && !ctx.auth_table.authed() {
            return Err(PolyProxyError::Unauthorized(
                "SOCKS4 userid mismatch".to_string(),
            ));
        }
        ctx.auth_table.set_authed();
    }

    let mut reply = Vec::with_capacity(8);
    reply.extend_from_slice(&[0x00, 0x5a]);
    reply.extend_from_slice(&port_bytes);
    reply.extend_from_slice(&ip);
    writer.write(&reply).await?;
    writer.drain().await?;

    let host = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]).to_string();
    debug!("SOCKS4 request for {}:{}", host, port);
    Ok(Target::new(host, port))
}

/// Client-side SOCKS4 connect. The protocol carries raw IPv4 only, so the
/// destination is resolved here before the request is framed.
pub(crate) async fn connect<R, W>(
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    rauth: &[u8],
    host: &str,
    port: u16,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ip = resolve_ipv4(host, port).await?;

    let mut buf = Vec::with_capacity(9 + rauth.len());
    buf.extend_from_slice(&[0x04, 0x01]);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&ip.octets());
    buf.extend_from_slice(rauth);
    buf.push(0x00);
    writer.write(&buf).await?;
    writer.drain().await?;

    let head = reader.read_n(2).await?;
    if head[..] != [0x00, 0x5a] {
        return Err(PolyProxyError::Malformed(format!(
            "upstream rejected SOCKS4 connect: {:02x?}",
            &head[..]
        )));
    }
    reader.read_n(6).await?;
    Ok(())
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, port))
        .await?
        .find_map(|sockaddr| match sockaddr {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            std::net::SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            PolyProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "SOCKS4 destination has no IPv4 address",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::handshake_pair;

    #[tokio::test]
    async fn userid_auth_accepts_configured_user() {
        let mut wire = vec![0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4];
        wire.extend_from_slice(b"user\x00");

        let (mut reader, mut writer, replies, ctx) = handshake_pair(&wire, b"user").await;
        assert_eq!(reader.read_u8().await.unwrap(), 0x04);

        let target = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap();
        assert_eq!(target.host, "1.2.3.4");
        assert_eq!(target.port, 80);
        assert!(target.residual.is_empty());
        assert!(ctx.table.authed());

        assert_eq!(
            replies.collect(writer).await,
            vec![0x00, 0x5a, 0x00, 0x50, 1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn userid_auth_rejects_unknown_user() {
        let mut wire = vec![0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4];
        wire.extend_from_slice(b"nobody\x00");

        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&wire, b"user").await;
        assert_eq!(reader.read_u8().await.unwrap(), 0x04);

        let err = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap_err();
        assert!(matches!(err, PolyProxyError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn previously_authed_peer_skips_userid_check() {
        let mut wire = vec![0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4];
        wire.extend_from_slice(b"nobody\x00");

        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&wire, b"user").await;
        ctx.table.set_authed();
        assert_eq!(reader.read_u8().await.unwrap(), 0x04);

        let target = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap();
        assert_eq!(target.host, "1.2.3.4");
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let wire = vec![0x04, 0x02, 0x00, 0x50, 1, 2, 3, 4, 0x00];

        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&wire, b"").await;
        assert_eq!(reader.read_u8().await.unwrap(), 0x04);

        let err = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap_err();
        assert!(matches!(err, PolyProxyError::Malformed(_)));
    }
}
