use super::addr;
use super::stream::{ProxyReader, ProxyWriter};
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use tokio::io::{AsyncRead, AsyncWrite};

/// Server-side ShadowsocksR handshake: optional auth prefix, then a plain
/// SOCKS-style address. No one-time-auth variant exists here.
pub(crate) async fn parse<R>(
    first: u8,
    reader: &mut ProxyReader<R>,
    ctx: &HandshakeCtx<'_>,
) -> Result<Target>
where
    R: AsyncRead + Unpin,
{
    let mut atyp = first;
    if !ctx.auth.is_empty() {
        let rest = reader.read_n(ctx.auth.len() - 1).await?;
        if first != ctx.auth[0] || rest[..] != ctx.auth[1..] {
            return Err(PolyProxyError::Unauthorized(
                "shadowsocksr auth prefix mismatch".to_string(),
            ));
        }
        ctx.auth_table.set_authed();
        atyp = reader.read_u8().await?;
    }
    let (host, port, _raw) = addr::read_address(reader, atyp).await?;
    Ok(Target::new(host, port))
}

/// Client-side connect: credential prefix followed by the domain-form
/// address header.
pub(crate) async fn connect<W>(
    writer: &mut ProxyWriter<W>,
    rauth: &[u8],
    host: &str,
    port: u16,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(rauth.len() + 4 + host.len());
    buf.extend_from_slice(rauth);
    buf.extend_from_slice(&addr::encode_address(host, port));
    writer.write(&buf).await?;
    writer.drain().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::handshake_pair;

    #[tokio::test]
    async fn plain_address_parses() {
        let mut wire = vec![0x03, 0x0b];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&[0x01, 0xbb]);

        let (mut reader, _writer, _replies, ctx) = handshake_pair(&wire, b"").await;
        let first = reader.read_u8().await.unwrap();

        let target = parse(first, &mut reader, &ctx.handshake()).await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn auth_prefix_must_match_in_full() {
        let mut wire = b"key".to_vec();
        wire.extend_from_slice(&[0x01, 1, 2, 3, 4, 0x00, 0x50]);

        let (mut reader, _writer, _replies, ctx) = handshake_pair(&wire, b"kex").await;
        let first = reader.read_u8().await.unwrap();

        let err = parse(first, &mut reader, &ctx.handshake()).await.unwrap_err();
        assert!(matches!(err, PolyProxyError::Unauthorized(_)));
    }
}
