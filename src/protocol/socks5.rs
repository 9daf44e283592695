use super::addr;
use super::stream::{ProxyReader, ProxyWriter};
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use bytes::Bytes;
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Server-side SOCKS5 handshake (RFC 1928 / RFC 1929), CONNECT only.
/// The version byte has already been consumed by the dispatcher.
pub(crate) async fn parse<R, W>(
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    ctx: &HandshakeCtx<'_>,
) -> Result<Target>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nmethods = reader.read_u8().await? as usize;
    let methods = reader.read_n(nmethods).await?;
    trace!("SOCKS5 greeting offered {} methods", methods.len());

    if !ctx.auth.is_empty() && (!methods.contains(&0x00) || !ctx.auth_table.authed()) {
        writer.write(&[0x05, 0x02]).await?;
        writer.drain().await?;

        let sub_version = reader.read_u8().await?;
        if sub_version != 0x01 {
            return Err(PolyProxyError::Malformed(format!(
                "unknown SOCKS5 auth sub-negotiation version 0x{:02x}",
                sub_version
            )));
        }
        let user_len = reader.read_u8().await? as usize;
        let user = reader.read_n(user_len).await?;
        let pass_len = reader.read_u8().await? as usize;
        let pass = reader.read_n(pass_len).await?;

        let mut presented: SmallVec<[u8; 64]> = SmallVec::new();
        presented.extend_from_slice(&user);
        presented.push(b':');
        presented.extend_from_slice(&pass);
        if presented[..] != *ctx.auth {
            return Err(PolyProxyError::Unauthorized(
                "SOCKS5 username/password mismatch".to_string(),
            ));
        }
        writer.write(&[0x01, 0x00]).await?;
    } else {
        writer.write(&[0x05, 0x00]).await?;
    }
    writer.drain().await?;
    if !ctx.auth.is_empty() {
        ctx.auth_table.set_authed();
    }

    let request = reader.read_n(3).await?;
    if request[..] != [0x05, 0x01, 0x00] {
        return Err(PolyProxyError::Malformed(format!(
            "unexpected SOCKS5 request prefix {:02x?}",
            &request[..]
        )));
    }

    let atyp = reader.read_u8().await?;
    let (host, port, raw) = addr::read_address(reader, atyp).await?;

    // reply echoes the address exactly as the client framed it
    let mut reply = Vec::with_capacity(4 + raw.len());
    reply.extend_from_slice(&[0x05, 0x00, 0x00, atyp]);
    reply.extend_from_slice(&raw);
    writer.write(&reply).await?;
    writer.drain().await?;

    debug!("SOCKS5 request for {}:{}", host, port);
    Ok(Target::new(host, port))
}

/// Client-side SOCKS5 connect. Greeting, optional sub-negotiation and the
/// CONNECT request are pipelined into a single write.
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
    let mut buf = Vec::with_capacity(16 + rauth.len() + host.len());
    if rauth.is_empty() {
        buf.extend_from_slice(&[0x05, 0x01, 0x00]);
    } else {
        buf.extend_from_slice(&[0x05, 0x01, 0x02, 0x01]);
        let mut parts = rauth.splitn(2, |b| *b == b':');
        for part in &mut parts {
            buf.push(part.len().min(255) as u8);
            buf.extend_from_slice(&part[..part.len().min(255)]);
        }
    }
    buf.extend_from_slice(&[0x05, 0x01, 0x00]);
    buf.extend_from_slice(&addr::encode_address(host, port));
    writer.write(&buf).await?;
    writer.drain().await?;

    let choice = reader.read_n(2).await?;
    match choice[1] {
        0x00 => {}
        0x02 => {
            let status = reader.read_n(2).await?;
            if status[1] != 0x00 {
                return Err(PolyProxyError::Unauthorized(
                    "upstream rejected SOCKS5 credentials".to_string(),
                ));
            }
        }
        method => {
            return Err(PolyProxyError::Malformed(format!(
                "upstream chose unsupported SOCKS5 method 0x{:02x}",
                method
            )));
        }
    }

    let reply = reader.read_n(3).await?;
    if reply[1] != 0x00 {
        return Err(PolyProxyError::Malformed(format!(
            "upstream SOCKS5 connect failed with code 0x{:02x}",
            reply[1]
        )));
    }
    let atyp = reader.read_u8().await?;
    let skip = match atyp {
        0x01 => 6,
        0x04 => 18,
        0x03 => reader.read_u8().await? as usize + 2,
        n => {
            return Err(PolyProxyError::Malformed(format!(
                "unknown address type 0x{:02x} in upstream reply",
                n
            )));
        }
    };
    reader.read_n(skip).await?;
    Ok(())
}

/// SOCKS5 UDP request header: `00 00 00 || addr`, no fragmentation.
pub(crate) fn udp_parse(data: &[u8]) -> Option<Target> {
    let rest = data.strip_prefix(&[0x00, 0x00, 0x00][..])?;
    let (host, port, consumed) = addr::decode_datagram_address(rest)?;
    Some(Target::with_residual(
        host,
        port,
        Bytes::copy_from_slice(&rest[consumed..]),
    ))
}

pub(crate) fn udp_connect(host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + host.len() + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    out.extend_from_slice(&addr::encode_address(host, port));
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::handshake_pair;

    #[tokio::test]
    async fn no_auth_connect_to_example_com() {
        let mut wire = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 0x0b];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&[0x00, 0x50]);

        let (mut reader, mut writer, replies, ctx) = handshake_pair(&wire, b"").await;
        // dispatcher consumes the version byte before delegating
        assert_eq!(reader.read_u8().await.unwrap(), 0x05);

        let target = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert!(target.residual.is_empty());

        let mut expected = vec![0x05, 0x00, 0x05, 0x00, 0x00, 0x03, 0x0b];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(replies.collect(writer).await, expected);
    }

    #[tokio::test]
    async fn userpass_subnegotiation_accepts_configured_credential() {
        let mut wire = vec![0x05, 0x01, 0x02];
        wire.extend_from_slice(&[0x01, 0x01, b'u', 0x01, b'p']);
        wire.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x1f, 0x90]);

        let (mut reader, mut writer, replies, ctx) = handshake_pair(&wire, b"u:p").await;
        assert_eq!(reader.read_u8().await.unwrap(), 0x05);

        let target = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap();
        assert_eq!(target.host, "1.2.3.4");
        assert_eq!(target.port, 8080);
        assert!(ctx.table.authed());

        let bytes = replies.collect(writer).await;
        assert_eq!(&bytes[..4], &[0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn userpass_subnegotiation_rejects_bad_credential() {
        let mut wire = vec![0x05, 0x01, 0x02];
        wire.extend_from_slice(&[0x01, 0x01, b'u', 0x01, b'x']);

        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&wire, b"u:p").await;
        assert_eq!(reader.read_u8().await.unwrap(), 0x05);

        let err = parse(&mut reader, &mut writer, &ctx.handshake()).await.unwrap_err();
        assert!(matches!(err, PolyProxyError::Unauthorized(_)));
        assert!(!ctx.table.authed());
    }

    #[test]
    fn udp_request_parses_and_wraps() {
        let mut datagram = vec![0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        datagram.extend_from_slice(b"query");
        let target = udp_parse(&datagram).unwrap();
        assert_eq!(target.host, "8.8.8.8");
        assert_eq!(target.port, 53);
        assert_eq!(&target.residual[..], b"query");

        let reply = udp_connect("8.8.8.8", 53, b"answer");
        assert_eq!(&reply[..4], &[0x00, 0x00, 0x00, 0x03]);
        assert!(reply.ends_with(b"answer"));

        assert!(udp_parse(&[0x00, 0x01, 0x00, 0x01]).is_none());
    }
}
