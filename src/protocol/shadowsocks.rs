use super::addr;
use super::cipher::CipherView;
use super::stream::{ProxyReader, ProxyWriter, StreamDecoder, StreamEncoder};
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use bytes::{Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Truncated digest length used by one-time-auth throughout.
const OTA_TAG_LEN: usize = 10;

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC-SHA1 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn chunk_key(iv: &[u8], chunk_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(iv.len() + 4);
    key.extend_from_slice(iv);
    key.extend_from_slice(&chunk_id.to_be_bytes());
    key
}

/// Server-side Shadowsocks handshake. `first` is the byte the dispatcher
/// consumed: either the leading auth-prefix byte or the address type.
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
                "shadowsocks auth prefix mismatch".to_string(),
            ));
        }
        ctx.auth_table.set_authed();
        atyp = reader.read_u8().await?;
    }

    let ota = atyp & addr::OTA_FLAG != 0;
    let (host, port, raw) = addr::read_address(reader, atyp).await?;

    if !ota {
        if let Some(cipher) = ctx.reader_cipher {
            if cipher.ota {
                return Err(PolyProxyError::Malformed(
                    "client must negotiate one-time-auth".to_string(),
                ));
            }
        }
    }
    if ota {
        if let Some(cipher) = ctx.reader_cipher {
            let mut keyed = Vec::with_capacity(cipher.iv.len() + cipher.key.len());
            keyed.extend_from_slice(&cipher.iv);
            keyed.extend_from_slice(&cipher.key);
            let mut message = Vec::with_capacity(1 + raw.len());
            message.push(atyp);
            message.extend_from_slice(&raw);
            let expected = hmac_sha1(&keyed, &message);
            let presented = reader.read_n(OTA_TAG_LEN).await?;
            if presented[..] != expected[..OTA_TAG_LEN] {
                return Err(PolyProxyError::Malformed(
                    "one-time-auth header digest mismatch".to_string(),
                ));
            }
            reader.push_decoder(Box::new(OtaVerifier::new(cipher.iv.clone())))?;
            debug!("one-time-auth framing active for {}:{}", host, port);
        }
    }

    Ok(Target::new(host, port))
}

/// Client-side Shadowsocks connect. No reply framing to consume; the
/// encrypted stream simply starts with the address header.
pub(crate) async fn connect<W>(
    writer: &mut ProxyWriter<W>,
    rauth: &[u8],
    host: &str,
    port: u16,
    writer_cipher: Option<&CipherView>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write(rauth).await?;
    match writer_cipher {
        Some(cipher) if cipher.ota => {
            let header = addr::encode_address_tagged(addr::ATYP_DOMAIN | addr::OTA_FLAG, host, port);
            let mut keyed = Vec::with_capacity(cipher.iv.len() + cipher.key.len());
            keyed.extend_from_slice(&cipher.iv);
            keyed.extend_from_slice(&cipher.key);
            let tag = hmac_sha1(&keyed, &header);
            let mut buf = header;
            buf.extend_from_slice(&tag[..OTA_TAG_LEN]);
            writer.write(&buf).await?;
            writer.push_encoder(Box::new(OtaSigner::new(cipher.iv.clone())));
        }
        _ => {
            writer.write(&addr::encode_address(host, port)).await?;
        }
    }
    writer.drain().await?;
    Ok(())
}

pub(crate) fn udp_parse(data: &[u8], auth: &[u8]) -> Option<Target> {
    let rest = if auth.is_empty() {
        data
    } else {
        data.strip_prefix(auth)?
    };
    let (host, port, consumed) = addr::decode_datagram_address(rest)?;
    Some(Target::with_residual(
        host,
        port,
        Bytes::copy_from_slice(&rest[consumed..]),
    ))
}

pub(crate) fn udp_connect(rauth: &[u8], host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rauth.len() + 4 + host.len() + payload.len());
    out.extend_from_slice(rauth);
    out.extend_from_slice(&addr::encode_address(host, port));
    out.extend_from_slice(payload);
    out
}

/// Verifies and unwraps one-time-auth chunks:
/// `len_be_u16 || digest10 || payload[len]`, digest keyed by
/// `iv || chunk_id_be_u32`.
pub struct OtaVerifier {
    iv: Bytes,
    chunk_id: u32,
    pending: BytesMut,
}

impl OtaVerifier {
    pub fn new(iv: Bytes) -> Self {
        Self {
            iv,
            chunk_id: 0,
            pending: BytesMut::new(),
        }
    }
}

impl StreamDecoder for OtaVerifier {
    fn transform(&mut self, input: &[u8]) -> Result<Bytes> {
        self.pending.extend_from_slice(input);
        let mut out = BytesMut::new();
        loop {
            if self.pending.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
            if self.pending.len() < 2 + OTA_TAG_LEN + len {
                break;
            }
            let frame = self.pending.split_to(2 + OTA_TAG_LEN + len);
            let tag = &frame[2..2 + OTA_TAG_LEN];
            let payload = &frame[2 + OTA_TAG_LEN..];
            let expected = hmac_sha1(&chunk_key(&self.iv, self.chunk_id), payload);
            if tag != &expected[..OTA_TAG_LEN] {
                return Err(PolyProxyError::Malformed(
                    "one-time-auth chunk digest mismatch".to_string(),
                ));
            }
            self.chunk_id = self.chunk_id.wrapping_add(1);
            out.extend_from_slice(payload);
        }
        Ok(out.freeze())
    }
}

/// Signs outbound payloads into one-time-auth chunks; empty writes are
/// elided upstream.
pub struct OtaSigner {
    iv: Bytes,
    chunk_id: u32,
}

impl OtaSigner {
    pub fn new(iv: Bytes) -> Self {
        Self { iv, chunk_id: 0 }
    }
}

impl StreamEncoder for OtaSigner {
    fn wrap(&mut self, payload: &[u8]) -> Bytes {
        if payload.is_empty() {
            return Bytes::new();
        }
        let tag = hmac_sha1(&chunk_key(&self.iv, self.chunk_id), payload);
        self.chunk_id = self.chunk_id.wrapping_add(1);
        let mut out = BytesMut::with_capacity(2 + OTA_TAG_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&tag[..OTA_TAG_LEN]);
        out.extend_from_slice(payload);
        out.freeze()
    }
}
