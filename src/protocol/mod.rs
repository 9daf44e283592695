pub mod addr;
pub mod cipher;
pub mod http;
pub mod shadowsocks;
pub mod socks4;
pub mod socks5;
pub mod ssr;
pub mod stream;
pub mod transparent;

pub use cipher::CipherView;
pub use http::{HttpRewriter, StaticBody};
pub use shadowsocks::{OtaSigner, OtaVerifier};
pub use stream::{ProxyReader, ProxyWriter, StreamDecoder, StreamEncoder};
pub use transparent::SockInfo;

use crate::auth::AuthTable;
use crate::utils::error::{PolyProxyError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Destination decoded from a handshake, plus any payload bytes already
/// read past it that must reach the origin first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub residual: Bytes,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            residual: Bytes::new(),
        }
    }

    pub fn with_residual(host: impl Into<String>, port: u16, residual: Bytes) -> Self {
        Self {
            host: host.into(),
            port,
            residual,
        }
    }

    /// Relay-level loopback marker produced by the echo handler.
    pub fn is_echo(&self) -> bool {
        self.host == "echo" && self.port == 0
    }

    /// Placeholder produced by a bare tunnel listener; only an upstream hop
    /// can turn it into a real destination.
    pub fn is_tunnel_placeholder(&self) -> bool {
        self.host == "tunnel" && self.port == 0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a server-side handshake may consult.
pub struct HandshakeCtx<'a> {
    /// Configured credential, empty when authentication is disabled.
    pub auth: &'a [u8],
    pub auth_table: &'a AuthTable,
    /// Cipher attached to the inbound direction, if any.
    pub reader_cipher: Option<&'a CipherView>,
    /// Static GET map served by the HTTP handler.
    pub http_get: &'a HashMap<String, StaticBody>,
    pub sock: &'a SockInfo,
}

/// Context for datagram dispatch.
pub struct UdpCtx<'a> {
    pub auth: &'a [u8],
    pub sock: &'a SockInfo,
}

/// One enabled protocol handler. Capabilities a protocol lacks are
/// explicit `Unsupported` leaves, not silent fallbacks.
#[derive(Debug)]
pub enum Proto {
    Direct,
    Http,
    Socks5,
    Socks4,
    Ss,
    Ssr,
    Redir,
    Pf(transparent::Pf),
    Tunnel(transparent::Tunnel),
    Echo,
}

impl Proto {
    pub fn name(&self) -> &'static str {
        match self {
            Proto::Direct => "direct",
            Proto::Http => "http",
            Proto::Socks5 => "socks5",
            Proto::Socks4 => "socks4",
            Proto::Ss => "ss",
            Proto::Ssr => "ssr",
            Proto::Redir => "redir",
            Proto::Pf(_) => "pf",
            Proto::Tunnel(_) => "tunnel",
            Proto::Echo => "echo",
        }
    }

    /// Peek-based classifier. Called once with no byte for handlers that
    /// need no header, then once with a single pre-read byte.
    pub fn recognize(&self, first: Option<u8>, ctx: &HandshakeCtx<'_>) -> bool {
        match self {
            Proto::Direct => false,
            Proto::Http => first.map(|b| b.is_ascii_alphabetic()).unwrap_or(false),
            Proto::Socks5 => first == Some(0x05),
            Proto::Socks4 => first == Some(0x04),
            Proto::Ss => match first {
                Some(b) if !ctx.auth.is_empty() => b == ctx.auth[0],
                Some(b) => matches!(b, 0x01 | 0x03 | 0x04 | 0x11 | 0x13 | 0x14),
                None => false,
            },
            Proto::Ssr => match first {
                Some(b) if !ctx.auth.is_empty() => b == ctx.auth[0],
                Some(b) => matches!(b, 0x01 | 0x03 | 0x04),
                None => false,
            },
            Proto::Redir => {
                transparent::recognize(transparent::query_original_dst(ctx.sock).as_ref(), first, ctx)
            }
            Proto::Pf(pf) => transparent::recognize(pf.query_remote(ctx.sock).as_ref(), first, ctx),
            Proto::Tunnel(tunnel) => {
                transparent::recognize(tunnel.query_remote(ctx.sock).as_ref(), first, ctx)
            }
            Proto::Echo => {
                transparent::recognize(Some(&("echo".to_string(), 0)), first, ctx)
            }
        }
    }

    /// Server-side handshake. `first` is the byte consumed by the
    /// dispatcher while classifying, absent for header-less handlers.
    pub async fn parse<R, W>(
        &self,
        first: Option<u8>,
        reader: &mut ProxyReader<R>,
        writer: &mut ProxyWriter<W>,
        ctx: &HandshakeCtx<'_>,
    ) -> Result<Target>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self {
            Proto::Http => http::parse(required(first)?, reader, writer, ctx).await,
            Proto::Socks5 => socks5::parse(reader, writer, ctx).await,
            Proto::Socks4 => socks4::parse(reader, writer, ctx).await,
            Proto::Ss => shadowsocks::parse(required(first)?, reader, ctx).await,
            Proto::Ssr => ssr::parse(required(first)?, reader, ctx).await,
            Proto::Redir => {
                let remote = transparent::query_original_dst(ctx.sock).ok_or_else(|| {
                    PolyProxyError::Malformed("original destination query failed".to_string())
                })?;
                transparent::parse(reader, ctx, remote, self.name()).await
            }
            Proto::Pf(pf) => {
                let remote = pf.query_remote(ctx.sock).ok_or_else(|| {
                    PolyProxyError::Malformed("pf NAT lookup failed".to_string())
                })?;
                transparent::parse(reader, ctx, remote, self.name()).await
            }
            Proto::Tunnel(tunnel) => {
                let remote = tunnel.query_remote(ctx.sock).ok_or_else(|| {
                    PolyProxyError::Malformed("invalid tunnel destination".to_string())
                })?;
                transparent::parse(reader, ctx, remote, self.name()).await
            }
            Proto::Echo => transparent::parse(reader, ctx, ("echo".to_string(), 0), self.name()).await,
            Proto::Direct => Err(PolyProxyError::Unsupported(
                "direct accepts no inbound handshake".to_string(),
            )),
        }
    }

    /// Client-side connect through this protocol.
    pub async fn connect<R, W>(
        &self,
        reader: &mut ProxyReader<R>,
        writer: &mut ProxyWriter<W>,
        rauth: &[u8],
        host: &str,
        port: u16,
        writer_cipher: Option<&CipherView>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self {
            Proto::Direct => Ok(()),
            Proto::Http => http::connect(reader, writer, rauth, host, port).await,
            Proto::Socks5 => socks5::connect(reader, writer, rauth, host, port).await,
            Proto::Socks4 => socks4::connect(reader, writer, rauth, host, port).await,
            Proto::Ss => shadowsocks::connect(writer, rauth, host, port, writer_cipher).await,
            Proto::Ssr => ssr::connect(writer, rauth, host, port).await,
            Proto::Tunnel(_) => {
                writer.write(rauth).await?;
                writer.drain().await
            }
            Proto::Redir | Proto::Pf(_) | Proto::Echo => Err(PolyProxyError::Unsupported(
                format!("{} has no outbound side", self.name()),
            )),
        }
    }

    /// Datagram server parse; `None` when the datagram is not this
    /// handler's or the handler has no UDP side.
    pub fn udp_parse(&self, data: &[u8], ctx: &UdpCtx<'_>) -> Option<Target> {
        match self {
            Proto::Ss => shadowsocks::udp_parse(data, ctx.auth),
            Proto::Socks5 => socks5::udp_parse(data),
            Proto::Redir => {
                transparent::udp_parse(data, ctx.auth, transparent::query_original_dst(ctx.sock))
            }
            Proto::Pf(pf) => transparent::udp_parse(data, ctx.auth, pf.query_remote(ctx.sock)),
            Proto::Tunnel(tunnel) => {
                transparent::udp_parse(data, ctx.auth, tunnel.query_remote(ctx.sock))
            }
            Proto::Echo => {
                transparent::udp_parse(data, ctx.auth, Some(("echo".to_string(), 0)))
            }
            Proto::Direct | Proto::Http | Proto::Socks4 | Proto::Ssr => None,
        }
    }

    /// Frame a datagram toward a peer speaking this protocol.
    pub fn udp_connect(
        &self,
        rauth: &[u8],
        host: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        match self {
            Proto::Ss => Ok(shadowsocks::udp_connect(rauth, host, port, payload)),
            Proto::Socks5 => Ok(socks5::udp_connect(host, port, payload)),
            Proto::Tunnel(_) => {
                let mut out = Vec::with_capacity(rauth.len() + payload.len());
                out.extend_from_slice(rauth);
                out.extend_from_slice(payload);
                Ok(out)
            }
            _ => Err(PolyProxyError::Unsupported(format!(
                "{} cannot frame datagrams",
                self.name()
            ))),
        }
    }
}

fn required(first: Option<u8>) -> Result<u8> {
    first.ok_or_else(|| PolyProxyError::Malformed("handler requires a header byte".to_string()))
}

/// Pick the handler for an inbound stream and run its handshake.
///
/// Header-less handlers get the first shot; only if none claims the
/// connection is a single byte read and offered to the rest. First match
/// wins in configuration order.
pub async fn dispatch<'p, R, W>(
    protos: &'p [Proto],
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    ctx: &HandshakeCtx<'_>,
) -> Result<(&'p Proto, Target)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(proto) = protos.iter().find(|p| p.recognize(None, ctx)) {
        debug!("dispatching header-less handler {}", proto.name());
        let target = proto.parse(None, reader, writer, ctx).await?;
        return Ok((proto, target));
    }
    let first = reader
        .read_u8()
        .await
        .map_err(|_| PolyProxyError::ConnectionClosed)?;
    match protos.iter().find(|p| p.recognize(Some(first), ctx)) {
        Some(proto) => {
            debug!("header byte 0x{:02x} dispatched to {}", first, proto.name());
            let target = proto.parse(Some(first), reader, writer, ctx).await?;
            Ok((proto, target))
        }
        None => Err(PolyProxyError::Unsupported(format!(
            "no handler for header byte 0x{first:02x}"
        ))),
    }
}

/// Pick the handler for an inbound datagram.
pub fn udp_dispatch<'p>(
    protos: &'p [Proto],
    data: &[u8],
    ctx: &UdpCtx<'_>,
) -> Result<(&'p Proto, Target)> {
    for proto in protos {
        if let Some(target) = proto.udp_parse(data, ctx) {
            return Ok((proto, target));
        }
    }
    Err(PolyProxyError::Unsupported(format!(
        "no handler for datagram header {:02x?}",
        &data[..data.len().min(10)]
    )))
}

const KNOWN_NAMES: &[&str] = &[
    "direct", "http", "socks5", "socks4", "socks", "ss", "ssr", "redir", "pf", "tunnel", "echo",
];

/// Build one handler from a `name` or `name{param}` selector.
pub fn build(selector: &str) -> Result<Proto> {
    let (name, param) = match selector.split_once('{') {
        Some((name, rest)) => {
            let param = rest.strip_suffix('}').ok_or_else(|| {
                PolyProxyError::Config(format!("unterminated param in selector '{selector}'"))
            })?;
            (name, Some(param.to_string()))
        }
        None => (selector, None),
    };
    match name {
        "direct" => Ok(Proto::Direct),
        "http" => Ok(Proto::Http),
        "socks5" | "socks" => Ok(Proto::Socks5),
        "socks4" => Ok(Proto::Socks4),
        "ss" => Ok(Proto::Ss),
        "ssr" => Ok(Proto::Ssr),
        "redir" => Ok(Proto::Redir),
        "pf" => Ok(Proto::Pf(transparent::Pf::new())),
        "tunnel" => Ok(Proto::Tunnel(transparent::Tunnel::new(param))),
        "echo" => Ok(Proto::Echo),
        _ => Err(PolyProxyError::Config(format!(
            "unknown protocol '{}', existing protocols: {}",
            name,
            KNOWN_NAMES.join(", ")
        ))),
    }
}

/// Build the ordered handler list from selectors, keeping the first
/// occurrence of each protocol kind.
pub fn build_all(selectors: &[String]) -> Result<Vec<Proto>> {
    let mut protos: Vec<Proto> = Vec::with_capacity(selectors.len());
    for selector in selectors {
        let proto = build(selector)?;
        if protos
            .iter()
            .any(|p| std::mem::discriminant(p) == std::mem::discriminant(&proto))
        {
            continue;
        }
        protos.push(proto);
    }
    if protos.is_empty() {
        return Err(PolyProxyError::Config("no protocol specified".to_string()));
    }
    Ok(protos)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::auth::AuthKeeper;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// Owned backing state for a [`HandshakeCtx`] in tests.
    pub(crate) struct TestCtx {
        pub auth: Vec<u8>,
        pub table: AuthTable,
        pub sock: SockInfo,
        pub http_get: HashMap<String, StaticBody>,
        pub cipher: Option<CipherView>,
    }

    impl TestCtx {
        pub(crate) fn new(auth: &[u8]) -> Self {
            let keeper = Arc::new(AuthKeeper::new(Duration::from_secs(300)));
            Self {
                auth: auth.to_vec(),
                table: keeper.table("192.0.2.7".parse().unwrap()),
                sock: SockInfo::addresses_only(
                    "192.0.2.7:51000".parse().unwrap(),
                    "10.0.0.1:8080".parse().unwrap(),
                ),
                http_get: HashMap::new(),
                cipher: None,
            }
        }

        pub(crate) fn handshake(&self) -> HandshakeCtx<'_> {
            HandshakeCtx {
                auth: &self.auth,
                auth_table: &self.table,
                reader_cipher: self.cipher.as_ref(),
                http_get: &self.http_get,
                sock: &self.sock,
            }
        }
    }

    /// Replies written by the handler under test, readable once the server
    /// writer is handed back.
    pub(crate) struct Replies {
        client: DuplexStream,
    }

    impl Replies {
        pub(crate) async fn collect<W>(mut self, mut writer: ProxyWriter<W>) -> Vec<u8>
        where
            W: tokio::io::AsyncWrite + Unpin,
        {
            use tokio::io::AsyncReadExt;
            let _ = writer.close().await;
            let mut out = Vec::new();
            self.client.read_to_end(&mut out).await.unwrap();
            out
        }
    }

    /// Preload `wire` as the client's handshake bytes and return the
    /// server-side reader/writer pair plus context scaffolding.
    pub(crate) async fn handshake_pair(
        wire: &[u8],
        auth: &[u8],
    ) -> (
        ProxyReader<ReadHalf<DuplexStream>>,
        ProxyWriter<WriteHalf<DuplexStream>>,
        Replies,
        TestCtx,
    ) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(wire).await.unwrap();
        client.shutdown().await.unwrap();
        let (read_half, write_half) = tokio::io::split(server);
        (
            ProxyReader::new(read_half),
            ProxyWriter::new(write_half),
            Replies { client },
            TestCtx::new(auth),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::handshake_pair;
    use super::*;

    #[test]
    fn registry_resolves_names_aliases_and_params() {
        assert!(matches!(build("socks5").unwrap(), Proto::Socks5));
        assert!(matches!(build("socks").unwrap(), Proto::Socks5));
        assert!(matches!(build("http").unwrap(), Proto::Http));
        assert!(matches!(build("tunnel{host:90}").unwrap(), Proto::Tunnel(_)));
        assert!(matches!(build("pf").unwrap(), Proto::Pf(_)));
        assert!(build("quic").is_err());
        assert!(build("tunnel{host:90").is_err());
    }

    #[test]
    fn registry_deduplicates_kinds() {
        let protos = build_all(&[
            "socks5".to_string(),
            "socks".to_string(),
            "http".to_string(),
        ])
        .unwrap();
        assert_eq!(protos.len(), 2);
        assert!(build_all(&[]).is_err());
    }

    #[tokio::test]
    async fn dispatch_is_deterministic_for_identical_streams() {
        let protos = build_all(&["http".to_string(), "socks5".to_string()]).unwrap();

        for _ in 0..2 {
            let mut wire = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 0x0b];
            wire.extend_from_slice(b"example.com");
            wire.extend_from_slice(&[0x00, 0x50]);
            let (mut reader, mut writer, _replies, ctx) = handshake_pair(&wire, b"").await;
            let (proto, target) = dispatch(&protos, &mut reader, &mut writer, &ctx.handshake())
                .await
                .unwrap();
            assert_eq!(proto.name(), "socks5");
            assert_eq!(target.host, "example.com");
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_header() {
        let protos = build_all(&["socks5".to_string(), "http".to_string()]).unwrap();
        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&[0x16, 0x03], b"").await;

        let err = dispatch(&protos, &mut reader, &mut writer, &ctx.handshake())
            .await
            .unwrap_err();
        assert!(matches!(err, PolyProxyError::Unsupported(_)));
    }

    #[tokio::test]
    async fn headerless_echo_wins_before_any_byte_is_read() {
        let protos = build_all(&["echo".to_string(), "socks5".to_string()]).unwrap();
        let (mut reader, mut writer, _replies, ctx) = handshake_pair(b"anything", b"").await;

        let (proto, target) = dispatch(&protos, &mut reader, &mut writer, &ctx.handshake())
            .await
            .unwrap();
        assert_eq!(proto.name(), "echo");
        assert!(target.is_echo());
        // the stream is untouched: the relay loops these bytes back
        assert_eq!(&reader.read_n(8).await.unwrap()[..], b"anything");
    }

    #[tokio::test]
    async fn transparent_loop_detection_yields_unsupported() {
        // tunnel pointing at the listener's own bound address must refuse
        // to match, leaving the connection unclaimed
        let protos = build_all(&["tunnel{10.0.0.1:8080}".to_string()]).unwrap();
        let (mut reader, mut writer, _replies, ctx) = handshake_pair(&[0xff], b"").await;

        let err = dispatch(&protos, &mut reader, &mut writer, &ctx.handshake())
            .await
            .unwrap_err();
        assert!(matches!(err, PolyProxyError::Unsupported(_)));
    }

    #[test]
    fn udp_dispatch_tries_handlers_in_order() {
        let protos = build_all(&["socks5".to_string(), "ss".to_string()]).unwrap();
        let sock = SockInfo::addresses_only(
            "192.0.2.7:51000".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        );
        let ctx = UdpCtx { auth: b"", sock: &sock };

        let mut socks5_gram = vec![0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        socks5_gram.extend_from_slice(b"q");
        let (proto, target) = udp_dispatch(&protos, &socks5_gram, &ctx).unwrap();
        assert_eq!(proto.name(), "socks5");
        assert_eq!(target.host, "8.8.8.8");

        let mut ss_gram = vec![0x01, 9, 9, 9, 9, 0x00, 0x35];
        ss_gram.extend_from_slice(b"q");
        let (proto, target) = udp_dispatch(&protos, &ss_gram, &ctx).unwrap();
        assert_eq!(proto.name(), "ss");
        assert_eq!(target.host, "9.9.9.9");

        assert!(udp_dispatch(&protos, &[0xde, 0xad], &ctx).is_err());
    }

    #[test]
    fn target_markers() {
        assert!(Target::new("echo", 0).is_echo());
        assert!(Target::new("tunnel", 0).is_tunnel_placeholder());
        assert!(!Target::new("example.com", 80).is_echo());
        assert_eq!(Target::new("example.com", 80).to_string(), "example.com:80");
    }
}
