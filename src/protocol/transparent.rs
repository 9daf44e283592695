use super::stream::ProxyReader;
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::io::AsyncRead;
use tracing::trace;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// Address facts about an accepted socket, captured before the stream is
/// split. The raw descriptor backs the kernel NAT queries of the
/// transparent family and must not outlive the stream it came from.
#[derive(Debug, Clone)]
pub struct SockInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    #[cfg(unix)]
    pub fd: RawFd,
}

impl SockInfo {
    pub fn from_stream(stream: &tokio::net::TcpStream) -> Result<Self> {
        Ok(Self {
            peer: stream.peer_addr()?,
            local: stream.local_addr()?,
            #[cfg(unix)]
            fd: stream.as_raw_fd(),
        })
    }

    /// Address-only info for sockets without a usable descriptor (UDP
    /// datagrams, in-memory test streams).
    pub fn addresses_only(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            peer,
            local,
            #[cfg(unix)]
            fd: -1,
        }
    }
}

/// Shared recognizer of the transparent family: the kernel query must
/// produce a destination that is not our own listening address, and when a
/// credential prefix is configured the first byte must open it.
pub(crate) fn recognize(
    remote: Option<&(String, u16)>,
    first: Option<u8>,
    ctx: &HandshakeCtx<'_>,
) -> bool {
    let Some((host, port)) = remote else {
        return false;
    };
    if *host == ctx.sock.local.ip().to_string() && *port == ctx.sock.local.port() {
        trace!("transparent query looped back to {}:{}", host, port);
        return false;
    }
    if ctx.auth.is_empty() {
        true
    } else {
        first == Some(ctx.auth[0])
    }
}

/// Shared parse of the transparent family: verify the rest of the
/// credential prefix (the first byte was checked by the recognizer) and
/// hand back the queried destination.
pub(crate) async fn parse<R>(
    reader: &mut ProxyReader<R>,
    ctx: &HandshakeCtx<'_>,
    remote: (String, u16),
    name: &str,
) -> Result<Target>
where
    R: AsyncRead + Unpin,
{
    if !ctx.auth.is_empty() {
        let rest = reader.read_n(ctx.auth.len() - 1).await?;
        if rest[..] != ctx.auth[1..] {
            return Err(PolyProxyError::Unauthorized(format!(
                "{name} auth prefix mismatch"
            )));
        }
        ctx.auth_table.set_authed();
    }
    Ok(Target::new(remote.0, remote.1))
}

/// Shared datagram parse: strip the credential prefix, destination comes
/// from the kernel/param query, remainder is payload.
pub(crate) fn udp_parse(
    data: &[u8],
    auth: &[u8],
    remote: Option<(String, u16)>,
) -> Option<Target> {
    let rest = if auth.is_empty() {
        data
    } else {
        data.strip_prefix(auth)?
    };
    let (host, port) = remote?;
    Some(Target::with_residual(
        host,
        port,
        Bytes::copy_from_slice(rest),
    ))
}

/// Linux NAT redirect: recover the pre-REDIRECT destination via
/// SO_ORIGINAL_DST.
#[cfg(target_os = "linux")]
pub(crate) fn query_original_dst(sock: &SockInfo) -> Option<(String, u16)> {
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SO_ORIGINAL_DST: libc::c_int = 80;
    const SOL_IPV6: libc::c_int = 41;

    if sock.fd < 0 {
        return None;
    }
    unsafe {
        if sock.local.is_ipv4() {
            let mut original: libc::sockaddr_in = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let rc = libc::getsockopt(
                sock.fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut original as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if rc != 0 || len as usize != std::mem::size_of::<libc::sockaddr_in>() {
                return None;
            }
            let host = Ipv4Addr::from(u32::from_be(original.sin_addr.s_addr));
            Some((host.to_string(), u16::from_be(original.sin_port)))
        } else {
            let mut original: libc::sockaddr_in6 = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let rc = libc::getsockopt(
                sock.fd,
                SOL_IPV6,
                SO_ORIGINAL_DST,
                &mut original as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if rc != 0 || len as usize != std::mem::size_of::<libc::sockaddr_in6>() {
                return None;
            }
            let host = Ipv6Addr::from(original.sin6_addr.s6_addr);
            Some((host.to_string(), u16::from_be(original.sin6_port)))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn query_original_dst(_sock: &SockInfo) -> Option<(String, u16)> {
    None
}

/// BSD PF transparent interception. Holds the process-lifetime `/dev/pf`
/// descriptor, opened on first query and never closed.
#[derive(Debug, Default)]
pub struct Pf {
    #[cfg_attr(
        not(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "macos"
        )),
        allow(dead_code)
    )]
    device: OnceLock<Option<std::fs::File>>,
}

impl Pf {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos"
    ))]
    pub(crate) fn query_remote(&self, sock: &SockInfo) -> Option<(String, u16)> {
        use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

        const DIOCNATLOOK: libc::c_ulong = 0xc054_4417;
        const PF_OUT: u8 = 2;

        let device = self
            .device
            .get_or_init(|| {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/dev/pf")
                    .ok()
            })
            .as_ref()?;

        // pfioc_natlook: saddr/daddr at 0/16, sxport at 64, dxport at 68,
        // af at 80, proto at 81, direction at 83; the answer lands in
        // rdaddr at 48 and rdxport at 76
        let mut pnl = [0u8; 84];
        let addr_len = match (sock.peer.ip(), sock.local.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                pnl[..4].copy_from_slice(&src.octets());
                pnl[16..20].copy_from_slice(&dst.octets());
                pnl[80] = libc::AF_INET as u8;
                4
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                pnl[..16].copy_from_slice(&src.octets());
                pnl[16..32].copy_from_slice(&dst.octets());
                pnl[80] = libc::AF_INET6 as u8;
                16
            }
            _ => return None,
        };
        pnl[64..66].copy_from_slice(&sock.peer.port().to_be_bytes());
        pnl[68..70].copy_from_slice(&sock.local.port().to_be_bytes());
        pnl[81] = libc::IPPROTO_TCP as u8;
        pnl[83] = PF_OUT;

        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                DIOCNATLOOK,
                pnl.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if rc != 0 {
            return None;
        }

        let host = if addr_len == 4 {
            Ipv4Addr::new(pnl[48], pnl[49], pnl[50], pnl[51]).to_string()
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&pnl[48..64]);
            Ipv6Addr::from(octets).to_string()
        };
        let port = u16::from_be_bytes([pnl[76], pnl[77]]);
        Some((host, port))
    }

    #[cfg(not(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos"
    )))]
    pub(crate) fn query_remote(&self, _sock: &SockInfo) -> Option<(String, u16)> {
        None
    }
}

/// Fixed-destination listener. The param names `host:port`; empty fields
/// inherit from the accept address, and no param at all yields the
/// `("tunnel", 0)` placeholder resolved by the upstream hop.
#[derive(Debug, Default)]
pub struct Tunnel {
    param: Option<String>,
}

impl Tunnel {
    pub fn new(param: Option<String>) -> Self {
        Self {
            param: param.filter(|p| !p.is_empty()),
        }
    }

    pub(crate) fn query_remote(&self, sock: &SockInfo) -> Option<(String, u16)> {
        let Some(param) = &self.param else {
            return Some(("tunnel".to_string(), 0));
        };
        let (host, port) = match param.split_once(':') {
            Some((host, port)) => (host, port),
            None => (param.as_str(), ""),
        };
        let host = if host.is_empty() {
            sock.local.ip().to_string()
        } else {
            host.to_string()
        };
        let port = if port.is_empty() {
            sock.local.port()
        } else {
            port.parse().ok()?
        };
        Some((host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock() -> SockInfo {
        SockInfo::addresses_only(
            "192.0.2.7:51000".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        )
    }

    #[test]
    fn tunnel_param_overrides_destination() {
        let tunnel = Tunnel::new(Some("origin.test:9000".to_string()));
        assert_eq!(
            tunnel.query_remote(&sock()),
            Some(("origin.test".to_string(), 9000))
        );
    }

    #[test]
    fn tunnel_empty_fields_inherit_local_address() {
        let tunnel = Tunnel::new(Some(":9000".to_string()));
        assert_eq!(
            tunnel.query_remote(&sock()),
            Some(("10.0.0.1".to_string(), 9000))
        );

        let tunnel = Tunnel::new(Some("origin.test".to_string()));
        assert_eq!(
            tunnel.query_remote(&sock()),
            Some(("origin.test".to_string(), 8080))
        );
    }

    #[test]
    fn tunnel_without_param_is_a_placeholder() {
        let tunnel = Tunnel::new(None);
        assert_eq!(tunnel.query_remote(&sock()), Some(("tunnel".to_string(), 0)));
        assert_eq!(Tunnel::new(Some(String::new())).query_remote(&sock()),
            Some(("tunnel".to_string(), 0)));
    }

    #[test]
    fn tunnel_rejects_garbage_port() {
        let tunnel = Tunnel::new(Some("origin.test:nope".to_string()));
        assert_eq!(tunnel.query_remote(&sock()), None);
    }
}
