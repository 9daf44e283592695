use crate::utils::error::{PolyProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use tracing::instrument;

/// Resolve a decoded target into candidate socket addresses, preferring
/// IPv6 entries first. IP literals bypass the resolver.
#[instrument(level = "debug")]
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let mut targets: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(PolyProxyError::Io)?
        .collect();

    // Prefer IPv6, then IPv4, while preserving order inside each category.
    targets.sort_by_key(|addr| match addr.ip() {
        IpAddr::V6(_) => 0,
        IpAddr::V4(_) => 1,
    });

    if targets.is_empty() {
        return Err(PolyProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no addresses found for destination",
        )));
    }

    Ok(targets)
}
