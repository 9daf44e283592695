use crate::protocol::{udp_dispatch, Proto, SockInfo, UdpCtx};
use crate::server::resolver::resolve;
use crate::server::stats::TrafficStats;
use crate::utils::error::Result;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65535;
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-client association: the outbound socket plus the handler that
/// framed the client's traffic, so replies can be wrapped the same way.
struct UdpAssoc {
    outbound: Arc<UdpSocket>,
    proto_index: usize,
}

/// UDP front end: dispatch inbound datagrams across the enabled handlers,
/// forward payloads from a per-client outbound socket, and wrap replies
/// with the matching handler's framing.
pub async fn run_udp_front(
    socket: UdpSocket,
    protos: Arc<Vec<Proto>>,
    auth: Bytes,
    stats: Arc<TrafficStats>,
    shutdown: CancellationToken,
) -> Result<()> {
    let socket = Arc::new(socket);
    let local = socket.local_addr()?;
    let assocs: Arc<DashMap<SocketAddr, Arc<UdpAssoc>>> = Arc::new(DashMap::new());

    info!("UDP front end listening on {}", local);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, client) = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("UDP front end shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received?,
        };
        let datagram = &buf[..len];

        let sock = SockInfo::addresses_only(client, local);
        let ctx = UdpCtx {
            auth: &auth,
            sock: &sock,
        };
        let (index, target) = match udp_dispatch(&protos, datagram, &ctx) {
            Ok((proto, target)) => {
                let index = protos
                    .iter()
                    .position(|p| std::ptr::eq(p, proto))
                    .unwrap_or_default();
                (index, target)
            }
            Err(err) => {
                debug!(peer = %client, "dropping datagram: {}", err);
                continue;
            }
        };
        stats.add_bytes(target.residual.len() as u64);

        if target.is_echo() {
            let proto = &protos[index];
            match proto.udp_connect(b"", &client.ip().to_string(), client.port(), &target.residual)
            {
                Ok(reply) => {
                    let _ = socket.send_to(&reply, client).await;
                }
                Err(err) => debug!(peer = %client, "echo reply not framable: {}", err),
            }
            continue;
        }

        let assoc = match assocs.get(&client) {
            Some(existing) => existing.clone(),
            None => {
                match open_assoc(
                    client,
                    index,
                    socket.clone(),
                    protos.clone(),
                    assocs.clone(),
                    stats.clone(),
                )
                .await
                {
                    Ok(assoc) => assoc,
                    Err(err) => {
                        warn!(peer = %client, "failed to open UDP association: {}", err);
                        continue;
                    }
                }
            }
        };

        match resolve(&target.host, target.port).await {
            Ok(candidates) => {
                if let Some(dest) = candidates.first() {
                    if let Err(err) = assoc.outbound.send_to(&target.residual, dest).await {
                        debug!(peer = %client, dest = %dest, "UDP forward failed: {}", err);
                    }
                }
            }
            Err(err) => debug!(dest = %target, "UDP resolve failed: {}", err),
        }
    }
}

/// Create the outbound socket for one client and spawn its reply pump.
async fn open_assoc(
    client: SocketAddr,
    proto_index: usize,
    inbound: Arc<UdpSocket>,
    protos: Arc<Vec<Proto>>,
    assocs: Arc<DashMap<SocketAddr, Arc<UdpAssoc>>>,
    stats: Arc<TrafficStats>,
) -> Result<Arc<UdpAssoc>> {
    let outbound = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let assoc = Arc::new(UdpAssoc {
        outbound: outbound.clone(),
        proto_index,
    });
    assocs.insert(client, assoc.clone());
    debug!(peer = %client, "UDP association opened");

    tokio::spawn(async move {
        let proto = &protos[proto_index];
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = timeout(IDLE_TIMEOUT, outbound.recv_from(&mut buf)).await;
            let (len, origin) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    debug!(peer = %client, "UDP reply socket error: {}", err);
                    break;
                }
                Err(_) => {
                    debug!(peer = %client, "UDP association idle, evicting");
                    break;
                }
            };
            let wrapped = match proto.udp_connect(
                b"",
                &origin.ip().to_string(),
                origin.port(),
                &buf[..len],
            ) {
                Ok(wrapped) => wrapped,
                Err(err) => {
                    debug!(peer = %client, "reply not framable: {}", err);
                    continue;
                }
            };
            stats.add_bytes(len as u64);
            if inbound.send_to(&wrapped, client).await.is_err() {
                break;
            }
        }
        assocs.remove(&client);
    });

    Ok(assoc)
}
