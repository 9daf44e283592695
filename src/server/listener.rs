use crate::auth::AuthKeeper;
use crate::config::Config;
use crate::protocol::{build, build_all};
use crate::server::handler::{handle_client, ClientCtx, Upstream};
use crate::server::stats::TrafficStats;
use crate::server::udp::run_udp_front;
use crate::utils::error::{PolyProxyError, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ProxyServer {
    config: Arc<Config>,
    ctx: Arc<ClientCtx>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub async fn new(config: Config) -> Result<Self> {
        let protos = Arc::new(build_all(&config.server.protocols)?);
        let auth = Bytes::from(config.auth.secret.clone().into_bytes());
        let auth_keeper = Arc::new(AuthKeeper::new(Duration::from_secs(
            config.auth.sticky_ttl_secs,
        )));
        let http_get = Arc::new(config.load_http_get()?);

        let upstream = match &config.upstream {
            Some(upstream_config) => {
                let proto = build(&upstream_config.protocol)?;
                let (host, port) = upstream_config.split_address()?;
                info!(
                    "chaining outbound connections through {} at {}:{}",
                    proto.name(),
                    host,
                    port
                );
                Some(Arc::new(Upstream {
                    proto,
                    host,
                    port,
                    auth: Bytes::from(upstream_config.secret.clone().into_bytes()),
                }))
            }
            None => None,
        };

        let ctx = Arc::new(ClientCtx {
            protos,
            auth,
            auth_keeper,
            http_get,
            upstream,
            stats: Arc::new(TrafficStats::new()),
        });

        Ok(Self {
            config: Arc::new(config),
            ctx,
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.bind_port
        );
        let listener = TcpListener::bind(&bind_addr).await?;

        let names: Vec<&str> = self.ctx.protos.iter().map(|p| p.name()).collect();
        info!(
            "polyproxy listening on {} for protocols [{}]",
            bind_addr,
            names.join(", ")
        );
        if self.ctx.auth.is_empty() {
            info!("authentication disabled");
        } else {
            info!("authentication enabled");
        }

        if self.config.server.udp_enabled {
            let udp_addr = format!(
                "{}:{}",
                self.config.server.bind_address,
                self.config
                    .server
                    .udp_port
                    .unwrap_or(self.config.server.bind_port)
            );
            let socket = UdpSocket::bind(&udp_addr).await?;
            let protos = self.ctx.protos.clone();
            let auth = self.ctx.auth.clone();
            let stats = self.ctx.stats.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = run_udp_front(socket, protos, auth, stats, shutdown).await {
                    error!("UDP front end error: {}", err);
                }
            });
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY on client socket: {}", err);
                    }
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        match handle_client(stream, ctx, peer).await {
                            Ok(()) => {}
                            // policy closes and silent disconnects are routine
                            Err(PolyProxyError::ClosedByPolicy(reason)) => {
                                info!(peer = %peer, "connection closed: {}", reason);
                            }
                            Err(PolyProxyError::ConnectionClosed) => {}
                            Err(err) => error!(peer = %peer, "client error: {}", err),
                        }
                    });
                }
                Err(err) => {
                    error!("failed to accept connection: {}", err);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let stats = &self.ctx.stats;
        info!(
            "shutting down: {} bytes relayed over {} channels",
            stats.bytes(),
            stats.total_channels()
        );
    }
}
