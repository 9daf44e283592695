pub mod handler;
pub mod listener;
pub mod relay;
pub mod resolver;
pub mod stats;
pub mod udp;

pub use handler::{handle_client, ClientCtx, Upstream};
pub use listener::ProxyServer;
pub use stats::TrafficStats;
