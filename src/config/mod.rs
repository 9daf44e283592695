use crate::protocol::{self, StaticBody};
use crate::utils::error::{PolyProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static GET map: request path to response body. A body beginning
    /// with `@` names a file whose bytes are loaded at startup.
    #[serde(default)]
    pub http_get: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Ordered protocol selectors (`name` or `name{param}`) tried against
    /// each inbound connection.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub udp_enabled: bool,
    /// Defaults to `bind_port` when unset.
    #[serde(default)]
    pub udp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Opaque credential: `user:pass` for SOCKS5/HTTP, a userid for
    /// SOCKS4, a byte prefix for SS/SSR. Empty disables authentication.
    #[serde(default)]
    pub secret: String,
    /// How long a peer's successful authentication lets it skip
    /// re-presenting credentials.
    #[serde(default = "default_sticky_ttl")]
    pub sticky_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Protocol selector for the next hop.
    pub protocol: String,
    /// `host:port` of the next hop.
    pub address: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_protocols() -> Vec<String> {
    vec![
        "http".to_string(),
        "socks5".to_string(),
        "socks4".to_string(),
    ]
}

fn default_sticky_ttl() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            protocols: default_protocols(),
            udp_enabled: false,
            udp_port: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            sticky_ttl_secs: default_sticky_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl UpstreamConfig {
    pub fn split_address(&self) -> Result<(String, u16)> {
        let (host, port) = self.address.rsplit_once(':').ok_or_else(|| {
            PolyProxyError::Config(format!(
                "upstream address '{}' must be host:port",
                self.address
            ))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            PolyProxyError::Config(format!("invalid upstream port in '{}'", self.address))
        })?;
        Ok((host.to_string(), port))
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PolyProxyError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| PolyProxyError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        protocol::build_all(&self.server.protocols)?;

        if let Some(upstream) = &self.upstream {
            protocol::build(&upstream.protocol)?;
            upstream.split_address()?;
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(PolyProxyError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Resolve the static GET map, reading `@file` bodies from disk.
    pub fn load_http_get(&self) -> Result<HashMap<String, StaticBody>> {
        let mut map = HashMap::with_capacity(self.http_get.len());
        for (path, body) in &self.http_get {
            let body = match body.strip_prefix('@') {
                Some(file) => StaticBody::Raw(std::fs::read(file).map_err(|e| {
                    PolyProxyError::Config(format!("Failed to read http_get body '{file}': {e}"))
                })?),
                None => StaticBody::Text(body.clone()),
            };
            map.insert(path.clone(), body);
        }
        Ok(map)
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[server]
bind_address = "127.0.0.1"
bind_port = 8080
# Ordered protocol selectors tried against each inbound connection.
# Known names: direct, http, socks5, socks4, socks, ss, ssr, redir, pf,
# tunnel, echo. A {param} suffix configures the handler, e.g.
# "tunnel{origin.example.com:80}".
protocols = ["http", "socks5", "socks4"]
udp_enabled = false
# udp_port = 8081

[auth]
# Empty disables authentication. Interpreted per protocol:
# "user:pass" for SOCKS5/HTTP, a userid for SOCKS4, a byte prefix for
# SS/SSR.
secret = ""
sticky_ttl_secs = 300

# Chain every outbound connection through a next hop:
# [upstream]
# protocol = "socks5"
# address = "10.0.0.2:1080"
# secret = ""

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"

# Plain responses served for GET requests with a bare path.
# A body starting with "@" names a file loaded at startup.
# [http_get]
# "/generate_204" = "ok %(host)s"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            PolyProxyError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
