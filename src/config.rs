//! Configuration for the relay server
//!
//! CLI arguments (with `PROXY_RELAY_*` environment fallbacks) are layered over
//! an optional TOML file. Values given on the command line win.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::net::Destination;
use crate::core::relay::{RelayPolicy, DEFAULT_BUFFER_SIZE};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try parsing as humantime duration first (e.g., "60s", "2m", "1h30m")
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

pub const DEFAULT_LISTEN: &str = "0.0.0.0:1080";
pub const DEFAULT_INBOUND_TAG: &str = "tunnel-in";
pub const DEFAULT_OUTBOUND_TAG: &str = "direct";

/// CLI arguments
///
/// Supports environment variables with PROXY_RELAY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Pass-through proxy with a splice-aware relay core")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// TOML config file
    #[arg(short = 'c', long, env = "PROXY_RELAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Listen address (default: 0.0.0.0:1080)
    #[arg(long, env = "PROXY_RELAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Fixed destination every accepted connection is forwarded to (host:port)
    #[arg(long, env = "PROXY_RELAY_DESTINATION")]
    pub destination: Option<String>,

    /// Inbound tag used in logs and stats counter names
    #[arg(long, env = "PROXY_RELAY_INBOUND_TAG")]
    pub inbound_tag: Option<String>,

    /// Outbound tag used in logs and stats counter names
    #[arg(long, env = "PROXY_RELAY_OUTBOUND_TAG")]
    pub outbound_tag: Option<String>,

    /// User every tunneled connection is accounted to (user>>>EMAIL>>>traffic stats)
    #[arg(long, env = "PROXY_RELAY_USER")]
    pub user: Option<String>,

    /// TLS certificate file path; enables TLS together with --key_file
    #[arg(long, env = "PROXY_RELAY_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long, env = "PROXY_RELAY_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "PROXY_RELAY_LOG_MODE")]
    pub log_mode: Option<String>,

    /// Always use the buffered copy path
    #[arg(long, env = "PROXY_RELAY_DISABLE_SPLICE", default_value_t = false)]
    pub disable_splice: bool,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "PROXY_RELAY_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// Idle timeout once the server has finished sending (default: 1s)
    #[arg(long, env = "PROXY_RELAY_UPLINK_ONLY", default_value = "1s", value_parser = parse_duration, help_heading = "Performance")]
    pub uplink_only: Duration,

    /// Idle timeout once the client has finished sending (default: 1s)
    #[arg(long, env = "PROXY_RELAY_DOWNLINK_ONLY", default_value = "1s", value_parser = parse_duration, help_heading = "Performance")]
    pub downlink_only: Duration,

    /// TCP connect timeout to destination (default: 5s)
    #[arg(long, env = "PROXY_RELAY_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "PROXY_RELAY_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Buffer size for the buffered copy path in bytes (default: 32KB)
    #[arg(long, env = "PROXY_RELAY_BUFFER_SIZE", help_heading = "Performance")]
    pub buffer_size: Option<usize>,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "PROXY_RELAY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "PROXY_RELAY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections, 0 for unlimited (default: 0)
    #[arg(
        long,
        env = "PROXY_RELAY_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// TOML file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub inbound: InboundSection,
    pub outbound: OutboundSection,
    pub relay: RelayPolicy,
    pub log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InboundSection {
    pub listen: Option<SocketAddr>,
    pub tag: Option<String>,
    pub destination: Option<Destination>,
    pub user: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboundSection {
    pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Idle timeout while both directions are open
    pub idle_timeout: Duration,
    /// Idle timeout after the response direction finished
    pub uplink_only: Duration,
    /// Idle timeout after the request direction finished
    pub downlink_only: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            uplink_only: Duration::from_secs(1),
            downlink_only: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            uplink_only: cli.uplink_only,
            downlink_only: cli.downlink_only,
            connect_timeout: cli.tcp_connect_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            buffer_size: cli.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

/// Runtime server configuration (CLI layered over the config file)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub inbound_tag: String,
    pub outbound_tag: String,
    pub destination: Destination,
    /// Owner of all tunneled traffic
    pub user: Option<String>,
    /// TLS certificate file path
    pub cert: Option<PathBuf>,
    /// TLS private key file path
    pub key: Option<PathBuf>,
    pub relay: RelayPolicy,
    pub log_level: String,
    pub conn: ConnConfig,
}

impl ServerConfig {
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let file = match &cli.config_file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_parts(cli, file)
    }

    pub fn from_parts(cli: &CliArgs, file: FileConfig) -> Result<Self> {
        let destination = match &cli.destination {
            Some(dest) => dest.parse::<Destination>()?,
            None => file
                .inbound
                .destination
                .ok_or_else(|| anyhow!("destination is required (--destination or [inbound] destination)"))?,
        };

        let mut relay = file.relay;
        if let Some(size) = cli.buffer_size {
            relay.buffer_size = size;
        }
        if cli.disable_splice {
            relay.splice_platforms.clear();
        }

        let mut conn = ConnConfig::from_cli(cli);
        conn.buffer_size = relay.buffer_size;

        let config = Self {
            listen: match cli.listen.or(file.inbound.listen) {
                Some(listen) => listen,
                None => DEFAULT_LISTEN.parse()?,
            },
            inbound_tag: cli
                .inbound_tag
                .clone()
                .or(file.inbound.tag)
                .unwrap_or_else(|| DEFAULT_INBOUND_TAG.to_string()),
            outbound_tag: cli
                .outbound_tag
                .clone()
                .or(file.outbound.tag)
                .unwrap_or_else(|| DEFAULT_OUTBOUND_TAG.to_string()),
            destination,
            user: cli.user.clone().or(file.inbound.user),
            cert: cli.cert_file.clone().or(file.inbound.cert_file),
            key: cli.key_file.clone().or(file.inbound.key_file),
            relay,
            log_level: cli
                .log_mode
                .clone()
                .or(file.log.level)
                .unwrap_or_else(|| "info".to_string()),
            conn,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the merged configuration
    pub fn validate(&self) -> Result<()> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(anyhow!("TLS certificate file not found: {}", cert.display()));
                }
                if !key.exists() {
                    return Err(anyhow!("TLS private key file not found: {}", key.display()));
                }
            }
            (None, None) => {}
            _ => {
                return Err(anyhow!(
                    "TLS requires both a certificate file and a private key file"
                ))
            }
        }

        if self.user.as_deref().is_some_and(|user| user.trim().is_empty()) {
            return Err(anyhow!("user must not be empty"));
        }
        if self.inbound_tag.is_empty() || self.outbound_tag.is_empty() {
            return Err(anyhow!("inbound and outbound tags must not be empty"));
        }
        if self.relay.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.conn.idle_timeout.is_zero() {
            return Err(anyhow!("conn_idle_timeout must be greater than 0"));
        }
        if self.conn.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }
        Ok(())
    }

    pub fn has_tls(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}
