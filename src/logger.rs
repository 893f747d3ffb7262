use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{fmt as layer_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `log_mode`;
/// an unknown mode falls back to info.
pub fn init_logger(log_mode: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_mode.parse::<LogLevel>().unwrap_or_default();
        EnvFilter::new(format!("proxy_relay={}", level))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            layer_fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// Record a connection lifecycle event
    pub fn connection(addr: &str, event: &str) {
        info!(peer = addr, event = event, "Connection");
    }

    /// Record the end of a session with its outcome
    pub fn session_end(session: u64, tag: &str, error: Option<&dyn std::fmt::Display>) {
        match error {
            Some(err) => debug!(session, tag, error = %err, "Session ended with error"),
            None => debug!(session, tag, "Session ended"),
        }
    }
}
