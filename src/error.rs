use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::core::net::Network;
use crate::core::relay::RelayError;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opening the outward connection failed
    #[error("failed to dial {destination}: {source}")]
    Dial {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// A connection reached an inbound that does not advertise its network
    #[error("network {0} is not supported by this inbound")]
    UnsupportedNetwork(Network),

    /// No data crossed the connection pair for longer than the idle policy allows
    #[error("connection idle for {0:?}")]
    IdleTimeout(Duration),

    /// The session was cancelled (user kicked or server shutting down)
    #[error("session cancelled")]
    Cancelled,

    /// One relay direction failed
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(format!("TOML parse error: {}", err))
    }
}

/// Failures reported by a [`UserManager`](crate::core::proxy::UserManager)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    /// Removal of an email that is not registered
    #[error("user {0} not found")]
    NotFound(String),

    /// Adding an email that is already registered
    #[error("user {0} already exists")]
    AlreadyExists(String),

    #[error("invalid user email: {0:?}")]
    InvalidEmail(String),

    /// The handler does not manage users
    #[error("user management is not supported by this handler")]
    Unsupported,
}

impl UserError {
    /// Not-found is reported but is not a fatal condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, UserError::NotFound(_))
    }
}
