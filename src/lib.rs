//! Proxy data-plane core with a layered architecture
//!
//! Architecture:
//! - `core/`: Connections, proxy roles, sessions and the relay engine
//! - `transport/`: Security layers over connections (TLS)
//! - `proxy/`: Built-in handlers (tunnel inbound, freedom outbound)
//! - `business/`: Dispatcher, dialer, users and stats
//! - `server_runner`: Server startup and accept loop

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod server_runner;
pub mod transport;
