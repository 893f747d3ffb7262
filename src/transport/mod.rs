//! Transport layer
//!
//! Security layers stacked on top of a [`Connection`](crate::core::Connection).

pub mod tls;

pub use tls::{load_server_config, TlsConnection};
