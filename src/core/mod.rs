//! Core proxy module
//!
//! This module contains the data-plane core:
//! - Connection abstraction and instrumented wrappers
//! - Proxy roles (inbound, outbound, user management)
//! - Sessions and the relay engine
//! - Hook traits for extensibility

pub mod conn;
pub mod hooks;
pub mod net;
pub mod proxy;
pub mod relay;
mod server;
pub mod session;
pub mod signal;
mod splice;
pub mod unwrap;

pub use conn::{Connection, CounterConnection, TcpConnection};
pub use hooks::{AtomicCounter, Counter, Dialer, Dispatcher, TrafficCounters};
pub use net::{Address, Destination, Network};
pub use proxy::{GetInbound, GetOutbound, Inbound, Link, MemoryUser, Outbound, UserManager};
pub use relay::{CopyOutcome, CopyPath, Relay, RelayError, RelayPolicy, Sink, Source};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionId, SessionManager};
pub use signal::{ActivityTimer, ActivityUpdater};
