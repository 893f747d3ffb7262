//! Business logic implementations
//!
//! This module contains the pieces that wire the core together:
//! - Session dispatching and direct dialing
//! - In-memory user management
//! - Statistics collection

mod dialer;
mod dispatcher;
mod stats;
mod users;

pub use dialer::SystemDialer;
pub use dispatcher::DefaultDispatcher;
pub use stats::{format_bytes, traffic_counter_name, CounterSnapshot, StatWriter, StatsManager};
pub use users::UserStore;
