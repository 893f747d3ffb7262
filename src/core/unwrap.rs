//! Peeling instrumentation and security wrappers off a connection
//!
//! The relay only splices when both ends come down to plain kernel sockets.
//! [`Unwrapper::unwrap`] walks the [`Layer`] chain: the first byte-counting
//! wrapper is removed and its counter for the requested side is kept, and the
//! first recognized security wrapper is removed. Whatever remains is the
//! handle the relay works with.

use std::sync::Arc;

use super::conn::{Connection, Layer, SecurityKind, TcpConnection};
use super::hooks::Counter;

/// Which direction of the relay a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The relay reads from it; a counted wrapper contributes its read counter
    Read,
    /// The relay writes to it; a counted wrapper contributes its write counter
    Write,
}

/// Result of unwrapping one endpoint
#[derive(Debug, Clone)]
pub struct Unwrapped<'a> {
    pub conn: &'a dyn Connection,
    pub counter: Option<Arc<dyn Counter>>,
    /// A security layer was removed; `conn` carries its ciphertext
    pub secured: bool,
}

impl<'a> Unwrapped<'a> {
    /// The raw socket, if unwrapping reached one
    pub fn socket(&self) -> Option<&'a TcpConnection> {
        match self.conn.layer() {
            Layer::Socket(socket) => Some(socket),
            _ => None,
        }
    }
}

/// Unwrapping policy: which security layers may be looked through
#[derive(Debug, Clone)]
pub struct Unwrapper {
    kinds: Vec<SecurityKind>,
}

impl Default for Unwrapper {
    fn default() -> Self {
        Self::new(SecurityKind::ALL.to_vec())
    }
}

impl Unwrapper {
    pub fn new(kinds: Vec<SecurityKind>) -> Self {
        Self { kinds }
    }

    pub fn recognizes(&self, kind: SecurityKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Remove at most one counted wrapper and at most one recognized security
    /// wrapper, in whichever order they are nested.
    pub fn unwrap<'a>(&self, conn: &'a dyn Connection, side: Side) -> Unwrapped<'a> {
        let mut current = conn;
        let mut counter = None;
        let mut seen_counted = false;
        let mut seen_secured = false;

        loop {
            match current.layer() {
                Layer::Counted { inner, read, write } if !seen_counted => {
                    seen_counted = true;
                    counter = match side {
                        Side::Read => read.cloned(),
                        Side::Write => write.cloned(),
                    };
                    current = inner;
                }
                Layer::Secured { kind, inner } if !seen_secured && self.recognizes(kind) => {
                    seen_secured = true;
                    current = inner;
                }
                _ => break,
            }
        }

        Unwrapped {
            conn: current,
            counter,
            secured: seen_secured,
        }
    }
}

/// Whether any layer of `conn` is a security session
pub fn is_secured(conn: &dyn Connection) -> bool {
    let mut current = conn;
    loop {
        match current.layer() {
            Layer::Secured { .. } => return true,
            Layer::Counted { inner, .. } => current = inner,
            Layer::Socket(_) | Layer::Opaque => return false,
        }
    }
}
