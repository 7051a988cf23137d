//! Connection state machine.
//!
//! Each accepted connection moves strictly forward through
//! `Accepted -> Generating -> Writing -> Closed`. `Closed` is terminal and
//! can be entered from any earlier state.

use std::fmt;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, nothing done yet.
    Accepted,
    /// Waiting for the quote pipeline.
    Generating,
    /// Writing the response.
    Writing {
        /// Total bytes to write.
        total: usize,
    },
    /// Done; the stream has been released.
    Closed,
}

impl ConnState {
    fn rank(&self) -> u8 {
        match self {
            ConnState::Accepted => 0,
            ConnState::Generating => 1,
            ConnState::Writing { .. } => 2,
            ConnState::Closed => 3,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Accepted => f.write_str("accepted"),
            ConnState::Generating => f.write_str("generating"),
            ConnState::Writing { total } => write!(f, "writing {total} bytes"),
            ConnState::Closed => f.write_str("closed"),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Sequential id assigned by the accept loop.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    /// Create a new connection in the accepted state.
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: ConnState::Accepted,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Transition to generating state.
    pub fn start_generating(&mut self) -> bool {
        self.advance(ConnState::Generating)
    }

    /// Transition to writing state.
    pub fn start_writing(&mut self, total: usize) -> bool {
        self.advance(ConnState::Writing { total })
    }

    /// Transition to closed state.
    pub fn close(&mut self) -> bool {
        self.advance(ConnState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Move to `next` if it lies ahead of the current state.
    fn advance(&mut self, next: ConnState) -> bool {
        if next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }
}
