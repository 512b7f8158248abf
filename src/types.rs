//! Common types for the vmlink library

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Default control port of the VM service
pub const DEFAULT_PORT: u16 = 18923;

/// Client-side protocol phase, gating which messages may be sent or received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticating,
    Running,
    AttachingViewer,
    Viewer,
}

/// Lifecycle phase of the remote virtual machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Destroyed,
}

impl VmState {
    /// Map the `state` field of `auth-ok`. Unrecognized values are not an
    /// error, so newer servers can add states.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stopped" => VmState::Stopped,
            "starting" => VmState::Starting,
            "running" => VmState::Running,
            "stopping" => VmState::Stopping,
            _ => VmState::Unknown,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Unknown => "unknown",
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Why a control connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally
    Local,
    /// The peer closed the stream
    PeerClosed,
    /// Address resolution or connect failed
    ConnectFailed(String),
    /// Socket error while running
    Io(String),
    /// Oversize frame, undecodable payload or illegal message
    Protocol(String),
    /// Server rejected the token
    AuthFailed(String),
    /// Too many pings went unanswered
    Timeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::AuthFailed(e) => write!(f, "authentication failed: {}", e),
            CloseReason::Timeout => f.write_str("keepalive timeout"),
        }
    }
}

/// Lifecycle event delivered to the consumer context
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Transport connected
    Connected,
    /// Peer sent an `error` message
    ProtocolError { message: String },
    /// Transport is gone; always the last event of a connection
    Closed { reason: CloseReason },

    /// Authentication accepted
    AuthOk {
        vm_state: VmState,
        name: String,
        /// Mouse event rate hint; 0 means unlimited
        max_mouse_rate: i64,
    },
    /// Authentication rejected
    AuthFailed { error: String },
    /// Server accepted the attach-viewer request
    AttachingViewer,
    /// VM startup progress, 0.0 to 1.0
    StartupProgress { fraction: f64 },
    /// Not enough memory on the host to start the VM
    StartupRejectedMemory,
    StartupFailed { message: String },
    VmStarted { check_display: bool },
    VmStopped,
    VmDestroyed,
    Pong,
}

/// Where and how to reach the control channel of one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub port: u16,
    pub token: String,
}

impl ConnectionInfo {
    /// Build connection info; a zero port selects [`DEFAULT_PORT`]
    pub fn new(address: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: if port > 0 { port } else { DEFAULT_PORT },
            token: token.into(),
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl PartialOrd for ConnectionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.port.cmp(&other.port))
            .then(self.token.cmp(&other.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_from_wire_is_lenient() {
        assert_eq!(VmState::from_wire("stopped"), VmState::Stopped);
        assert_eq!(VmState::from_wire("starting"), VmState::Starting);
        assert_eq!(VmState::from_wire("running"), VmState::Running);
        assert_eq!(VmState::from_wire("stopping"), VmState::Stopping);
        assert_eq!(VmState::from_wire("Running"), VmState::Unknown);
        assert_eq!(VmState::from_wire("paused"), VmState::Unknown);
        assert_eq!(VmState::from_wire(""), VmState::Unknown);
    }

    #[test]
    fn connection_info_defaults_port() {
        let info = ConnectionInfo::new("vm.example.org", 0, "tok");
        assert_eq!(info.port, DEFAULT_PORT);
        assert_eq!(info.to_string(), "vm.example.org:18923");

        let info = ConnectionInfo::new("10.0.0.1", 4000, "tok");
        assert_eq!(info.to_string(), "10.0.0.1:4000");
    }

    #[test]
    fn connection_info_orders_by_address_then_port() {
        let mut list = vec![
            ConnectionInfo::new("b", 1, ""),
            ConnectionInfo::new("a", 9, ""),
            ConnectionInfo::new("a", 2, ""),
        ];
        list.sort();
        let shown: Vec<String> = list.iter().map(|i| i.to_string()).collect();
        assert_eq!(shown, vec!["a:2", "a:9", "b:1"]);
    }
}
