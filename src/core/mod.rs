/// Core abstractions shared between the pool and the connection layer
pub mod connection;
pub mod node;

use std::fmt;

pub use connection::{
    ConnectionConfig, ConnectionDefaults, ConnectionFactory, EndObserver, ErrorObserver, NodeConnection, RetryPolicy,
};
pub use node::{node_key, parse_address, NodeInput, NodeOptions, NodeOverrides, NodeSpec, PortValue};

/// Default host used when a node descriptor omits one
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default Redis port used when a node descriptor omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Lifecycle status of a node connection
///
/// `End` is terminal: a connection never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Created lazily, no socket yet
    Wait,
    /// TCP connect in progress
    Connecting,
    /// Socket established, handshake pending
    Connect,
    /// Handshake finished, serving commands
    Ready,
    /// Waiting to reconnect (never entered by pool-owned connections)
    Reconnecting,
    /// Socket closed, final cleanup pending
    Close,
    /// Terminal
    End,
}

impl ConnectionStatus {
    /// Whether a reconciliation can stop waiting on a connection in this status.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Wait
                | ConnectionStatus::Connect
                | ConnectionStatus::Ready
                | ConnectionStatus::End
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::End)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Wait => "wait",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connect => "connect",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Close => "close",
            ConnectionStatus::End => "end",
        };
        f.write_str(name)
    }
}

/// Registry view selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Every node in the pool
    All,
    /// Primaries (read-write)
    Master,
    /// Replicas (read-only)
    Slave,
}

impl NodeRole {
    /// Role a connection holds given its read-only flag
    pub fn for_read_only(read_only: bool) -> Self {
        if read_only {
            NodeRole::Slave
        } else {
            NodeRole::Master
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::All => write!(f, "all"),
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}
