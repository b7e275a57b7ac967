/// Connection collaborator boundary
///
/// The pool never speaks the wire protocol itself. It creates connections
/// through a `ConnectionFactory`, watches their status and flips their role,
/// all through the `NodeConnection` trait.

use super::node::NodeOptions;
use super::ConnectionStatus;
use crate::error::ConnectionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One-shot observer fired when a connection reaches `End`
pub type EndObserver = Box<dyn FnOnce() + Send + 'static>;

/// Persistent observer fired for every connection-level error
pub type ErrorObserver = Arc<dyn Fn(&ConnectionError) + Send + Sync + 'static>;

/// Reconnection behaviour when establishing a connection fails
///
/// `ConnectionConfig::for_node` always picks `Never`, so pool members end on
/// their first failure. `Fixed` is for `RespConnection`s built directly from
/// a hand-made `ConnectionConfig`, such as a seed connection used to fetch
/// the slot table before any pool exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Give up and move to `End` on the first failure
    #[default]
    Never,
    /// Retry connecting after a fixed delay, up to `attempts` times
    Fixed { delay: Duration, attempts: u32 },
}

/// Pool-wide connection defaults applied beneath per-node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client name announced with CLIENT SETNAME
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Defer socket establishment until first use (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_connect: Option<bool>,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            name: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            lazy_connect: None,
        }
    }
}

/// Effective configuration handed to a `ConnectionFactory`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub read_only: bool,
    pub lazy_connect: bool,
    pub enable_offline_queue: bool,
    pub retry: RetryPolicy,
    pub username: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Build the configuration for a pool-owned node connection.
    ///
    /// Per-node settings win over pool-wide defaults. Reconnection is always
    /// disabled and the offline queue always enabled: the cluster layer owns
    /// recovery by reconciling the pool again.
    pub fn for_node(node: &NodeOptions, defaults: &ConnectionDefaults, read_only: bool) -> Self {
        let overrides = &node.overrides;
        Self {
            key: node.key().to_string(),
            host: node.host().to_string(),
            port: node.port(),
            read_only,
            lazy_connect: defaults.lazy_connect.unwrap_or(true),
            enable_offline_queue: true,
            retry: RetryPolicy::Never,
            username: overrides.username.clone().or_else(|| defaults.username.clone()),
            password: overrides.password.clone().or_else(|| defaults.password.clone()),
            name: overrides.name.clone().or_else(|| defaults.name.clone()),
            connect_timeout: Duration::from_millis(
                overrides
                    .connect_timeout_ms
                    .unwrap_or(defaults.connect_timeout_ms),
            ),
        }
    }

    /// Socket address string, bracketing IPv6 literals
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// A live or pending handle to one cluster node
#[async_trait]
pub trait NodeConnection: Send + Sync + fmt::Debug {
    fn config(&self) -> &ConnectionConfig;

    /// Registry key of the node this connection serves
    fn key(&self) -> &str {
        &self.config().key
    }

    fn status(&self) -> ConnectionStatus;

    /// Receiver observing every status transition
    fn watch_status(&self) -> watch::Receiver<ConnectionStatus>;

    fn is_read_only(&self) -> bool;

    /// Update the local role flag without talking to the server
    fn set_read_only(&self, read_only: bool);

    /// Ask the node to serve reads as a replica (READONLY)
    async fn readonly(&self) -> Result<(), ConnectionError>;

    /// Ask the node to stop serving replica reads (READWRITE)
    async fn readwrite(&self) -> Result<(), ConnectionError>;

    /// Round-trip a PING
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Close the connection; it reaches `End` asynchronously
    fn disconnect(&self);

    /// Register a one-shot observer for `End`. Fires immediately when the
    /// connection has already ended.
    fn on_end(&self, observer: EndObserver);

    fn on_error(&self, observer: ErrorObserver);
}

/// Creates node connections for the pool
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, config: ConnectionConfig) -> Arc<dyn NodeConnection>;
}
