/// Connection pool and node topology manager for Redis Cluster clients
///
/// The pool keeps one connection per cluster node, indexed by node key and
/// split into master and replica views. A topology refresh hands the full
/// node list to `ConnectionPool::reset`, which creates what is missing,
/// disconnects what is gone and publishes `+all` once every node of the
/// latest refresh has settled.
pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod redis;

pub use crate::config::Config;
pub use crate::core::{
    node_key, ConnectionConfig, ConnectionDefaults, ConnectionFactory, ConnectionStatus,
    NodeConnection, NodeInput, NodeOptions, NodeRole, NodeSpec,
};
pub use crate::error::{ConnectionError, PoolError, PoolResult};
pub use crate::pool::{ConnectionPool, PoolEvent, PoolEventKind, ResetHandle};
pub use crate::redis::{RespConnection, RespConnectionFactory};
