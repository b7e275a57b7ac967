/// Connection pool for Redis Cluster nodes
///
/// The pool owns one connection per cluster node and keeps three views of
/// them (all nodes, primaries, replicas). The topology layer drives it with
/// `reset` whenever it learns a new node list; `on_ready` lets callers wait
/// until every node of the latest list has settled.
///
/// Overlapping resets are not serialized. Each one captures an epoch and
/// only the reset whose epoch is still current when its waits finish may
/// declare the pool ready.
pub mod events;
pub mod options;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use crate::core::{
    ConnectionConfig, ConnectionDefaults, ConnectionFactory, ConnectionStatus, NodeConnection,
    NodeOptions, NodeRole, NodeSpec,
};
use crate::error::{ConnectionError, PoolError, PoolResult};
use events::EventBus;
pub use events::{EventHandler, OnceHandler, PoolEvent, PoolEventKind};
use futures::future::join_all;
use options::OptionsMemory;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use registry::NodeRegistry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Epochs wrap back to zero after the signed 32-bit maximum
const EPOCH_WRAP: u32 = i32::MAX as u32;

/// Cluster node connection pool. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    defaults: ConnectionDefaults,
    state: Mutex<PoolState>,
    events: EventBus,
    epoch: AtomicU32,
    ready: AtomicBool,
}

struct PoolState {
    registry: NodeRegistry,
    options: OptionsMemory,
}

/// How `find_or_create` satisfied a lookup
enum Lookup {
    Existing,
    RoleChanged,
    Created,
}

/// Convergence of one `reset` call
///
/// Resolves to `true` when this call declared the pool ready and `false`
/// when a newer reset superseded it. Dropping the handle does not stop
/// convergence.
#[derive(Debug)]
pub struct ResetHandle {
    epoch: u32,
    task: JoinHandle<bool>,
}

impl ResetHandle {
    /// Epoch captured by the reset that produced this handle
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl Future for ResetHandle {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(declared)) => Poll::Ready(declared),
            Poll::Ready(Err(_)) => Poll::Ready(false),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, defaults: ConnectionDefaults) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                defaults,
                state: Mutex::new(PoolState {
                    registry: NodeRegistry::new(),
                    options: OptionsMemory::new(),
                }),
                events: EventBus::new(),
                epoch: AtomicU32::new(0),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Return the connection for `node`, creating it when the key is unseen.
    ///
    /// An existing connection whose role differs from `read_only` is switched
    /// in place: the registry moves it between primaries and replicas and a
    /// READONLY/READWRITE command is dispatched without waiting for the reply.
    pub fn find_or_create(&self, node: NodeOptions, read_only: bool) -> Arc<dyn NodeConnection> {
        let (conn, lookup) = {
            let mut state = self.inner.state.lock();
            let node = state.options.merge(node);
            let key = node.key().to_string();

            match state.registry.get(&key) {
                Some(existing) if existing.is_read_only() != read_only => {
                    existing.set_read_only(read_only);
                    state.registry.set_role(&key, read_only);
                    (existing, Lookup::RoleChanged)
                }
                Some(existing) => (existing, Lookup::Existing),
                None => {
                    let config = ConnectionConfig::for_node(&node, &self.inner.defaults, read_only);
                    let conn = self.inner.factory.create(config);
                    state.registry.insert(key, Arc::clone(&conn), read_only);
                    (conn, Lookup::Created)
                }
            }
        };

        match lookup {
            Lookup::Existing => {}
            Lookup::RoleChanged => {
                debug!(
                    "Node {} switched to {}",
                    conn.key(),
                    NodeRole::for_read_only(read_only)
                );
                dispatch_role_switch(Arc::clone(&conn), read_only);
            }
            Lookup::Created => {
                debug!(
                    "Node {} added as {}",
                    conn.key(),
                    NodeRole::for_read_only(read_only)
                );
                // +node goes out first: a connection that has already ended
                // fires its end observer on attach
                self.inner.events.emit(PoolEvent::NodeAdded(Arc::clone(&conn)));
                self.attach_end_observer(&conn);
                self.attach_error_observer(&conn);
            }
        }

        conn
    }

    /// Converge the pool to exactly `nodes`.
    ///
    /// Every entry is validated before anything changes; an entry that cannot
    /// be normalized fails the whole call. Nodes missing from the list are
    /// disconnected, the rest are found or created, and once every one of
    /// them has settled the pool emits `+all` unless a newer reset started
    /// in the meantime. Must be called from within a tokio runtime.
    pub fn reset<I>(&self, nodes: I) -> PoolResult<ResetHandle>
    where
        I: IntoIterator,
        I::Item: Into<NodeSpec>,
    {
        let targets = normalize_targets(nodes)?;
        let runtime = Handle::try_current()
            .map_err(|_| PoolError::internal("reset must be called within a tokio runtime"))?;

        let epoch = {
            let _state = self.inner.state.lock();
            self.inner.ready.store(false, Ordering::SeqCst);
            self.inner.advance_epoch()
        };
        debug!("Reset #{} towards {} nodes", epoch, targets.len());

        let wanted: HashSet<&str> = targets.iter().map(NodeOptions::key).collect();
        let stale: Vec<Arc<dyn NodeConnection>> = {
            let state = self.inner.state.lock();
            state
                .registry
                .view(NodeRole::All)
                .iter()
                .filter(|(key, _)| !wanted.contains(key.as_str()))
                .map(|(_, conn)| Arc::clone(conn))
                .collect()
        };
        for conn in stale {
            debug!("Disconnecting node {} no longer in topology", conn.key());
            conn.disconnect();
        }

        let mut pending = Vec::new();
        for node in targets {
            let read_only = node.read_only;
            let conn = self.find_or_create(node, read_only);
            if !conn.status().is_settled() {
                pending.push(wait_settled(conn.watch_status()));
            }
        }

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            join_all(pending).await;
            inner.complete_reset(epoch)
        });

        Ok(ResetHandle { epoch, task })
    }

    /// Disconnect every node; the pool emits `drain` once the last one ends.
    pub fn disconnect_all(&self) -> PoolResult<ResetHandle> {
        self.reset(Vec::<NodeSpec>::new())
    }

    /// Run `handler` once the pool is ready: now if it already is, otherwise
    /// on the next `+all`. Handlers fire in registration order.
    pub fn on_ready<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let handed_back = inner.events.once_unless(
            PoolEventKind::AllReady,
            || inner.ready.load(Ordering::SeqCst),
            Box::new(move |_: &PoolEvent| handler()),
        );
        if let Some(handler) = handed_back {
            handler(&PoolEvent::AllReady);
        }
    }

    /// Wait until the pool is ready
    pub async fn ready(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_ready(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Observe every future event of `kind`
    pub fn subscribe<F>(&self, kind: PoolEventKind, handler: F)
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.inner.events.subscribe(kind, handler);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn NodeConnection>> {
        self.inner.state.lock().registry.get(key)
    }

    pub fn nodes(&self, role: NodeRole) -> Vec<Arc<dyn NodeConnection>> {
        self.inner.state.lock().registry.nodes(role)
    }

    /// Sorted node keys of one registry view
    pub fn keys(&self, role: NodeRole) -> Vec<String> {
        self.inner.state.lock().registry.keys(role)
    }

    /// A random node of the given role, if any
    pub fn sample(&self, role: NodeRole) -> Option<Arc<dyn NodeConnection>> {
        let nodes = self.nodes(role);
        nodes.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().registry.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u32 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Remembered options for `key`
    pub fn node_options(&self, key: &str) -> Option<NodeOptions> {
        self.inner.state.lock().options.get(key).cloned()
    }

    /// Whether the role views still partition the full registry
    pub fn is_consistent(&self) -> bool {
        self.inner.state.lock().registry.is_consistent()
    }

    fn attach_end_observer(&self, conn: &Arc<dyn NodeConnection>) {
        let pool = Arc::downgrade(&self.inner);
        let member = Arc::downgrade(conn);
        let key = conn.key().to_string();
        conn.on_end(Box::new(move || {
            if let (Some(inner), Some(conn)) = (pool.upgrade(), member.upgrade()) {
                inner.handle_end(&key, conn);
            }
        }));
    }

    fn attach_error_observer(&self, conn: &Arc<dyn NodeConnection>) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let key = conn.key().to_string();
        conn.on_error(Arc::new(move |error: &ConnectionError| {
            if let Some(inner) = pool.upgrade() {
                if error.is_recoverable() {
                    warn!("Node {} error: {}", key, error);
                } else {
                    error!("Node {} error: {}", key, error);
                }
                inner.events.emit(PoolEvent::NodeError {
                    key: key.clone(),
                    error: error.clone(),
                });
            }
        }));
    }
}

impl PoolInner {
    fn advance_epoch(&self) -> u32 {
        let current = self.epoch.load(Ordering::SeqCst);
        let next = if current >= EPOCH_WRAP { 0 } else { current + 1 };
        self.epoch.store(next, Ordering::SeqCst);
        next
    }

    fn handle_end(&self, key: &str, conn: Arc<dyn NodeConnection>) {
        let (removed, drained) = {
            let mut state = self.state.lock();
            let removed = state.registry.remove_if_same(key, &conn);
            (removed, removed && state.registry.is_empty())
        };
        if !removed {
            return;
        }

        debug!("Node {} removed", key);
        self.events.emit(PoolEvent::NodeRemoved(conn));
        if drained {
            info!("Connection pool drained");
            self.events.emit(PoolEvent::Drain);
        }
    }

    /// Declare the pool ready if `epoch` is still current.
    ///
    /// The epoch check, the ready flag and the selection of `+all` handlers
    /// happen under the subscriber lock. A newer reset therefore either
    /// fails the check or runs after the handlers were taken, and an
    /// `on_ready` registered after that reset waits for its own `+all`.
    fn complete_reset(&self, epoch: u32) -> bool {
        let declared = self.events.emit_if(PoolEvent::AllReady, || {
            let _state = self.state.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            self.ready.store(true, Ordering::SeqCst);
            info!("Connection pool ready (reset #{})", epoch);
            true
        });
        if !declared {
            trace!("Reset #{} superseded, discarding completion", epoch);
        }
        declared
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("masters", &state.registry.keys(NodeRole::Master))
            .field("slaves", &state.registry.keys(NodeRole::Slave))
            .field("epoch", &self.epoch())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Resolve every entry and collapse duplicate keys, last entry winning.
/// Order of first appearance is kept.
fn normalize_targets<I>(nodes: I) -> PoolResult<Vec<NodeOptions>>
where
    I: IntoIterator,
    I::Item: Into<NodeSpec>,
{
    let mut targets: Vec<NodeOptions> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for entry in nodes {
        let node = entry.into().resolve()?;
        match positions.get(node.key()) {
            Some(&index) => targets[index] = node,
            None => {
                positions.insert(node.key().to_string(), targets.len());
                targets.push(node);
            }
        }
    }

    Ok(targets)
}

/// Resolves once the watched connection reaches a settled status.
/// A connection that goes away entirely counts as settled.
async fn wait_settled(mut status: watch::Receiver<ConnectionStatus>) {
    let _ = status.wait_for(|status| status.is_settled()).await;
}

/// Send READONLY/READWRITE in the background. Failures are only logged:
/// the registry already reflects the new role and the next reconciliation
/// corrects a node that did not follow.
fn dispatch_role_switch(conn: Arc<dyn NodeConnection>, read_only: bool) {
    let Ok(runtime) = Handle::try_current() else {
        warn!(
            "No runtime available, role switch for {} not sent",
            conn.key()
        );
        return;
    };
    runtime.spawn(async move {
        let result = if read_only {
            conn.readonly().await
        } else {
            conn.readwrite().await
        };
        if let Err(e) = result {
            debug!("Role switch for {} failed: {}", conn.key(), e);
        }
    });
}
