/// Pool-wide lifecycle notifications
///
/// Observers are kept per event kind in registration order and invoked
/// synchronously by the thread that performed the mutation. No lock is held
/// while a handler runs, so handlers may call back into the pool.

use crate::core::NodeConnection;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A notification published by the pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection was created and registered
    NodeAdded(Arc<dyn NodeConnection>),
    /// A connection reached `End` and left every registry
    NodeRemoved(Arc<dyn NodeConnection>),
    /// The last connection left the pool
    Drain,
    /// A member connection reported an error
    NodeError { key: String, error: ConnectionError },
    /// Every node of the latest reconciliation settled
    AllReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    NodeAdded,
    NodeRemoved,
    Drain,
    NodeError,
    AllReady,
}

impl PoolEvent {
    pub fn kind(&self) -> PoolEventKind {
        match self {
            PoolEvent::NodeAdded(_) => PoolEventKind::NodeAdded,
            PoolEvent::NodeRemoved(_) => PoolEventKind::NodeRemoved,
            PoolEvent::Drain => PoolEventKind::Drain,
            PoolEvent::NodeError { .. } => PoolEventKind::NodeError,
            PoolEvent::AllReady => PoolEventKind::AllReady,
        }
    }

    /// Connection carried by node added/removed notifications
    pub fn connection(&self) -> Option<&Arc<dyn NodeConnection>> {
        match self {
            PoolEvent::NodeAdded(conn) | PoolEvent::NodeRemoved(conn) => Some(conn),
            _ => None,
        }
    }
}

impl PoolEventKind {
    /// Wire name of the notification
    pub fn name(&self) -> &'static str {
        match self {
            PoolEventKind::NodeAdded => "+node",
            PoolEventKind::NodeRemoved => "-node",
            PoolEventKind::Drain => "drain",
            PoolEventKind::NodeError => "nodeError",
            PoolEventKind::AllReady => "+all",
        }
    }
}

impl fmt::Display for PoolEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persistent event handler
pub type EventHandler = Arc<dyn Fn(&PoolEvent) + Send + Sync + 'static>;

/// Handler removed after its first invocation
pub type OnceHandler = Box<dyn FnOnce(&PoolEvent) + Send + 'static>;

enum Subscriber {
    Persistent(EventHandler),
    Once(OnceHandler),
}

/// Ordered observer lists keyed by event kind
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<PoolEventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: PoolEventKind, handler: EventHandler) {
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(Subscriber::Persistent(handler));
    }

    /// Register `handler` for the next `kind` event unless `fired` reports
    /// that it already happened. In that case the handler is handed back to
    /// the caller to run immediately.
    ///
    /// `fired` is evaluated under the subscriber lock, so an emission racing
    /// with this call either sees the registration or `fired` sees its effect.
    pub fn once_unless<F>(&self, kind: PoolEventKind, fired: F, handler: OnceHandler) -> Option<OnceHandler>
    where
        F: FnOnce() -> bool,
    {
        let mut subscribers = self.subscribers.lock();
        if fired() {
            return Some(handler);
        }
        subscribers
            .entry(kind)
            .or_default()
            .push(Subscriber::Once(handler));
        None
    }

    /// Invoke every subscriber of the event's kind in registration order
    pub fn emit(&self, event: PoolEvent) {
        self.emit_if(event, || true);
    }

    /// Emit `event` only if `guard` holds, returning whether it did.
    ///
    /// `guard` runs under the subscriber lock and the due handlers are taken
    /// before the lock is released. A subscriber registered after a failed
    /// guard stays queued for the next emission.
    pub fn emit_if<G>(&self, event: PoolEvent, guard: G) -> bool
    where
        G: FnOnce() -> bool,
    {
        let due = {
            let mut subscribers = self.subscribers.lock();
            if !guard() {
                return false;
            }
            let Some(list) = subscribers.get_mut(&event.kind()) else {
                return true;
            };
            let taken = std::mem::take(list);
            for subscriber in &taken {
                if let Subscriber::Persistent(handler) = subscriber {
                    list.push(Subscriber::Persistent(Arc::clone(handler)));
                }
            }
            taken
        };

        for subscriber in due {
            match subscriber {
                Subscriber::Persistent(handler) => handler(&event),
                Subscriber::Once(handler) => handler(&event),
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, kind: PoolEventKind) -> usize {
        self.subscribers.lock().get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.lock();
        let counts: HashMap<&'static str, usize> = subscribers
            .iter()
            .map(|(kind, list)| (kind.name(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}
