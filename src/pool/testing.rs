/// In-memory connection doubles for pool tests

use crate::core::{
    ConnectionConfig, ConnectionFactory, ConnectionStatus, EndObserver, ErrorObserver,
    NodeConnection,
};
use crate::error::ConnectionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Connection whose status is driven by the test
pub struct MockConnection {
    config: ConnectionConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    read_only: AtomicBool,
    end_observers: Mutex<Vec<EndObserver>>,
    error_observers: Mutex<Vec<ErrorObserver>>,
    role_commands: Mutex<Vec<&'static str>>,
    fail_role_switch: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockConnection {
    pub fn new(config: ConnectionConfig, status: ConnectionStatus) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self {
            read_only: AtomicBool::new(config.read_only),
            config,
            status_tx,
            end_observers: Mutex::new(Vec::new()),
            error_observers: Mutex::new(Vec::new()),
            role_commands: Mutex::new(Vec::new()),
            fail_role_switch: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Move to `status`, firing end observers on `End`
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        if status.is_terminal() {
            let observers = std::mem::take(&mut *self.end_observers.lock());
            for observer in observers {
                observer();
            }
        }
    }

    pub fn emit_error(&self, error: ConnectionError) {
        let observers = self.error_observers.lock().clone();
        for observer in observers {
            observer(&error);
        }
    }

    pub fn fail_role_switch(&self, fail: bool) {
        self.fail_role_switch.store(fail, Ordering::SeqCst);
    }

    pub fn role_commands(&self) -> Vec<&'static str> {
        self.role_commands.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn error_observer_count(&self) -> usize {
        self.error_observers.lock().len()
    }

    fn role_switch(&self, command: &'static str) -> Result<(), ConnectionError> {
        self.role_commands.lock().push(command);
        if self.fail_role_switch.load(Ordering::SeqCst) {
            Err(ConnectionError::server(format!("ERR {} refused", command)))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("key", &self.config.key)
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

#[async_trait]
impl NodeConnection for MockConnection {
    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    async fn readonly(&self) -> Result<(), ConnectionError> {
        self.role_switch("READONLY")
    }

    async fn readwrite(&self) -> Result<(), ConnectionError> {
        self.role_switch("READWRITE")
    }

    async fn ping(&self) -> Result<(), ConnectionError> {
        match self.status() {
            ConnectionStatus::End => Err(ConnectionError::Closed),
            _ => Ok(()),
        }
    }

    /// Only records the request; tests decide when `End` arrives.
    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_end(&self, observer: EndObserver) {
        if self.status().is_terminal() {
            observer();
        } else {
            self.end_observers.lock().push(observer);
        }
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.error_observers.lock().push(observer);
    }
}

/// Factory handing out `MockConnection`s and remembering them
pub struct MockFactory {
    initial_status: Mutex<ConnectionStatus>,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Self::with_status(ConnectionStatus::Wait)
    }

    pub fn with_status(status: ConnectionStatus) -> Arc<Self> {
        Arc::new(Self {
            initial_status: Mutex::new(status),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Status given to connections created from now on
    pub fn set_initial_status(&self, status: ConnectionStatus) {
        *self.initial_status.lock() = status;
    }

    /// Most recently created connection for `key`
    pub fn connection(&self, key: &str) -> Option<Arc<MockConnection>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|conn| conn.config.key == key)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, config: ConnectionConfig) -> Arc<dyn NodeConnection> {
        let conn = Arc::new(MockConnection::new(config, *self.initial_status.lock()));
        self.created.lock().push(Arc::clone(&conn));
        conn
    }
}
