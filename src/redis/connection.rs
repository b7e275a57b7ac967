/// RESP connection to a single cluster node
///
/// Commands are queued on an unbounded channel and served one at a time by
/// a driver task that owns the socket. The driver is spawned on first use
/// unless the connection is configured to connect eagerly.

use super::resp::{RespEncoder, RespParser, RespValue};
use crate::core::{
    ConnectionConfig, ConnectionFactory, ConnectionStatus, EndObserver, ErrorObserver,
    NodeConnection, RetryPolicy,
};
use crate::error::ConnectionError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

type Reply = Result<RespValue, ConnectionError>;

struct Request {
    frame: Bytes,
    reply: oneshot::Sender<Reply>,
}

struct Shared {
    config: ConnectionConfig,
    status: watch::Sender<ConnectionStatus>,
    read_only: AtomicBool,
    queue: mpsc::UnboundedSender<Request>,
    /// Receiving half, parked here until the driver starts
    pending: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    shutdown: Notify,
    last_error: Mutex<Option<ConnectionError>>,
    end_observers: Mutex<Vec<EndObserver>>,
    error_observers: Mutex<Vec<ErrorObserver>>,
}

pub struct RespConnection {
    shared: Arc<Shared>,
}

impl RespConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Wait);
        let (queue, pending) = mpsc::unbounded_channel();
        let connection = Self {
            shared: Arc::new(Shared {
                read_only: AtomicBool::new(config.read_only),
                config,
                status,
                queue,
                pending: Mutex::new(Some(pending)),
                shutdown: Notify::new(),
                last_error: Mutex::new(None),
                end_observers: Mutex::new(Vec::new()),
                error_observers: Mutex::new(Vec::new()),
            }),
        };
        if !connection.shared.config.lazy_connect {
            connection.start();
        }
        connection
    }

    /// Connect now and wait for the handshake to finish
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.start();
        let mut status = self.shared.status.subscribe();
        let settled = status
            .wait_for(|s| matches!(s, ConnectionStatus::Ready | ConnectionStatus::End))
            .await
            .map(|s| *s);
        match settled {
            Ok(ConnectionStatus::Ready) => Ok(()),
            _ => Err(self
                .shared
                .last_error
                .lock()
                .clone()
                .unwrap_or(ConnectionError::Closed)),
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// Error replies are returned as `ConnectionError::Server`. While the
    /// connection is not ready the command waits in the offline queue.
    pub async fn send_command(&self, args: &[&str]) -> Result<RespValue, ConnectionError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(ConnectionError::Closed);
        }
        if status != ConnectionStatus::Ready && !self.shared.config.enable_offline_queue {
            return Err(ConnectionError::NotReady);
        }

        let (reply, response) = oneshot::channel();
        self.shared
            .queue
            .send(Request {
                frame: RespEncoder::command(args),
                reply,
            })
            .map_err(|_| ConnectionError::Closed)?;
        self.start();

        match response.await {
            Ok(Ok(RespValue::Error(message))) => Err(ConnectionError::server(message)),
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    /// Spawn the driver if the connection is still waiting
    fn start(&self) {
        let started = self.shared.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Wait {
                *status = ConnectionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }
        let Some(requests) = self.shared.pending.lock().take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drive(Arc::clone(&self.shared), requests));
            }
            Err(_) => {
                warn!(
                    node = %self.shared.config.key,
                    "No async runtime available, connection cannot start"
                );
                self.shared.finish(requests, Some(ConnectionError::NotReady));
            }
        }
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn report(&self, error: &ConnectionError) {
        debug!(node = %self.config.key, error = %error, "Connection error");
        let observers = self.error_observers.lock().clone();
        for observer in observers {
            observer(error);
        }
    }

    /// Fail whatever is still queued, move to `End` and fire end observers
    fn finish(&self, mut requests: mpsc::UnboundedReceiver<Request>, error: Option<ConnectionError>) {
        if let Some(error) = error {
            *self.last_error.lock() = Some(error);
        }
        if *self.status.borrow() != ConnectionStatus::End {
            self.set_status(ConnectionStatus::Close);
        }

        requests.close();
        while let Ok(request) = requests.try_recv() {
            let _ = request.reply.send(Err(ConnectionError::Closed));
        }

        self.set_status(ConnectionStatus::End);
        debug!(node = %self.config.key, "Connection ended");
        let observers = std::mem::take(&mut *self.end_observers.lock());
        for observer in observers {
            observer();
        }
    }
}

/// Driver task: connect, then serve queued commands until shutdown or failure
async fn drive(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<Request>) {
    let established = tokio::select! {
        result = establish(&shared) => Some(result),
        _ = shared.shutdown.notified() => None,
    };
    let mut stream = match established {
        Some(Ok(stream)) => stream,
        Some(Err(error)) => {
            shared.report(&error);
            shared.finish(requests, Some(error));
            return;
        }
        None => {
            shared.finish(requests, None);
            return;
        }
    };

    shared.set_status(ConnectionStatus::Ready);
    debug!(node = %shared.config.key, "Connection ready");

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let failure = loop {
        tokio::select! {
            _ = shared.shutdown.notified() => break None,
            request = requests.recv() => {
                let Some(request) = request else {
                    break None;
                };
                match round_trip(&mut stream, &mut buf, &request.frame).await {
                    Ok(value) => {
                        let _ = request.reply.send(Ok(value));
                    }
                    Err(error) => {
                        shared.report(&error);
                        let _ = request.reply.send(Err(error.clone()));
                        break Some(error);
                    }
                }
            }
        }
    };

    if failure.is_none() {
        let _ = stream.shutdown().await;
    }
    shared.finish(requests, failure);
}

/// Open the socket and run the handshake, retrying per the retry policy
async fn establish(shared: &Shared) -> Result<TcpStream, ConnectionError> {
    let mut attempt = 0;
    loop {
        match open(shared).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                let RetryPolicy::Fixed { delay, attempts } = shared.config.retry else {
                    return Err(error);
                };
                if attempt >= attempts {
                    return Err(error);
                }
                attempt += 1;
                shared.report(&error);
                debug!(
                    node = %shared.config.key,
                    attempt,
                    "Retrying connection in {:?}",
                    delay
                );
                shared.set_status(ConnectionStatus::Reconnecting);
                tokio::time::sleep(delay).await;
                shared.set_status(ConnectionStatus::Connecting);
            }
        }
    }
}

async fn open(shared: &Shared) -> Result<TcpStream, ConnectionError> {
    let config = &shared.config;
    let addr = config.addr();
    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectionError::timeout(&addr))??;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    shared.set_status(ConnectionStatus::Connect);

    handshake(shared, &mut stream).await?;
    Ok(stream)
}

/// AUTH failures abort the connection. A rejected client name or READONLY
/// is logged and the connection is used anyway.
async fn handshake(shared: &Shared, stream: &mut TcpStream) -> Result<(), ConnectionError> {
    let config = &shared.config;
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    if let Some(password) = &config.password {
        let mut auth = vec!["AUTH"];
        if let Some(username) = &config.username {
            auth.push(username.as_str());
        }
        auth.push(password.as_str());
        if let RespValue::Error(message) = round_trip(stream, &mut buf, &RespEncoder::command(&auth)).await? {
            return Err(ConnectionError::server(message));
        }
    }

    if shared.read_only.load(Ordering::SeqCst) {
        let command = RespEncoder::command(&["READONLY"]);
        if let RespValue::Error(message) = round_trip(stream, &mut buf, &command).await? {
            debug!(node = %config.key, "READONLY rejected: {}", message);
        }
    }

    if let Some(name) = &config.name {
        let command = RespEncoder::command(&["CLIENT", "SETNAME", name.as_str()]);
        if let RespValue::Error(message) = round_trip(stream, &mut buf, &command).await? {
            debug!(node = %config.key, "CLIENT SETNAME rejected: {}", message);
        }
    }

    Ok(())
}

async fn round_trip(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    frame: &[u8],
) -> Result<RespValue, ConnectionError> {
    stream.write_all(frame).await?;
    loop {
        if let Some(value) =
            RespParser::parse(buf).map_err(|e| ConnectionError::protocol(e.to_string()))?
        {
            return Ok(value);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server").into());
        }
    }
}

impl fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespConnection")
            .field("key", &self.shared.config.key)
            .field("status", &*self.shared.status.borrow())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

#[async_trait]
impl NodeConnection for RespConnection {
    fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::SeqCst)
    }

    fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::SeqCst);
    }

    async fn readonly(&self) -> Result<(), ConnectionError> {
        self.send_command(&["READONLY"]).await.map(|_| ())
    }

    async fn readwrite(&self) -> Result<(), ConnectionError> {
        self.send_command(&["READWRITE"]).await.map(|_| ())
    }

    async fn ping(&self) -> Result<(), ConnectionError> {
        match self.send_command(&["PING"]).await? {
            RespValue::SimpleString(reply) if reply == "PONG" => Ok(()),
            other => Err(ConnectionError::protocol(format!(
                "Unexpected PING response: {:?}",
                other
            ))),
        }
    }

    fn disconnect(&self) {
        // never connected: nothing to close, end right away
        let never_started = self.shared.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Wait {
                *status = ConnectionStatus::End;
                true
            } else {
                false
            }
        });
        if never_started {
            let requests = self.shared.pending.lock().take();
            if let Some(requests) = requests {
                self.shared.finish(requests, None);
            }
            return;
        }
        self.shared.shutdown.notify_one();
    }

    fn on_end(&self, observer: EndObserver) {
        let mut observers = self.shared.end_observers.lock();
        if self.status().is_terminal() {
            drop(observers);
            observer();
        } else {
            observers.push(observer);
        }
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.shared.error_observers.lock().push(observer);
    }
}

/// Factory producing `RespConnection`s
#[derive(Debug, Default, Clone, Copy)]
pub struct RespConnectionFactory;

impl ConnectionFactory for RespConnectionFactory {
    fn create(&self, config: ConnectionConfig) -> Arc<dyn NodeConnection> {
        Arc::new(RespConnection::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionDefaults, NodeOptions};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeServer {
        addr: SocketAddr,
        commands: Arc<Mutex<Vec<String>>>,
    }

    /// Minimal RESP server answering PING, AUTH and everything else with OK
    async fn fake_server(password: Option<&'static str>) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        match socket.read_buf(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        while let Ok(Some(RespValue::Array(Some(args)))) = RespParser::parse(&mut buf) {
                            let args: Vec<String> = args
                                .iter()
                                .filter_map(|arg| arg.as_str().map(str::to_string))
                                .collect();
                            log.lock().push(args.join(" "));
                            let reply = reply_for(&args, password);
                            if socket.write_all(&RespEncoder::encode(&reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        FakeServer { addr, commands }
    }

    fn reply_for(args: &[String], password: Option<&str>) -> RespValue {
        match args.first().map(|cmd| cmd.to_ascii_uppercase()).as_deref() {
            Some("PING") => RespValue::SimpleString("PONG".to_string()),
            Some("AUTH") if args.last().map(String::as_str) != password => {
                RespValue::Error("WRONGPASS invalid username-password pair".to_string())
            }
            Some("GET") => RespValue::BulkString(None),
            _ => RespValue::SimpleString("OK".to_string()),
        }
    }

    /// Address with nothing listening on it
    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn config_for(addr: SocketAddr, read_only: bool) -> ConnectionConfig {
        ConnectionConfig::for_node(
            &NodeOptions::new(addr.ip().to_string(), addr.port()),
            &ConnectionDefaults::default(),
            read_only,
        )
    }

    async fn wait_for_status(conn: &RespConnection, expected: ConnectionStatus) {
        let mut status = conn.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_lazy_connection_waits_for_first_use() {
        let server = fake_server(None).await;
        let conn = RespConnection::new(config_for(server.addr, false));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.status(), ConnectionStatus::Wait);
        assert!(server.commands.lock().is_empty());

        // first command connects through the offline queue
        tokio::time::timeout(WAIT, conn.ping()).await.unwrap().unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Ready);
        assert_eq!(*server.commands.lock(), vec!["PING"]);
    }

    #[tokio::test]
    async fn test_eager_connection_connects_immediately() {
        let server = fake_server(None).await;
        let mut config = config_for(server.addr, false);
        config.lazy_connect = false;

        let conn = RespConnection::new(config);
        wait_for_status(&conn, ConnectionStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_handshake_commands() {
        let server = fake_server(Some("secret")).await;
        let mut config = config_for(server.addr, true);
        config.username = Some("app".to_string());
        config.password = Some("secret".to_string());
        config.name = Some("pool-client".to_string());

        let conn = RespConnection::new(config);
        tokio::time::timeout(WAIT, conn.connect()).await.unwrap().unwrap();
        assert_eq!(
            *server.commands.lock(),
            vec!["AUTH app secret", "READONLY", "CLIENT SETNAME pool-client"]
        );
    }

    #[tokio::test]
    async fn test_rejected_auth_ends_connection() {
        let server = fake_server(Some("secret")).await;
        let mut config = config_for(server.addr, false);
        config.password = Some("wrong".to_string());

        let conn = RespConnection::new(config);
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        conn.on_error(Arc::new(move |_: &ConnectionError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let result = tokio::time::timeout(WAIT, conn.connect()).await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Server { .. })));
        assert_eq!(conn.status(), ConnectionStatus::End);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_fails_queued_commands() {
        let conn = RespConnection::new(config_for(closed_addr().await, false));
        let ended = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ended);
        conn.on_end(Box::new(move || flag.store(true, Ordering::SeqCst)));

        let result = tokio::time::timeout(WAIT, conn.send_command(&["GET", "k"])).await.unwrap();
        assert!(result.is_err());
        wait_for_status(&conn, ConnectionStatus::End).await;
        assert!(ended.load(Ordering::SeqCst));

        // nothing is accepted once ended
        assert!(matches!(conn.send_command(&["PING"]).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_fixed_retry_reports_every_failure() {
        let mut config = config_for(closed_addr().await, false);
        config.retry = RetryPolicy::Fixed {
            delay: Duration::from_millis(5),
            attempts: 2,
        };
        let conn = RespConnection::new(config);
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        conn.on_error(Arc::new(move |_: &ConnectionError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut status = conn.watch_status();
        let reconnecting = tokio::spawn(async move {
            status.wait_for(|s| *s == ConnectionStatus::Reconnecting).await.is_ok()
        });

        assert!(tokio::time::timeout(WAIT, conn.connect()).await.unwrap().is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert!(tokio::time::timeout(WAIT, reconnecting).await.unwrap().unwrap());
        assert_eq!(conn.status(), ConnectionStatus::End);
    }

    #[tokio::test]
    async fn test_disconnect_before_connecting_ends_immediately() {
        let conn = RespConnection::new(config_for(closed_addr().await, false));
        let ended = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ended);
        conn.on_end(Box::new(move || flag.store(true, Ordering::SeqCst)));

        conn.disconnect();
        assert_eq!(conn.status(), ConnectionStatus::End);
        assert!(ended.load(Ordering::SeqCst));

        // late observers fire right away
        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        conn.on_end(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_ready_connection() {
        let server = fake_server(None).await;
        let conn = RespConnection::new(config_for(server.addr, false));
        tokio::time::timeout(WAIT, conn.connect()).await.unwrap().unwrap();

        conn.disconnect();
        wait_for_status(&conn, ConnectionStatus::End).await;
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let server = fake_server(Some("secret")).await;
        let conn = RespConnection::new(config_for(server.addr, false));

        let result = tokio::time::timeout(WAIT, conn.send_command(&["AUTH", "nope"])).await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Server { .. })));
        // an error reply does not break the connection
        assert_eq!(conn.status(), ConnectionStatus::Ready);
        assert!(conn.readwrite().await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_queue_disabled() {
        let mut config = config_for(closed_addr().await, false);
        config.enable_offline_queue = false;
        let conn = RespConnection::new(config);

        assert!(matches!(conn.send_command(&["PING"]).await, Err(ConnectionError::NotReady)));
        assert_eq!(conn.status(), ConnectionStatus::Wait);
    }

    #[test]
    fn test_factory_creates_lazy_connections() {
        let config = ConnectionConfig::for_node(
            &NodeOptions::new("127.0.0.1", 7000),
            &ConnectionDefaults::default(),
            true,
        );
        let conn = RespConnectionFactory.create(config);
        assert_eq!(conn.key(), "127.0.0.1:7000");
        assert_eq!(conn.status(), ConnectionStatus::Wait);
        assert!(conn.is_read_only());
    }
}
