/// Electrum protocol client
///
/// A [`Connection`] owns one transport. Requests are written through a single
/// writer task and their responses are correlated by request id by a reader
/// task, so any number of callers may have requests in flight on the same
/// connection. Notifications are fanned out to [`Subscription`]s.
use futures::Stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use super::codec::{self, Incoming, Request, RequestId, RpcError};
use super::transport::{self, BoxedStream};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::server::Server;

pub const CLIENT_NAME: &str = "electrum-sync";
pub const PROTOCOL_VERSION: &str = "1.4";

type Responder = oneshot::Sender<Result<Value, SyncError>>;

/// Requests awaiting a response, keyed by id.
pub struct PendingTable {
    capacity: usize,
    /// `None` once the id space is used up
    next_id: Option<RequestId>,
    entries: HashMap<RequestId, Responder>,
}

impl PendingTable {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    pub fn starting_at(capacity: usize, first_id: RequestId) -> Self {
        Self {
            capacity,
            next_id: Some(first_id),
            entries: HashMap::new(),
        }
    }

    /// Allocate a fresh id and park `responder` under it.
    pub fn register(&mut self, responder: Responder) -> Result<RequestId, SyncError> {
        if self.entries.len() >= self.capacity {
            return Err(SyncError::Client(format!(
                "too many pending requests ({})",
                self.capacity
            )));
        }
        let id = self
            .next_id
            .ok_or_else(|| SyncError::Client("request ids exhausted".into()))?;
        self.next_id = id.checked_add(1);
        self.insert(id, responder)?;
        Ok(id)
    }

    pub fn insert(&mut self, id: RequestId, responder: Responder) -> Result<(), SyncError> {
        if self.entries.contains_key(&id) {
            return Err(SyncError::Client(format!("duplicate request id {}", id)));
        }
        self.entries.insert(id, responder);
        Ok(())
    }

    /// Deliver a response. Returns false if nobody is waiting for `id`.
    pub fn complete(&mut self, id: RequestId, result: Result<Value, SyncError>) -> bool {
        match self.entries.remove(&id) {
            Some(responder) => responder.send(result).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, id: RequestId) {
        self.entries.remove(&id);
    }

    pub fn fail_all(&mut self, err: &SyncError) {
        for (_, responder) in self.entries.drain() {
            let _ = responder.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Subscriptions match on the method and, when given, the first parameter
/// (e.g. the script hash of `blockchain.scripthash.subscribe`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Topic {
    method: String,
    key: Option<String>,
}

impl Topic {
    fn matches(&self, method: &str, params: &[Value]) -> bool {
        if self.method != method {
            return false;
        }
        match &self.key {
            None => true,
            Some(key) => params.first().and_then(Value::as_str) == Some(key.as_str()),
        }
    }
}

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: u64,
    entries: HashMap<u64, (Topic, mpsc::UnboundedSender<Vec<Value>>)>,
}

struct Shared {
    address: String,
    pending: Mutex<PendingTable>,
    /// One permit per pending slot; callers queue here instead of
    /// overflowing the table.
    permits: Semaphore,
    subscriptions: Mutex<SubscriptionRegistry>,
    closed: AtomicBool,
    close_reason: Mutex<Option<SyncError>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, method: &str, params: Vec<Value>) {
        let mut registry = self.subscriptions();
        let mut delivered = false;
        registry.entries.retain(|_, (topic, sender)| {
            if !topic.matches(method, &params) {
                return true;
            }
            delivered = true;
            sender.send(params.clone()).is_ok()
        });
        if !delivered {
            log::debug!("{}: unsolicited notification {}", self.address, method);
        }
    }

    /// Mark closed, fail pending requests and end every subscription stream.
    fn close(&self, reason: SyncError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing connection to {}: {}", self.address, reason);
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        self.permits.close();
        self.pending().fail_all(&reason);
        self.subscriptions().entries.clear();
    }

    fn close_reason(&self) -> Option<SyncError> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct Connection {
    server: Arc<Server>,
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Wrap an established stream and start its reader and writer tasks.
    pub fn spawn(server: Arc<Server>, stream: BoxedStream, max_pending: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let max_pending = max_pending.max(1);
        let shared = Arc::new(Shared {
            address: server.address.clone(),
            pending: Mutex::new(PendingTable::new(max_pending)),
            permits: Semaphore::new(max_pending),
            subscriptions: Mutex::new(SubscriptionRegistry::default()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(read_half, shared.clone()));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, shared.clone()));

        Self {
            server,
            outbound,
            shared,
            reader,
            writer,
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> SyncError {
        self.shared
            .close_reason()
            .unwrap_or_else(|| SyncError::Disconnected(self.server.address.clone()))
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending().len()
    }

    /// Send one request and wait for its response.
    ///
    /// With `max_pending` requests already in flight the call waits for a
    /// free slot. Running out of request ids closes the connection with a
    /// [`SyncError::Client`] so the caller can start over on a fresh one.
    pub async fn request(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, SyncError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let _permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| self.closed_error())?;

        let (responder, response) = oneshot::channel();
        let registered = self.shared.pending().register(responder);
        let id = match registered {
            Ok(id) => id,
            Err(err) => {
                self.shared.close(err.clone());
                return Err(err);
            }
        };
        // Frees the slot if we time out or the caller drops this future.
        let _slot = PendingSlot {
            shared: &self.shared,
            id,
        };
        // A close racing the registration above may have missed this entry.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let line = Request::new(id, method, &params).encode()?;
        log::debug!("→ {} #{} {}", self.server.address, id, method);
        self.outbound
            .send(line)
            .map_err(|_| SyncError::Disconnected(self.server.address.clone()))?;

        match tokio::time::timeout(timeout, response).await {
            Err(_) => Err(SyncError::Timeout {
                method: method.to_string(),
                timeout,
            }),
            Ok(Err(_)) => Err(SyncError::Disconnected(self.server.address.clone())),
            Ok(Ok(result)) => result,
        }
    }

    /// Subscribe to `method`; returns the immediate result and the stream of
    /// subsequent notifications.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<(Value, Subscription), SyncError> {
        let topic = Topic {
            method: method.to_string(),
            key: params.first().and_then(Value::as_str).map(str::to_string),
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        // Registered before the request goes out so no notification is missed.
        let subscription = {
            let mut registry = self.shared.subscriptions();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.insert(id, (topic, sender));
            Subscription {
                id,
                server: self.server.clone(),
                shared: self.shared.clone(),
                receiver,
            }
        };

        let initial = self.request(method, params, timeout).await?;
        Ok((initial, subscription))
    }

    /// Close the connection; pending requests fail with `Cancelled`.
    pub fn disconnect(&self) {
        self.shared.close(SyncError::Cancelled);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct PendingSlot<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(self.id);
    }
}

/// Notification stream of one subscription. Dropping it unregisters only
/// this subscriber; the connection and other subscribers are unaffected.
pub struct Subscription {
    id: u64,
    server: Arc<Server>,
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<Vec<Value>>,
}

impl Subscription {
    pub async fn next_notification(&mut self) -> Option<Vec<Value>> {
        self.receiver.recv().await
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Why the underlying connection closed, once it has.
    pub fn close_reason(&self) -> Option<SyncError> {
        self.shared.close_reason()
    }
}

impl Stream for Subscription {
    type Item = Vec<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.subscriptions().entries.remove(&self.id);
    }
}

async fn read_loop(read_half: ReadHalf<BoxedStream>, shared: Arc<Shared>) {
    let mut lines = BufReader::new(read_half).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match codec::decode(&line) {
                    Ok(Incoming::Response { id, result }) => {
                        let result = result.map_err(rpc_error);
                        if !shared.pending().complete(id, result) {
                            log::debug!("{}: response for unknown id {}", shared.address, id);
                        }
                    }
                    Ok(Incoming::Notification { method, params }) => {
                        shared.dispatch(&method, params);
                    }
                    Err(err) => {
                        log::warn!("{}: {}", shared.address, err);
                        break err;
                    }
                }
            }
            Ok(None) => break SyncError::Disconnected(shared.address.clone()),
            Err(err) => {
                log::debug!("{}: read failed: {}", shared.address, err);
                break SyncError::Disconnected(shared.address.clone());
            }
        }
    };
    shared.close(reason);
}

async fn write_loop(
    mut write_half: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
) {
    while let Some(line) = outbound.recv().await {
        let written = async {
            write_half.write_all(line.as_bytes()).await?;
            write_half.flush().await
        }
        .await;
        if let Err(err) = written {
            log::debug!("{}: write failed: {}", shared.address, err);
            shared.close(SyncError::Disconnected(shared.address.clone()));
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

fn rpc_error(err: RpcError) -> SyncError {
    SyncError::Rpc {
        code: err.code,
        message: err.message,
    }
}

/// Opens connections and performs the version handshake.
#[derive(Clone)]
pub struct ProtocolClient {
    connect_timeout: Duration,
    max_pending: usize,
}

impl ProtocolClient {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            max_pending: config.max_pending_requests,
        }
    }

    pub async fn connect(&self, server: Arc<Server>) -> Result<Connection, SyncError> {
        let stream = transport::open(&server, self.connect_timeout).await?;
        let connection = Connection::spawn(server.clone(), stream, self.max_pending);

        let version = connection
            .request(
                "server.version",
                vec![json!(CLIENT_NAME), json!(PROTOCOL_VERSION)],
                self.connect_timeout,
            )
            .await
            .map_err(|e| SyncError::connect(&server.address, e))?;
        log::info!("Connected to {} ({})", server, version);

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{TransportKind, TrustAnchor};
    use tokio::io::AsyncReadExt;

    fn responder() -> (Responder, oneshot::Receiver<Result<Value, SyncError>>) {
        oneshot::channel()
    }

    #[test]
    fn test_pending_table_capacity() {
        let mut table = PendingTable::new(2);
        table.register(responder().0).unwrap();
        table.register(responder().0).unwrap();
        let err = table.register(responder().0).unwrap_err();
        assert!(matches!(&err, SyncError::Client(msg) if msg.contains("too many pending")));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pending_table_id_exhaustion() {
        let mut table = PendingTable::starting_at(8, RequestId::MAX);
        assert_eq!(table.register(responder().0).unwrap(), RequestId::MAX);
        let err = table.register(responder().0).unwrap_err();
        assert!(matches!(&err, SyncError::Client(msg) if msg.contains("exhausted")));
    }

    #[test]
    fn test_pending_table_duplicate_id() {
        let mut table = PendingTable::starting_at(8, 5);
        assert_eq!(table.register(responder().0).unwrap(), 5);
        let err = table.insert(5, responder().0).unwrap_err();
        assert!(matches!(&err, SyncError::Client(msg) if msg == "duplicate request id 5"));
    }

    #[test]
    fn test_pending_table_complete_and_fail() {
        let mut table = PendingTable::new(8);
        let (tx, mut rx) = responder();
        let id = table.register(tx).unwrap();
        assert!(table.complete(id, Ok(json!(1))));
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(1));
        assert!(!table.complete(id, Ok(json!(2))));

        let (tx, mut rx) = responder();
        table.register(tx).unwrap();
        table.fail_all(&SyncError::Disconnected("x:1".into()));
        assert!(table.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Err(SyncError::Disconnected(_))));
    }

    fn in_memory_server() -> Arc<Server> {
        Arc::new(Server {
            address: "memory:1".into(),
            transport: TransportKind::Plaintext,
            trust_anchor: TrustAnchor::None,
        })
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::spawn(in_memory_server(), Box::new(client_side), 16));

        let server = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server_side);
            let mut lines = BufReader::new(read_half).lines();
            let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            // Answer in reverse order.
            for req in [&second, &first] {
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"][0]});
                write_half
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
            write_half
        });

        let a = connection.request("echo", vec![json!("a")], Duration::from_secs(5));
        let b = connection.request("echo", vec![json!("b")], Duration::from_secs(5));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(connection.pending_requests(), 0);
        drop(server.await.unwrap());
    }

    /// Echoes the first parameter back; `"fail"` gets an error reply.
    fn spawn_echo(server_side: tokio::io::DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server_side);
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = if req["params"][0] == "fail" {
                    json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": 2, "message": "no such thing"}})
                } else {
                    json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"][0]})
                };
                if write_half.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                    return;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_requests_beyond_capacity_wait_for_a_slot() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connection = Connection::spawn(in_memory_server(), Box::new(client_side), 2);
        let _server = spawn_echo(server_side);

        let results = futures::future::join_all(
            (0..10).map(|i| connection.request("echo", vec![json!(i)], Duration::from_secs(5))),
        )
        .await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
        assert_eq!(connection.pending_requests(), 0);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_error_reply_keeps_connection_open() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connection = Connection::spawn(in_memory_server(), Box::new(client_side), 4);
        let _server = spawn_echo(server_side);

        let err = connection
            .request("echo", vec![json!("fail")], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Rpc {
                code: 2,
                message: "no such thing".into()
            }
        );
        assert!(!err.is_transient());
        assert!(!connection.is_closed());
        let ok = connection.request("echo", vec![json!("ok")], Duration::from_secs(5)).await;
        assert_eq!(ok.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_timeout_frees_pending_slot() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let connection = Connection::spawn(in_memory_server(), Box::new(client_side), 16);

        let err = connection
            .request("server.ping", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(connection.pending_requests(), 0);

        let mut buf = [0u8; 64];
        assert!(server_side.read(&mut buf).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_requests() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connection = Connection::spawn(in_memory_server(), Box::new(client_side), 16);
        drop(server_side);

        let err = connection
            .request("server.ping", vec![], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Disconnected(_)));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_subscription_keeps_others() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connection = Connection::spawn(in_memory_server(), Box::new(client_side), 16);

        let server = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server_side);
            let mut lines = BufReader::new(read_half).lines();
            for _ in 0..2 {
                let req: Value =
                    serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"height": 1}});
                write_half.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
            (lines, write_half)
        });

        let timeout = Duration::from_secs(5);
        let (_, first) = connection
            .subscribe("blockchain.headers.subscribe", vec![], timeout)
            .await
            .unwrap();
        let (initial, mut second) = connection
            .subscribe("blockchain.headers.subscribe", vec![], timeout)
            .await
            .unwrap();
        assert_eq!(initial["height"], 1);
        drop(first);

        let (_lines, mut write_half) = server.await.unwrap();
        let note = json!({"jsonrpc": "2.0", "method": "blockchain.headers.subscribe", "params": [{"height": 2}]});
        write_half.write_all(format!("{}\n", note).as_bytes()).await.unwrap();

        let params = second.next_notification().await.unwrap();
        assert_eq!(params[0]["height"], 2);
        assert!(!connection.is_closed());
    }
}
