//! Failover Controller
//!
//! Wraps the protocol client over a [`ServerPool`]. Callers hand it an
//! operation; it runs the operation on the current server's connection and,
//! when that server fails, marks it unreachable, moves to the next server in
//! pool order and runs the same operation again. A server that failed is
//! skipped until its cooldown (exponential backoff, capped) expires.
//!
//! The controller keeps no chain or account state: only which server is
//! current, its live connection, and per-server cooldown timers.

mod subscription;

pub use subscription::{FailoverSubscription, SubscriptionEvent};

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::protocol::{Connection, ProtocolClient};
use crate::server::{HealthState, Server, ServerPool};

#[derive(Debug, Default, Clone, Copy)]
struct Cooldown {
    failures: u32,
    retry_at: Option<Instant>,
    timeouts: u32,
}

struct Active {
    index: usize,
    connection: Option<Arc<Connection>>,
}

enum Acquired {
    Ready(Arc<Server>, Arc<Connection>),
    ConnectFailed(Arc<Server>, SyncError),
    NoneAvailable,
}

pub struct FailoverController {
    pool: Arc<ServerPool>,
    client: ProtocolClient,
    config: SyncConfig,
    active: tokio::sync::Mutex<Active>,
    cooldowns: Mutex<HashMap<String, Cooldown>>,
}

impl FailoverController {
    pub fn new(pool: Arc<ServerPool>, config: &SyncConfig) -> Self {
        Self {
            pool,
            client: ProtocolClient::new(config),
            config: config.clone(),
            active: tokio::sync::Mutex::new(Active {
                index: 0,
                connection: None,
            }),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    fn cooldowns(&self) -> MutexGuard<'_, HashMap<String, Cooldown>> {
        self.cooldowns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Server whose connection is currently live, if any.
    pub async fn current_server(&self) -> Option<Arc<Server>> {
        let active = self.active.lock().await;
        active
            .connection
            .as_ref()
            .filter(|c| !c.is_closed())
            .map(|c| c.server().clone())
    }

    /// Time left before `server` may be tried again.
    pub fn cooldown_remaining(&self, server: &Server) -> Option<Duration> {
        let now = Instant::now();
        self.cooldowns()
            .get(&server.address)
            .and_then(|c| c.retry_at)
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    fn is_selectable(&self, server: &Server, now: Instant) -> bool {
        if self.pool.health(server) == Some(HealthState::Banned) {
            return false;
        }
        self.cooldowns()
            .get(&server.address)
            .and_then(|c| c.retry_at)
            .map_or(true, |at| at <= now)
    }

    /// Run `op` against the active connection, failing over on transient errors.
    ///
    /// Each server in the pool gets at most one chance per call (timeouts are
    /// retried on the same server until the timeout threshold is reached).
    /// Error replies come back as [`SyncError::Rpc`] without touching the
    /// server's health.
    pub async fn with_active_connection<T, F, Fut>(&self, op: F) -> Result<T, SyncError>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let servers = self.pool.list_servers()?;
        let total = servers.len();
        let mut failed = 0usize;
        let mut renewed = false;

        while failed < total {
            let (server, connection) = match self.acquire(&servers).await {
                Acquired::Ready(server, connection) => (server, connection),
                Acquired::ConnectFailed(server, err) => {
                    self.record_failure(&server, &err);
                    failed += 1;
                    continue;
                }
                Acquired::NoneAvailable => break,
            };

            match op(connection.clone()).await {
                Ok(value) => {
                    self.record_success(&server);
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    if matches!(err, SyncError::Timeout { .. })
                        && self.note_timeout(&server) < self.config.timeout_threshold
                    {
                        log::warn!("{} on {}; retrying", err, server);
                        continue;
                    }
                    self.retire(&servers, &connection, &err).await;
                    failed += 1;
                }
                Err(SyncError::Client(reason)) if connection.is_closed() && !renewed => {
                    log::info!("Reconnecting to {}: {}", server, reason);
                    self.forget(&connection).await;
                    renewed = true;
                }
                Err(err) => return Err(err),
            }
        }

        log::warn!("All {} servers exhausted", total);
        Err(SyncError::AllServersExhausted(total))
    }

    /// Single request with failover.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, SyncError> {
        let timeout = self.config.request_timeout;
        self.with_active_connection(|connection| {
            let params = params.clone();
            async move { connection.request(method, params, timeout).await }
        })
        .await
    }

    /// Subscribe with transparent re-subscription on server switches.
    pub fn subscribe(self: &Arc<Self>, method: &str, params: Vec<Value>) -> FailoverSubscription {
        FailoverSubscription::spawn(self.clone(), method.to_string(), params)
    }

    async fn acquire(&self, servers: &[Arc<Server>]) -> Acquired {
        let mut active = self.active.lock().await;
        let now = Instant::now();

        if let Some(connection) = &active.connection {
            if !connection.is_closed() && self.is_selectable(connection.server(), now) {
                return Acquired::Ready(connection.server().clone(), connection.clone());
            }
            active.connection = None;
        }

        let start = active.index;
        let index = match (0..servers.len())
            .map(|offset| (start + offset) % servers.len())
            .find(|&i| self.is_selectable(&servers[i], now))
        {
            Some(index) => index,
            None => return Acquired::NoneAvailable,
        };
        if index != start % servers.len() {
            log::info!("Switching to server {}", servers[index]);
        }
        active.index = index;

        let server = servers[index].clone();
        match self.client.connect(server.clone()).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                active.connection = Some(connection.clone());
                Acquired::Ready(server, connection)
            }
            Err(err) => {
                active.index = (index + 1) % servers.len();
                Acquired::ConnectFailed(server, err)
            }
        }
    }

    /// Count a failure of `connection` against its server, once.
    ///
    /// Every caller with a request in flight sees the same dead connection;
    /// only the one that actually removes it from the active slot records the
    /// failure, so the server steps one backoff level per lost connection.
    async fn retire(&self, servers: &[Arc<Server>], connection: &Arc<Connection>, err: &SyncError) {
        if self.release(servers, connection).await {
            self.record_failure(connection.server(), err);
        }
    }

    /// A subscription noticed `connection` closing under it.
    pub(crate) async fn connection_lost(&self, connection: &Arc<Connection>, err: &SyncError) {
        match self.pool.list_servers() {
            Ok(servers) => self.retire(&servers, connection, err).await,
            Err(e) => log::debug!("Ignoring lost connection: {}", e),
        }
    }

    /// Drop `connection` if it is still the active one and advance past its
    /// server. Returns whether it was.
    async fn release(&self, servers: &[Arc<Server>], connection: &Arc<Connection>) -> bool {
        let mut active = self.active.lock().await;
        if !Self::is_current(&active, connection) {
            return false;
        }
        active.connection = None;
        if let Some(pos) = servers
            .iter()
            .position(|s| s.address == connection.server().address)
        {
            active.index = (pos + 1) % servers.len();
        }
        true
    }

    /// Drop `connection` without moving off its server.
    async fn forget(&self, connection: &Arc<Connection>) {
        let mut active = self.active.lock().await;
        if Self::is_current(&active, connection) {
            active.connection = None;
        }
    }

    fn is_current(active: &Active, connection: &Arc<Connection>) -> bool {
        active
            .connection
            .as_ref()
            .map_or(false, |c| Arc::ptr_eq(c, connection))
    }

    fn note_timeout(&self, server: &Server) -> u32 {
        let mut cooldowns = self.cooldowns();
        let entry = cooldowns.entry(server.address.clone()).or_default();
        entry.timeouts += 1;
        entry.timeouts
    }

    fn record_failure(&self, server: &Server, err: &SyncError) {
        let wait = {
            let mut cooldowns = self.cooldowns();
            let entry = cooldowns.entry(server.address.clone()).or_default();
            entry.failures += 1;
            entry.timeouts = 0;
            let wait = self.config.backoff(entry.failures);
            entry.retry_at = Some(Instant::now() + wait);
            wait
        };
        self.pool.mark_unreachable(server);
        log::warn!("Server {} failed ({}); cooling down for {:?}", server, err, wait);
    }

    fn record_success(&self, server: &Server) {
        self.cooldowns().remove(&server.address);
        self.pool.mark_healthy(server);
    }

    /// Never select `server` again this session.
    pub fn ban(&self, server: &Server) {
        log::warn!("Banning server {}", server);
        self.pool.mark_banned(server);
    }

    /// Periodic `server.ping` so dead connections are noticed between requests.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                if let Err(err) = controller.request("server.ping", Vec::new()).await {
                    log::warn!("Keepalive failed: {}", err);
                }
            }
        })
    }

    /// Drop the live connection (all subscriptions re-establish on next use).
    pub async fn disconnect(&self) {
        self.active.lock().await.connection = None;
    }
}
