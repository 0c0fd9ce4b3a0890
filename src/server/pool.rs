/// Server Pool
///
/// Holds the configured Electrum endpoints of one coin network in
/// configuration order, together with their health. It never talks to the
/// network; health is written only by the failover controller.
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ServerConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Plaintext,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustAnchor {
    /// No pin configured
    None,
    /// Pinned leaf certificate, PEM
    Certificate(String),
    /// SHA-256 of the leaf certificate DER, lowercase hex without separators
    Fingerprint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub address: String,
    pub transport: TransportKind,
    pub trust_anchor: TrustAnchor,
}

impl Server {
    pub fn from_config(config: &ServerConfig) -> Result<Self, SyncError> {
        split_host_port(&config.address)?;

        let trust_anchor = match (&config.pem_cert, &config.fingerprint) {
            (Some(pem), _) if !pem.trim().is_empty() => TrustAnchor::Certificate(pem.clone()),
            (_, Some(fp)) if !fp.trim().is_empty() => {
                TrustAnchor::Fingerprint(normalize_fingerprint(fp)?)
            }
            _ => TrustAnchor::None,
        };

        Ok(Self {
            address: config.address.clone(),
            transport: if config.tls {
                TransportKind::Tls
            } else {
                TransportKind::Plaintext
            },
            trust_anchor,
        })
    }

    pub fn host(&self) -> &str {
        split_host_port(&self.address)
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            TransportKind::Tls => write!(f, "tls://{}", self.address),
            TransportKind::Plaintext => write!(f, "tcp://{}", self.address),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unreachable,
    Banned,
}

struct PoolEntry {
    server: Arc<Server>,
    health: HealthState,
}

pub struct ServerPool {
    entries: Mutex<Vec<PoolEntry>>,
}

impl ServerPool {
    /// Build a pool from configuration; an empty list is a configuration error.
    pub fn new(configs: &[ServerConfig]) -> Result<Self, SyncError> {
        let entries = Self::build_entries(configs)?;
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    fn build_entries(configs: &[ServerConfig]) -> Result<Vec<PoolEntry>, SyncError> {
        if configs.is_empty() {
            return Err(SyncError::Config("server pool is empty".into()));
        }
        configs
            .iter()
            .map(|config| {
                Ok(PoolEntry {
                    server: Arc::new(Server::from_config(config)?),
                    health: HealthState::Unknown,
                })
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PoolEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Servers in configuration order.
    pub fn list_servers(&self) -> Result<Vec<Arc<Server>>, SyncError> {
        let entries = self.lock();
        if entries.is_empty() {
            return Err(SyncError::Config("server pool is empty".into()));
        }
        Ok(entries.iter().map(|e| e.server.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn health(&self, server: &Server) -> Option<HealthState> {
        self.lock()
            .iter()
            .find(|e| e.server.address == server.address)
            .map(|e| e.health)
    }

    /// Snapshot of `(address, health)` pairs, in order.
    pub fn health_report(&self) -> Vec<(String, HealthState)> {
        self.lock()
            .iter()
            .map(|e| (e.server.address.clone(), e.health))
            .collect()
    }

    pub fn mark_healthy(&self, server: &Server) {
        self.set_health(server, HealthState::Healthy);
    }

    pub fn mark_unreachable(&self, server: &Server) {
        self.set_health(server, HealthState::Unreachable);
    }

    pub fn mark_banned(&self, server: &Server) {
        self.set_health(server, HealthState::Banned);
    }

    fn set_health(&self, server: &Server, health: HealthState) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.server.address == server.address) {
            // A ban is final for the session.
            if entry.health == HealthState::Banned {
                return;
            }
            if entry.health != health {
                log::info!("Server {} is now {:?}", server, health);
            }
            entry.health = health;
        }
    }

    /// Replace the pool contents, resetting every health state.
    pub fn reload(&self, configs: &[ServerConfig]) -> Result<(), SyncError> {
        let fresh = Self::build_entries(configs)?;
        *self.lock() = fresh;
        log::info!("Server pool reloaded with {} servers", configs.len());
        Ok(())
    }
}

pub(crate) fn split_host_port(address: &str) -> Result<(&str, u16), SyncError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SyncError::Config(format!("server address {} has no port", address)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| SyncError::Config(format!("invalid port in server address {}", address)))?;
    if host.is_empty() {
        return Err(SyncError::Config(format!("server address {} has no host", address)));
    }
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

pub(crate) fn normalize_fingerprint(raw: &str) -> Result<String, SyncError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    match hex::decode(&cleaned) {
        Ok(bytes) if bytes.len() == 32 => Ok(cleaned),
        _ => Err(SyncError::Config(format!("invalid certificate fingerprint: {}", raw))),
    }
}
