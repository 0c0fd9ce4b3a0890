//! Remote Electrum servers
//!
//! - `pool` - configured endpoints and their health

pub mod pool;

pub use pool::{HealthState, Server, ServerPool, TransportKind, TrustAnchor};
