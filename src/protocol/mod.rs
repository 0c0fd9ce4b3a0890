//! Electrum protocol client
//!
//! - `codec` - line-delimited JSON-RPC messages
//! - `transport` - plaintext / certificate-pinned TLS streams
//! - `client` - connections, request correlation, subscriptions

pub mod client;
pub mod codec;
pub mod transport;

pub use client::{Connection, PendingTable, ProtocolClient, Subscription};
pub use codec::{Incoming, RequestId};
pub use transport::download_certificate;
