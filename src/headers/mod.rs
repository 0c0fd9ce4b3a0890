pub mod store;
pub mod sync;

pub use store::{ExtendOutcome, HeaderChainStatus, HeaderChainStore};
pub use sync::{HeaderSync, SharedHeaders, TipEvent};
