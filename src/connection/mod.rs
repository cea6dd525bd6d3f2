//! Connections: checkout state, snapshots and transactions.
//!
//! Each connection carries its own checkout and transaction builder. Many
//! connections share one store; only one of them writes at a time.

mod config;
#[allow(clippy::module_inception)]
mod connection;
mod txn;

pub use config::{ConnectOptions, DEFAULT_PAGE_CACHE_SIZE};
pub use connection::Connection;
pub use txn::{TxnBuilder, TxnOrigin};
