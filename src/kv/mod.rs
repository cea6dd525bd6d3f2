//! Embedded key-value environment: named tables of ordered byte keys,
//! snapshot readers and a single journaled writer per file.

pub mod env;
pub mod journal;
pub mod txn;

pub use env::{EnvOptions, Environment};
pub use journal::IntEncoding;
pub use txn::{Entries, KvRead, ReadTxn, WriteTxn};

/// Table holding directory metadata.
pub const MAIN_TABLE: &str = "";
