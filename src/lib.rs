//! # branchdb
//!
//! A branchable, versioned page store. Pages are opaque byte blobs; every
//! top-level write transaction becomes one commit on the checked-out branch,
//! and branches can be forked from any commit of any other branch.
//!
//! ## Core Concepts
//!
//! - **Branches**: Independent linear histories forked at a parent commit
//! - **Pages**: Read through the branch's ancestors up to each fork point
//! - **Statement log**: The statements that produced each commit, editable
//! - **Connections**: Per-connection checkout, snapshot and savepoints
//!
//! ## Example
//!
//! ```ignore
//! use branchdb::Connection;
//!
//! let mut conn = Connection::open("file:app.db?branches=on")?;
//!
//! conn.write_page(1, b"first")?;
//! conn.log_statement("insert into t1 values ('first')")?;
//! conn.commit()?;
//!
//! conn.execute("pragma new_branch=experiment at master.1")?;
//! conn.write_page(1, b"changed")?;
//! conn.commit()?;
//!
//! conn.execute("pragma branch=master")?;
//! assert_eq!(&*conn.read_page(1)?, b"first");
//! ```

pub mod branches;
pub mod command;
pub mod commitlog;
pub mod connection;
pub mod convert;
pub mod error;
pub mod history;
pub mod kv;
pub mod pages;
pub mod store;
pub mod types;
pub mod varint;

// Re-exports
pub use branches::{BranchDirectory, DEFAULT_BRANCH};
pub use command::{Command, Rows};
pub use commitlog::{CommitRange, LogEdit, LogFormat};
pub use connection::{ConnectOptions, Connection};
pub use convert::{convert_legacy, widen_commit_ids, ConversionReport, COMMIT_ID_SHIFT};
pub use error::{Result, StoreError};
pub use history::{BranchGcOptions, BranchGcResult, MergeOutcome, MergeSpan};
pub use store::{Store, StoreConfig};
pub use types::*;
