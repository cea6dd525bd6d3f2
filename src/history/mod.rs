//! History editing: forward merge, truncation and garbage collection.
//!
//! Every operation here runs inside one write transaction together with the
//! directory update, so the branch metadata and the stores change atomically.

mod editor;
mod gc;

pub use editor::{forward_merge, truncate, MergeOutcome, MergeSpan};
pub use gc::{collect_garbage, BranchGcOptions, BranchGcResult};
