//! Commit and statement log.
//!
//! Every commit owns the statements that produced it. The log can be read
//! across a branch's whole lineage, exported in several encodings and edited
//! after the fact. Edits never touch stored pages.

mod format;
mod range;
mod store;

pub use format::{netstring_decode, netstring_encode, parse_separator, render, LogFormat};
pub use range::CommitRange;
pub use store::{
    append, apply_edit, drop_branch, entry_count, log_table, move_range, own_entries, query,
    replace, statements, truncate_after, LogEdit,
};
