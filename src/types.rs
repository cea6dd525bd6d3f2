//! Core types shared across the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Immutable page or value bytes, shared between snapshots.
pub type Bytes = Arc<[u8]>;

/// Stable identifier for a branch. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub u32);

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({})", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BranchId {
    pub fn next(self) -> Self {
        BranchId(self.0 + 1)
    }
}

/// A branch as recorded in the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub id: BranchId,

    /// Kept after deletion so descendants can still tag inherited history.
    pub name: String,

    /// False once the branch has been deleted.
    pub visible: bool,

    /// Parent branch, `None` for a root.
    pub source_branch: Option<BranchId>,

    /// Parent commit this branch was forked at (0 for a root).
    pub source_commit: u64,

    /// Head commit.
    pub last_commit: u64,

    /// Bumped each time commits are truncated away, so a commit number
    /// reused afterwards can be told apart from the one it replaced.
    pub generation: u64,
}

impl Branch {
    pub fn is_root(&self) -> bool {
        self.source_branch.is_none()
    }

    /// Number of commits owned by this branch itself.
    pub fn own_commits(&self) -> u64 {
        self.last_commit.saturating_sub(self.source_commit)
    }

    /// Whether `commit` lies in this branch's own commit range.
    pub fn owns(&self, commit: u64) -> bool {
        commit > self.source_commit && commit <= self.last_commit
    }
}

/// Summary returned by `branch_info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_commit: Option<u64>,

    pub total_commits: u64,
}

/// One statement of the commit log, tagged with the branch that owns the commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRow {
    pub branch: String,
    pub commit: u64,
    pub text: String,
}

impl LogRow {
    pub fn new(branch: impl Into<String>, commit: u64, text: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit,
            text: text.into(),
        }
    }
}

/// A connection's current `(branch, commit)` selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkout {
    pub branch: BranchId,

    /// `None` follows the branch head.
    pub pinned: Option<u64>,

    /// Branch generation when the checkout was made.
    pub generation: u64,
}

impl Checkout {
    pub fn head(branch: &Branch) -> Self {
        Self {
            branch: branch.id,
            pinned: None,
            generation: branch.generation,
        }
    }

    pub fn at(branch: &Branch, commit: u64) -> Self {
        Self {
            branch: branch.id,
            pinned: Some(commit),
            generation: branch.generation,
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub branch_count: usize,
    pub deleted_branch_count: usize,
    pub table_count: usize,
    pub page_versions: u64,
    pub log_entries: u64,
    pub file_size: u64,
    pub snapshot_version: u64,
}
