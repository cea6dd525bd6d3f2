//! Branch garbage collection.
//!
//! Deleting a branch only hides it. This pass reclaims the stores of deleted
//! branches once no live branch reads through them, and can optionally
//! delete live branches that never diverged from their parent.

use crate::branches::BranchDirectory;
use crate::commitlog;
use crate::error::Result;
use crate::kv::WriteTxn;
use crate::pages;
use crate::types::BranchId;
use tracing::info;

/// Options for branch garbage collection.
#[derive(Clone, Debug, Default)]
pub struct BranchGcOptions {
    /// Also delete live branches with no commits of their own and no children.
    pub delete_empty: bool,
    /// Only delete empty branches whose name contains one of these patterns.
    pub name_patterns: Option<Vec<String>>,
    /// Report what would happen without changing anything.
    pub dry_run: bool,
}

/// Result of branch garbage collection.
#[derive(Clone, Debug, Default)]
pub struct BranchGcResult {
    /// Deleted branches whose stores were dropped.
    pub reclaimed: Vec<String>,
    /// Deleted branches kept because a live branch still reads through them.
    pub retained: Vec<String>,
    /// Empty live branches that were deleted.
    pub deleted: Vec<String>,
    /// Empty live branches left alone.
    pub skipped: Vec<String>,
}

fn matches_patterns(name: &str, patterns: &Option<Vec<String>>) -> bool {
    match patterns {
        Some(patterns) => patterns.iter().any(|p| name.contains(p.as_str())),
        None => true,
    }
}

/// Run one collection pass. `current` is the caller's checkout, which is
/// never deleted.
pub fn collect_garbage(
    txn: &mut WriteTxn<'_>,
    dir: &mut BranchDirectory,
    options: &BranchGcOptions,
    current: Option<BranchId>,
) -> Result<BranchGcResult> {
    let mut result = BranchGcResult::default();

    if options.delete_empty {
        let candidates: Vec<(BranchId, String, bool)> = dir
            .live()
            .filter(|b| b.own_commits() == 0 && matches_patterns(&b.name, &options.name_patterns))
            .map(|b| {
                let keep = b.is_root() || Some(b.id) == current || dir.highest_fork(b.id).is_some();
                (b.id, b.name.clone(), keep)
            })
            .collect();

        for (id, name, keep) in candidates {
            if keep {
                result.skipped.push(name);
                continue;
            }
            if !options.dry_run {
                dir.delete(id)?;
            }
            result.deleted.push(name);
        }
    }

    let mut referenced = dir.referenced();
    if options.dry_run {
        for name in &result.deleted {
            if let Some(b) = dir.find(name) {
                referenced.remove(&b.id);
            }
        }
    }

    let hidden: Vec<(BranchId, String)> = dir
        .all()
        .filter(|b| !b.visible || (options.dry_run && result.deleted.contains(&b.name)))
        .map(|b| (b.id, b.name.clone()))
        .collect();
    for (id, name) in hidden {
        if referenced.contains(&id) {
            result.retained.push(name);
            continue;
        }
        if !options.dry_run {
            pages::drop_branch(txn, id);
            commitlog::drop_branch(txn, id);
            dir.remove(id);
        }
        result.reclaimed.push(name);
    }

    info!(
        target: "branchdb::history",
        reclaimed = result.reclaimed.len(),
        retained = result.retained.len(),
        deleted = result.deleted.len(),
        dry_run = options.dry_run,
        "Branch garbage collection"
    );
    Ok(result)
}
