//! Structural edits of branch history: forward merge and truncation.

use crate::branches::BranchDirectory;
use crate::commitlog;
use crate::error::{Result, StoreError};
use crate::kv::WriteTxn;
use crate::pages;
use crate::types::BranchId;
use tracing::info;

/// How much of the source branch a forward merge takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeSpan {
    /// Every commit after the fork point.
    All,
    /// The first `n` commits after the fork point.
    Count(i64),
    /// Commits up to and including this one.
    Checkpoint(u64),
}

/// What a forward merge did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Commits that now belong to the target.
    pub commits: u64,
    /// New head of the target, and new fork point of the source.
    pub head: u64,
    /// Branches re-attached to the target.
    pub reparented: Vec<BranchId>,
}

/// Move the oldest commits of `source` into its parent `target`.
///
/// Page versions, max-page marks and statements in the moved range are
/// re-homed under the target with their commit numbers intact. The source
/// is re-forked at the new target head; any branch forked from the source
/// inside the moved range is re-attached to the target.
pub fn forward_merge(
    txn: &mut WriteTxn<'_>,
    dir: &mut BranchDirectory,
    target: &str,
    source: &str,
    span: MergeSpan,
) -> Result<MergeOutcome> {
    let target = dir.resolve(target)?.clone();
    let source = dir.resolve(source)?.clone();

    if source.source_branch != Some(target.id) {
        return Err(StoreError::InvalidArgument(format!(
            "{} is not forked from {}",
            source.name, target.name
        )));
    }
    if target.last_commit != source.source_commit {
        return Err(StoreError::InvalidArgument(format!(
            "{} has commits after {}.{}",
            target.name, target.name, source.source_commit
        )));
    }

    let available = source.own_commits();
    let commits = match span {
        MergeSpan::All => available,
        MergeSpan::Count(n) => {
            if n <= 0 {
                return Err(StoreError::InvalidArgument(format!(
                    "merge count must be positive, got {}",
                    n
                )));
            }
            n as u64
        }
        MergeSpan::Checkpoint(commit) => {
            if commit <= source.source_commit {
                return Err(StoreError::InvalidArgument(format!(
                    "checkpoint {}.{} is not after fork point {}",
                    source.name, commit, source.source_commit
                )));
            }
            commit - source.source_commit
        }
    };
    if commits == 0 {
        return Err(StoreError::InvalidArgument(format!(
            "{} has no commits to merge",
            source.name
        )));
    }
    if commits > available {
        return Err(StoreError::InvalidArgument(format!(
            "{} has only {} commits after its fork point",
            source.name, available
        )));
    }

    let lo = source.source_commit;
    let head = lo + commits;
    let pages_moved = pages::move_range(txn, source.id, target.id, lo, head)?;
    let statements_moved = commitlog::move_range(txn, source.id, target.id, lo, head);

    dir.set_last_commit(target.id, head)?;
    dir.set_source(source.id, target.id, head)?;

    let reparented: Vec<BranchId> = dir
        .all()
        .filter(|b| b.source_branch == Some(source.id) && b.source_commit <= head)
        .map(|b| b.id)
        .collect();
    for id in &reparented {
        let commit = dir.branch(*id)?.source_commit;
        dir.set_source(*id, target.id, commit)?;
    }

    info!(
        target: "branchdb::history",
        target_branch = %target.name,
        source_branch = %source.name,
        commits,
        head,
        pages = pages_moved,
        statements = statements_moved,
        reparented = reparented.len(),
        "Forward merge"
    );

    Ok(MergeOutcome {
        commits,
        head,
        reparented,
    })
}

/// Drop every commit of `name` after `commit`.
pub fn truncate(
    txn: &mut WriteTxn<'_>,
    dir: &mut BranchDirectory,
    name: &str,
    commit: u64,
) -> Result<u64> {
    let branch = dir.resolve(name)?.clone();
    if commit > branch.last_commit {
        return Err(StoreError::NotFound(format!(
            "commit {}.{} (head is {})",
            name, commit, branch.last_commit
        )));
    }
    if commit < branch.source_commit {
        return Err(StoreError::NotAllowed(format!(
            "{}.{} precedes the fork point {}",
            name, commit, branch.source_commit
        )));
    }
    if let Some(child) = dir.highest_fork(branch.id) {
        if child.source_commit > commit {
            return Err(StoreError::NotAllowed(format!(
                "{} is forked at {}.{}",
                child.name, name, child.source_commit
            )));
        }
    }

    let removed = branch.last_commit - commit;
    let pages_removed = pages::truncate_after(txn, branch.id, commit)?;
    let statements_removed = commitlog::truncate_after(txn, branch.id, commit);
    dir.set_last_commit(branch.id, commit)?;
    let generation = if removed > 0 {
        dir.bump_generation(branch.id)?
    } else {
        branch.generation
    };

    info!(
        target: "branchdb::history",
        branch = name,
        commit,
        generation,
        commits = removed,
        pages = pages_removed,
        statements = statements_removed,
        "Branch truncated"
    );
    Ok(removed)
}
