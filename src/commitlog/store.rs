//! Per-branch statement log.
//!
//! Table `b{id}-log` maps `varint(commit) || varint(seq)` to statement text.
//! `seq` starts at 1 for every commit and follows append order.

use super::range::CommitRange;
use crate::branches::BranchDirectory;
use crate::error::{Result, StoreError};
use crate::kv::{KvRead, WriteTxn};
use crate::types::{Branch, BranchId, LogRow};
use crate::varint;
use std::collections::BTreeSet;
use std::ops::Bound;
use tracing::info;

pub fn log_table(id: BranchId) -> String {
    format!("b{}-log", id.0)
}

fn decode_text(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| StoreError::Corruption("log statement is not UTF-8".into()))
}

/// Statements recorded for one commit, in order.
pub fn statements(txn: &impl KvRead, branch: BranchId, commit: u64) -> Result<Vec<String>> {
    txn.scan_prefix(&log_table(branch), &varint::encode(commit))
        .into_iter()
        .map(|(_, text)| decode_text(&text))
        .collect()
}

/// Append statements to a commit after any it already has.
pub fn append<S: AsRef<str>>(
    txn: &mut WriteTxn<'_>,
    branch: BranchId,
    commit: u64,
    texts: &[S],
) -> Result<()> {
    let table = log_table(branch);
    let prefix = varint::encode(commit);
    let mut seq = match txn.scan_prefix(&table, &prefix).last() {
        Some((key, _)) => varint::decode_pair(key)?.1,
        None => 0,
    };
    for text in texts {
        seq += 1;
        txn.put(
            &table,
            &varint::encode_pair(commit, seq),
            text.as_ref().as_bytes(),
        );
    }
    Ok(())
}

/// Replace the statement list of a commit.
pub fn replace<S: AsRef<str>>(
    txn: &mut WriteTxn<'_>,
    branch: BranchId,
    commit: u64,
    texts: &[S],
) -> Result<()> {
    let table = log_table(branch);
    for (key, _) in txn.scan_prefix(&table, &varint::encode(commit)) {
        txn.delete(&table, &key);
    }
    append(txn, branch, commit, texts)
}

/// Statements of `branch` itself with `first <= commit <= last`.
pub fn own_entries(
    txn: &impl KvRead,
    branch: BranchId,
    first: u64,
    last: u64,
) -> Result<Vec<(u64, String)>> {
    if first > last {
        return Ok(Vec::new());
    }
    let lower = varint::encode(first);
    let upper = varint::encode(last.saturating_add(1));
    let upper = if last == u64::MAX {
        Bound::Unbounded
    } else {
        Bound::Excluded(upper.as_slice())
    };
    txn.scan(&log_table(branch), Bound::Included(lower.as_slice()), upper)
        .into_iter()
        .map(|(key, text)| Ok((varint::decode_pair(&key)?.0, decode_text(&text)?)))
        .collect()
}

/// Log of `branch` as seen from `head`: inherited ancestor entries first,
/// each row tagged with the branch owning that commit. With `strict` only
/// the branch's own commits are listed.
pub fn query(
    txn: &impl KvRead,
    dir: &BranchDirectory,
    branch: BranchId,
    head: u64,
    range: CommitRange,
    strict: bool,
) -> Result<Vec<LogRow>> {
    let (first, last) = range.resolve(head)?;
    let mut steps = dir.lineage(branch, head)?;
    if strict {
        steps.truncate(1);
    }

    let mut rows = Vec::new();
    for step in steps.iter().rev() {
        let lo = first.max(step.floor + 1);
        let hi = last.min(step.bound);
        let owner = &dir.branch(step.branch)?.name;
        for (commit, text) in own_entries(txn, step.branch, lo, hi)? {
            rows.push(LogRow::new(owner.as_str(), commit, text));
        }
    }
    Ok(rows)
}

/// Remove entries newer than `commit`.
pub fn truncate_after(txn: &mut WriteTxn<'_>, branch: BranchId, commit: u64) -> usize {
    let table = log_table(branch);
    let from = varint::encode(commit.saturating_add(1));
    let doomed = txn.scan(&table, Bound::Included(from.as_slice()), Bound::Unbounded);
    for (key, _) in &doomed {
        txn.delete(&table, key);
    }
    doomed.len()
}

/// Re-home entries with `lo < commit <= hi`, keeping commit numbers.
pub fn move_range(txn: &mut WriteTxn<'_>, from: BranchId, to: BranchId, lo: u64, hi: u64) -> usize {
    let (src, dst) = (log_table(from), log_table(to));
    let lower = varint::encode(lo + 1);
    let upper = varint::encode(hi.saturating_add(1));
    let moved = txn.scan(
        &src,
        Bound::Included(lower.as_slice()),
        Bound::Excluded(upper.as_slice()),
    );
    for (key, text) in &moved {
        txn.delete(&src, key);
        txn.put_shared(&dst, key.clone(), text.clone());
    }
    moved.len()
}

pub fn drop_branch(txn: &mut WriteTxn<'_>, branch: BranchId) {
    txn.drop_table(&log_table(branch));
}

pub fn entry_count(txn: &impl KvRead, branch: BranchId) -> usize {
    txn.scan_all(&log_table(branch)).len()
}

/// A retroactive change to the statement log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEdit {
    /// Append statements to a commit, creating it if it is the next one.
    Add {
        branch: String,
        commit: u64,
        statements: Vec<String>,
    },
    /// Remove statements by 1-based position.
    Del {
        branch: String,
        commit: u64,
        indices: Vec<usize>,
    },
    /// Replace the statements of one or more commits.
    Set {
        entries: Vec<(String, u64, Vec<String>)>,
    },
}

/// Check that `commit` on `branch` may be edited. `allow_next` accepts the
/// commit right after the head, which an edit creates.
fn check_editable(
    dir: &BranchDirectory,
    branch: &Branch,
    commit: u64,
    allow_next: bool,
) -> Result<()> {
    if allow_next && commit == branch.last_commit + 1 {
        return Ok(());
    }
    if !branch.owns(commit) {
        return Err(StoreError::NotFound(format!(
            "commit {}.{}",
            branch.name, commit
        )));
    }
    if let Some(child) = dir.highest_fork(branch.id) {
        if commit <= child.source_commit {
            return Err(StoreError::ForkPointLocked {
                commit,
                child: child.name.clone(),
            });
        }
    }
    Ok(())
}

/// Apply a log edit inside a write transaction. Stored pages are left as
/// they are; only the textual log changes.
pub fn apply_edit(txn: &mut WriteTxn<'_>, dir: &mut BranchDirectory, edit: &LogEdit) -> Result<()> {
    match edit {
        LogEdit::Add {
            branch,
            commit,
            statements,
        } => {
            let target = dir.resolve(branch)?.clone();
            check_editable(dir, &target, *commit, true)?;
            append(txn, target.id, *commit, statements)?;
            if *commit > target.last_commit {
                dir.set_last_commit(target.id, *commit)?;
            }
        }
        LogEdit::Del {
            branch,
            commit,
            indices,
        } => {
            let target = dir.resolve(branch)?.clone();
            check_editable(dir, &target, *commit, false)?;
            let current = statements(txn, target.id, *commit)?;
            let doomed: BTreeSet<usize> = indices.iter().copied().collect();
            if let Some(bad) = doomed.iter().find(|&&i| i == 0 || i > current.len()) {
                return Err(StoreError::NotFound(format!(
                    "statement {} of commit {}.{}",
                    bad, target.name, commit
                )));
            }
            let kept: Vec<&String> = current
                .iter()
                .enumerate()
                .filter(|(i, _)| !doomed.contains(&(i + 1)))
                .map(|(_, s)| s)
                .collect();
            replace(txn, target.id, *commit, &kept)?;
        }
        LogEdit::Set { entries } => {
            let mut resolved = Vec::with_capacity(entries.len());
            for (branch, commit, texts) in entries {
                let target = dir.resolve(branch)?.clone();
                check_editable(dir, &target, *commit, true)?;
                resolved.push((target, *commit, texts));
            }
            for (target, commit, texts) in resolved {
                replace(txn, target.id, commit, texts)?;
                let head = dir.branch(target.id)?.last_commit;
                if commit > head {
                    dir.set_last_commit(target.id, commit)?;
                }
            }
        }
    }
    info!(target: "branchdb::history", edit = ?edit, "Statement log edited");
    Ok(())
}
