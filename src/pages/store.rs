//! Page version store.
//!
//! Each branch owns two tables: `b{id}-pages` keyed by
//! `varint(page_no) || varint(commit)` and `b{id}-maxpage` keyed by
//! `varint(commit)`. Page-major keys keep every version of one page
//! contiguous, so "latest version at or below commit C" is a single reverse
//! range lookup.

use crate::branches::BranchDirectory;
use crate::error::{Result, StoreError};
use crate::kv::{Entries, KvRead, WriteTxn};
use crate::types::{BranchId, Bytes};
use crate::varint;
use std::ops::Bound;

/// Page table used when branching is disabled.
pub const PLAIN_PAGES_TABLE: &str = "pages";

pub fn pages_table(id: BranchId) -> String {
    format!("b{}-pages", id.0)
}

pub fn maxpage_table(id: BranchId) -> String {
    format!("b{}-maxpage", id.0)
}

fn page_key(table: &str, key: &[u8]) -> Result<(u64, u64)> {
    varint::decode_pair(key)
        .map_err(|e| StoreError::Corruption(format!("page key {:02x?} in {}: {}", key, table, e)))
}

/// Latest version of `page_no` stored on `branch` itself with
/// `floor < commit <= bound`.
pub fn read_local(
    txn: &impl KvRead,
    branch: BranchId,
    page_no: u64,
    floor: u64,
    bound: u64,
) -> Result<Option<(u64, Bytes)>> {
    if bound <= floor {
        return Ok(None);
    }
    let table = pages_table(branch);
    let lower = varint::encode_pair(page_no, floor + 1);
    let upper = varint::encode_pair(page_no, bound);
    let Some((key, data)) = txn.last_in(
        &table,
        Bound::Included(lower.as_slice()),
        Bound::Included(upper.as_slice()),
    ) else {
        return Ok(None);
    };
    let (_, commit) = page_key(&table, &key)?;
    Ok(Some((commit, data)))
}

/// Versions on one page table with `lo < commit <= hi`, seeking page by page
/// so untouched history is never visited.
fn versions_between(txn: &impl KvRead, table: &str, lo: u64, hi: u64) -> Result<Entries> {
    let mut found = Vec::new();
    let Some(first_commit) = lo.checked_add(1) else {
        return Ok(found);
    };
    if first_commit > hi {
        return Ok(found);
    }

    let mut seek = Vec::new();
    loop {
        let Some((key, _)) = txn.first_in(table, Bound::Included(seek.as_slice()), Bound::Unbounded)
        else {
            break;
        };
        let (page_no, _) = page_key(table, &key)?;
        let lower = varint::encode_pair(page_no, first_commit);
        let upper = varint::encode_pair(page_no, hi);
        found.extend(txn.scan(
            table,
            Bound::Included(lower.as_slice()),
            Bound::Included(upper.as_slice()),
        ));
        match page_no.checked_add(1) {
            Some(next) => seek = varint::encode(next),
            None => break,
        }
    }
    Ok(found)
}

/// Resolve `page_no` on `branch` as of `as_of`, falling back through the
/// ancestors. `None` if no branch in the chain ever wrote the page.
pub fn read_page(
    txn: &impl KvRead,
    dir: &BranchDirectory,
    branch: BranchId,
    page_no: u64,
    as_of: u64,
) -> Result<Option<Bytes>> {
    for step in dir.lineage(branch, as_of)? {
        if let Some((_, data)) = read_local(txn, step.branch, page_no, step.floor, step.bound)? {
            return Ok(Some(data));
        }
    }
    Ok(None)
}

/// Store a page version. Existing `(page, commit)` entries are replaced only
/// by the writer of that commit.
pub fn write_page(txn: &mut WriteTxn<'_>, branch: BranchId, page_no: u64, commit: u64, data: Bytes) {
    txn.put_shared(
        &pages_table(branch),
        varint::encode_pair(page_no, commit),
        data,
    );
}

/// Highest page number in use on `branch` as of `as_of`.
pub fn max_page_no(
    txn: &impl KvRead,
    dir: &BranchDirectory,
    branch: BranchId,
    as_of: u64,
) -> Result<u64> {
    for step in dir.lineage(branch, as_of)? {
        if step.bound <= step.floor {
            continue;
        }
        let lower = varint::encode(step.floor + 1);
        let upper = varint::encode(step.bound);
        if let Some((_, value)) = txn.last_in(
            &maxpage_table(step.branch),
            Bound::Included(lower.as_slice()),
            Bound::Included(upper.as_slice()),
        ) {
            return varint::decode_exact(&value);
        }
    }
    Ok(0)
}

pub fn set_max_page_mark(txn: &mut WriteTxn<'_>, branch: BranchId, commit: u64, max_page_no: u64) {
    txn.put(
        &maxpage_table(branch),
        &varint::encode(commit),
        &varint::encode(max_page_no),
    );
}

/// Remove every version on `branch` newer than `commit`. Returns the number
/// of page versions removed.
pub fn truncate_after(txn: &mut WriteTxn<'_>, branch: BranchId, commit: u64) -> Result<usize> {
    let pages = pages_table(branch);
    let versions = versions_between(txn, &pages, commit, u64::MAX)?;
    let removed = versions.len();
    for (key, _) in versions {
        txn.delete(&pages, &key);
    }

    let marks = maxpage_table(branch);
    let from = varint::encode(commit.saturating_add(1));
    for (key, _) in txn.scan(&marks, Bound::Included(from.as_slice()), Bound::Unbounded) {
        txn.delete(&marks, &key);
    }
    Ok(removed)
}

/// Re-home versions with `lo < commit <= hi` from one branch to another,
/// keeping their commit numbers. Returns the number of page versions moved.
pub fn move_range(
    txn: &mut WriteTxn<'_>,
    from: BranchId,
    to: BranchId,
    lo: u64,
    hi: u64,
) -> Result<usize> {
    let (src, dst) = (pages_table(from), pages_table(to));
    let versions = versions_between(txn, &src, lo, hi)?;
    let moved = versions.len();
    for (key, data) in versions {
        txn.delete(&src, &key);
        txn.put_shared(&dst, key, data);
    }

    let (src, dst) = (maxpage_table(from), maxpage_table(to));
    let lower = varint::encode(lo + 1);
    let upper = varint::encode(hi);
    let marks = txn.scan(
        &src,
        Bound::Included(lower.as_slice()),
        Bound::Included(upper.as_slice()),
    );
    for (key, value) in marks {
        txn.delete(&src, &key);
        txn.put_shared(&dst, key, value);
    }
    Ok(moved)
}

/// Drop both page tables of a branch.
pub fn drop_branch(txn: &mut WriteTxn<'_>, branch: BranchId) {
    txn.drop_table(&pages_table(branch));
    txn.drop_table(&maxpage_table(branch));
}

/// Number of stored page versions on a branch.
pub fn version_count(txn: &impl KvRead, branch: BranchId) -> usize {
    txn.scan_all(&pages_table(branch)).len()
}

pub fn read_plain(txn: &impl KvRead, page_no: u64) -> Option<Bytes> {
    txn.get(PLAIN_PAGES_TABLE, &varint::encode(page_no))
}

pub fn write_plain(txn: &mut WriteTxn<'_>, page_no: u64, data: Bytes) {
    txn.put_shared(PLAIN_PAGES_TABLE, varint::encode(page_no), data);
}

pub fn plain_max_page_no(txn: &impl KvRead) -> Result<u64> {
    match txn.last_in(PLAIN_PAGES_TABLE, Bound::Unbounded, Bound::Unbounded) {
        Some((key, _)) => varint::decode_exact(&key),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::DEFAULT_BRANCH;
    use crate::kv::{EnvOptions, Environment};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn page(s: &str) -> Bytes {
        Arc::from(s.as_bytes())
    }

    struct Fixture {
        _tmp: TempDir,
        env: Arc<Environment>,
        dir: BranchDirectory,
        master: BranchId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let env = Environment::open(tmp.path().join("db"), EnvOptions::default()).unwrap();
        let mut dir = BranchDirectory::default();
        dir.bootstrap().unwrap();
        let master = dir.resolve(DEFAULT_BRANCH).unwrap().id;
        Fixture {
            _tmp: tmp,
            env,
            dir,
            master,
        }
    }

    #[test]
    fn test_nearest_version_at_or_below() {
        let f = fixture();
        let mut w = f.env.begin_write().unwrap();
        write_page(&mut w, f.master, 1, 1, page("v1"));
        write_page(&mut w, f.master, 1, 3, page("v3"));
        write_page(&mut w, f.master, 2, 2, page("other"));
        w.commit().unwrap();

        let r = f.env.begin_read();
        let read = |c| read_page(&r, &f.dir, f.master, 1, c).unwrap();
        assert!(read(0).is_none());
        assert_eq!(read(1).as_deref(), Some(&b"v1"[..]));
        assert_eq!(read(2).as_deref(), Some(&b"v1"[..]));
        assert_eq!(read(3).as_deref(), Some(&b"v3"[..]));
        assert_eq!(read(99).as_deref(), Some(&b"v3"[..]));
    }

    #[test]
    fn test_fork_reads_parent_at_fork_point() {
        let mut f = fixture();
        f.dir.set_last_commit(f.master, 3).unwrap();
        let child = f.dir.create("child", Some(f.master), Some(2)).unwrap();
        f.dir.set_last_commit(child, 3).unwrap();

        let mut w = f.env.begin_write().unwrap();
        write_page(&mut w, f.master, 1, 1, page("m1"));
        write_page(&mut w, f.master, 1, 3, page("m3"));
        write_page(&mut w, f.master, 2, 2, page("m2"));
        write_page(&mut w, child, 2, 3, page("c3"));
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(
            read_page(&r, &f.dir, child, 1, 3).unwrap().as_deref(),
            Some(&b"m1"[..])
        );
        assert_eq!(
            read_page(&r, &f.dir, child, 2, 3).unwrap().as_deref(),
            Some(&b"c3"[..])
        );
        assert_eq!(
            read_page(&r, &f.dir, child, 2, 2).unwrap().as_deref(),
            Some(&b"m2"[..])
        );
        assert_eq!(
            read_page(&r, &f.dir, f.master, 2, 3).unwrap().as_deref(),
            Some(&b"m2"[..])
        );
    }

    #[test]
    fn test_max_page_no_walks_ancestors() {
        let mut f = fixture();
        f.dir.set_last_commit(f.master, 2).unwrap();
        let child = f.dir.create("child", Some(f.master), None).unwrap();

        let mut w = f.env.begin_write().unwrap();
        set_max_page_mark(&mut w, f.master, 1, 4);
        set_max_page_mark(&mut w, f.master, 2, 9);
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(max_page_no(&r, &f.dir, f.master, 1).unwrap(), 4);
        assert_eq!(max_page_no(&r, &f.dir, child, 2).unwrap(), 9);
        assert_eq!(max_page_no(&r, &f.dir, f.master, 0).unwrap(), 0);
    }

    #[test]
    fn test_truncate_after() {
        let f = fixture();
        let mut w = f.env.begin_write().unwrap();
        for c in 1..=4 {
            write_page(&mut w, f.master, 1, c, page("x"));
            set_max_page_mark(&mut w, f.master, c, 1);
        }
        assert_eq!(truncate_after(&mut w, f.master, 2).unwrap(), 2);
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(version_count(&r, f.master), 2);
        assert_eq!(r.scan_all(&maxpage_table(f.master)).len(), 2);
    }

    #[test]
    fn test_move_range_keeps_commit_numbers() {
        let mut f = fixture();
        let dev = f.dir.create("dev", Some(f.master), None).unwrap();

        let mut w = f.env.begin_write().unwrap();
        for c in 1..=3 {
            write_page(&mut w, dev, 7, c, page(&format!("d{}", c)));
            set_max_page_mark(&mut w, dev, c, 7);
        }
        assert_eq!(move_range(&mut w, dev, f.master, 0, 2).unwrap(), 2);
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(
            read_local(&r, f.master, 7, 0, 2)
                .unwrap()
                .map(|(c, d)| (c, d.to_vec())),
            Some((2, b"d2".to_vec()))
        );
        assert_eq!(version_count(&r, dev), 1);
        assert_eq!(r.scan_all(&maxpage_table(f.master)).len(), 2);
    }

    #[test]
    fn test_truncate_and_move_span_many_pages() {
        let mut f = fixture();
        let dev = f.dir.create("dev", Some(f.master), None).unwrap();

        let mut w = f.env.begin_write().unwrap();
        for page_no in [1u64, 2, 240, 241, 70_000] {
            for c in 1..=4 {
                write_page(&mut w, dev, page_no, c, page(&format!("{}@{}", page_no, c)));
            }
        }
        assert_eq!(move_range(&mut w, dev, f.master, 1, 3).unwrap(), 10);
        assert_eq!(truncate_after(&mut w, dev, 3).unwrap(), 5);
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(version_count(&r, dev), 5);
        assert_eq!(version_count(&r, f.master), 10);
        for page_no in [1u64, 2, 240, 241, 70_000] {
            let (c, data) = read_local(&r, f.master, page_no, 0, 9).unwrap().unwrap();
            assert_eq!((c, data.to_vec()), (3, format!("{}@3", page_no).into_bytes()));
            let (c, _) = read_local(&r, dev, page_no, 0, 9).unwrap().unwrap();
            assert_eq!(c, 1);
        }
    }

    #[test]
    fn test_malformed_page_key_is_corruption() {
        let f = fixture();
        let mut w = f.env.begin_write().unwrap();
        write_page(&mut w, f.master, 1, 1, page("good"));
        // Page 1, commit 2, plus a stray trailing byte.
        w.put(&pages_table(f.master), &[1, 2, 0], b"bad");
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert!(matches!(
            read_page(&r, &f.dir, f.master, 1, 5),
            Err(StoreError::Corruption(_))
        ));
        assert_eq!(
            read_page(&r, &f.dir, f.master, 1, 1).unwrap().as_deref(),
            Some(&b"good"[..])
        );
    }

    #[test]
    fn test_plain_pages() {
        let f = fixture();
        let mut w = f.env.begin_write().unwrap();
        write_plain(&mut w, 3, page("a"));
        write_plain(&mut w, 300, page("b"));
        write_plain(&mut w, 3, page("c"));
        w.commit().unwrap();

        let r = f.env.begin_read();
        assert_eq!(read_plain(&r, 3).as_deref(), Some(&b"c"[..]));
        assert_eq!(plain_max_page_no(&r).unwrap(), 300);
    }
}
