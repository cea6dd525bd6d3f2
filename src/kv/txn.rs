//! Snapshot reads and buffered write transactions.

use super::env::{Environment, Snapshot, WriterLock};
use super::journal::{self, Journal, Op, FRAME_OVERHEAD};
use crate::error::{Result, StoreError};
use crate::types::Bytes;
use parking_lot::MutexGuard;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Key/value pairs returned by range scans.
pub type Entries = Vec<(Vec<u8>, Bytes)>;

/// Read access shared by snapshots and write transactions.
pub trait KvRead {
    /// Point lookup.
    fn get(&self, table: &str, key: &[u8]) -> Option<Bytes>;

    /// Least entry whose key lies within the bounds.
    fn first_in(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>)
        -> Option<(Vec<u8>, Bytes)>;

    /// Greatest entry whose key lies within the bounds.
    fn last_in(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>)
        -> Option<(Vec<u8>, Bytes)>;

    /// All entries within the bounds, in key order.
    fn scan(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Entries;

    /// Names of all non-empty tables.
    fn table_names(&self) -> Vec<String>;

    /// Every entry of a table.
    fn scan_all(&self, table: &str) -> Entries {
        self.scan(table, Bound::Unbounded, Bound::Unbounded)
    }

    /// Entries whose key starts with `prefix`.
    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Entries {
        let mut entries = self.scan(table, Bound::Included(prefix), Bound::Unbounded);
        let end = entries
            .iter()
            .position(|(k, _)| !k.starts_with(prefix))
            .unwrap_or(entries.len());
        entries.truncate(end);
        entries
    }
}

/// `BTreeMap::range` panics on inverted bounds; treat them as empty instead.
pub(crate) fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

/// Ordered merge of changes over base entries. A change shadows the base
/// entry with the same key; a `None` change hides it.
pub(crate) struct Overlay<B: Iterator, C: Iterator> {
    base: Peekable<B>,
    changes: Peekable<C>,
    descending: bool,
}

impl<B: Iterator, C: Iterator> Overlay<B, C> {
    pub(crate) fn new(base: B, changes: C, descending: bool) -> Self {
        Self {
            base: base.peekable(),
            changes: changes.peekable(),
            descending,
        }
    }
}

impl<'a, B, C> Iterator for Overlay<B, C>
where
    B: Iterator<Item = (&'a Vec<u8>, &'a Bytes)>,
    C: Iterator<Item = (&'a Vec<u8>, &'a Option<Bytes>)>,
{
    type Item = (&'a Vec<u8>, &'a Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let change_key = self.changes.peek().map(|&(k, _)| k);
            let base_key = self.base.peek().map(|&(k, _)| k);
            match (change_key, base_key) {
                (None, None) => return None,
                (None, Some(_)) => return self.base.next(),
                (Some(_), None) => {}
                (Some(c), Some(b)) => {
                    let order = if self.descending { b.cmp(c) } else { c.cmp(b) };
                    match order {
                        Ordering::Less => {}
                        Ordering::Equal => {
                            self.base.next();
                        }
                        Ordering::Greater => return self.base.next(),
                    }
                }
            }
            if let Some((key, Some(value))) = self.changes.next() {
                return Some((key, value));
            }
        }
    }
}

/// Immutable view of the environment at one point in time.
#[derive(Clone)]
pub struct ReadTxn {
    snapshot: Arc<Snapshot>,
}

impl ReadTxn {
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }

    /// Monotonic version of the snapshot, bumped by every commit.
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }
}

impl KvRead for ReadTxn {
    fn get(&self, table: &str, key: &[u8]) -> Option<Bytes> {
        self.snapshot.get(table, key)
    }

    fn first_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        self.snapshot.first_in(table, lower, upper)
    }

    fn last_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        self.snapshot.last_in(table, lower, upper)
    }

    fn scan(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Entries {
        self.snapshot.scan(table, lower, upper)
    }

    fn table_names(&self) -> Vec<String> {
        self.snapshot.tables.keys().cloned().collect()
    }
}

#[derive(Default)]
struct Pending {
    /// Table was dropped; base entries are hidden.
    dropped: bool,
    /// `None` marks a deletion.
    entries: BTreeMap<Vec<u8>, Option<Bytes>>,
}

/// The single writer of an environment.
///
/// Mutations are buffered and visible to this transaction's own reads. They
/// reach the journal and other readers only on [`WriteTxn::commit`];
/// dropping the transaction discards them.
pub struct WriteTxn<'env> {
    env: &'env Environment,
    // Released before the journal guard so no other thread of this process
    // can take the file lock while it is still held.
    _writer: WriterLock<'env>,
    journal: MutexGuard<'env, Journal>,
    base: Arc<Snapshot>,
    pending: BTreeMap<String, Pending>,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(
        env: &'env Environment,
        journal: MutexGuard<'env, Journal>,
        writer: WriterLock<'env>,
        base: Arc<Snapshot>,
    ) -> Self {
        Self {
            env,
            _writer: writer,
            journal,
            base,
            pending: BTreeMap::new(),
        }
    }

    /// Snapshot this transaction started from.
    pub fn base_version(&self) -> u64 {
        self.base.version
    }

    pub fn put(&mut self, table: &str, key: &[u8], value: &[u8]) {
        self.pending
            .entry(table.to_string())
            .or_default()
            .entries
            .insert(key.to_vec(), Some(Arc::from(value)));
    }

    pub fn put_shared(&mut self, table: &str, key: Vec<u8>, value: Bytes) {
        self.pending
            .entry(table.to_string())
            .or_default()
            .entries
            .insert(key, Some(value));
    }

    pub fn delete(&mut self, table: &str, key: &[u8]) {
        self.pending
            .entry(table.to_string())
            .or_default()
            .entries
            .insert(key.to_vec(), None);
    }

    /// Remove a table and all of its entries.
    pub fn drop_table(&mut self, table: &str) {
        let pending = self.pending.entry(table.to_string()).or_default();
        pending.dropped = true;
        pending.entries.clear();
    }

    fn base_hidden(&self, table: &str) -> bool {
        self.pending.get(table).map_or(false, |p| p.dropped)
    }

    /// Publish the buffered mutations.
    pub fn commit(mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut ops = Vec::new();
        for (table, p) in pending {
            if p.dropped && self.base.tables.contains_key(&table) {
                ops.push(Op::DropTable {
                    table: table.clone(),
                });
            }
            for (key, value) in p.entries {
                match value {
                    Some(value) => ops.push(Op::Put {
                        table: table.clone(),
                        key,
                        value,
                    }),
                    None => ops.push(Op::Delete {
                        table: table.clone(),
                        key,
                    }),
                }
            }
        }
        if ops.is_empty() {
            return Ok(());
        }

        let payload = journal::encode_ops(&ops);
        if let Some(limit) = self.env.max_size() {
            let projected = self.journal.len() + payload.len() as u64 + FRAME_OVERHEAD;
            if projected > limit {
                return Err(StoreError::MapFull { limit });
            }
        }
        self.journal.append(&payload)?;

        let mut next = Snapshot::clone(&self.base);
        next.version += 1;
        next.apply(ops);
        debug!(target: "branchdb::kv", version = next.version, "Write transaction committed");
        self.env.publish(Arc::new(next));
        Ok(())
    }
}

impl KvRead for WriteTxn<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Option<Bytes> {
        if let Some(p) = self.pending.get(table) {
            if let Some(value) = p.entries.get(key) {
                return value.clone();
            }
            if p.dropped {
                return None;
            }
        }
        self.base.get(table, key)
    }

    fn first_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        let Some(p) = self.pending.get(table) else {
            return self.base.first_in(table, lower, upper);
        };
        if is_empty_range(lower, upper) {
            return None;
        }

        let changes = p.entries.range::<[u8], _>((lower, upper));
        let found = match self.base.tables.get(table).filter(|_| !p.dropped) {
            Some(t) => Overlay::new(t.range(lower, upper), changes, false).next(),
            None => Overlay::new(std::iter::empty::<(&Vec<u8>, &Bytes)>(), changes, false).next(),
        };
        found.map(|(k, v)| (k.clone(), Arc::clone(v)))
    }

    fn last_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        let Some(p) = self.pending.get(table) else {
            return self.base.last_in(table, lower, upper);
        };
        if is_empty_range(lower, upper) {
            return None;
        }

        let changes = p.entries.range::<[u8], _>((lower, upper)).rev();
        let found = match self.base.tables.get(table).filter(|_| !p.dropped) {
            Some(t) => Overlay::new(t.range_rev(lower, upper), changes, true).next(),
            None => Overlay::new(std::iter::empty::<(&Vec<u8>, &Bytes)>(), changes, true).next(),
        };
        found.map(|(k, v)| (k.clone(), Arc::clone(v)))
    }

    fn scan(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Entries {
        let Some(p) = self.pending.get(table) else {
            return self.base.scan(table, lower, upper);
        };
        if is_empty_range(lower, upper) {
            return Vec::new();
        }

        let changes = p.entries.range::<[u8], _>((lower, upper));
        let owned = |(k, v): (&Vec<u8>, &Bytes)| (k.clone(), Arc::clone(v));
        match self.base.tables.get(table).filter(|_| !p.dropped) {
            Some(t) => Overlay::new(t.range(lower, upper), changes, false)
                .map(owned)
                .collect(),
            None => Overlay::new(std::iter::empty::<(&Vec<u8>, &Bytes)>(), changes, false)
                .map(owned)
                .collect(),
        }
    }

    fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .base
            .tables
            .keys()
            .filter(|name| !self.base_hidden(name))
            .cloned()
            .collect();
        for name in self.pending.keys() {
            if !names.contains(name) && !self.scan_all(name).is_empty() {
                names.push(name.clone());
            }
        }
        names.retain(|name| !self.scan_all(name).is_empty());
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{EnvOptions, Environment};
    use tempfile::TempDir;

    fn env(dir: &TempDir) -> Arc<Environment> {
        Environment::open(dir.path().join("db"), EnvOptions::default()).unwrap()
    }

    fn b(v: &[u8]) -> Bound<&[u8]> {
        Bound::Included(v)
    }

    #[test]
    fn test_reads_see_own_writes() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"a", b"1");
        assert_eq!(w.get("t", b"a").as_deref(), Some(&b"1"[..]));
        w.delete("t", b"a");
        assert!(w.get("t", b"a").is_none());
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let before = env.begin_read();
        let mut w = env.begin_write().unwrap();
        w.put("t", b"a", b"1");
        w.commit().unwrap();

        assert!(before.get("t", b"a").is_none());
        assert_eq!(env.begin_read().get("t", b"a").as_deref(), Some(&b"1"[..]));
        assert!(env.begin_read().version() > before.version());
    }

    #[test]
    fn test_abort_on_drop() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        {
            let mut w = env.begin_write().unwrap();
            w.put("t", b"a", b"1");
        }
        assert!(env.begin_read().get("t", b"a").is_none());
    }

    #[test]
    fn test_last_in_merges_overlay() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"a", b"1");
        w.put("t", b"c", b"3");
        w.commit().unwrap();

        let mut w = env.begin_write().unwrap();
        w.put("t", b"b", b"2");
        let (k, _) = w.last_in("t", b(b"a"), b(b"bz")).unwrap();
        assert_eq!(k, b"b".to_vec());

        w.delete("t", b"c");
        let (k, _) = w.last_in("t", b(b"a"), b(b"z")).unwrap();
        assert_eq!(k, b"b".to_vec());

        w.delete("t", b"b");
        w.delete("t", b"a");
        assert!(w.last_in("t", b(b"a"), b(b"z")).is_none());
    }

    #[test]
    fn test_first_in_merges_overlay() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"b", b"2");
        w.put("t", b"d", b"4");
        w.commit().unwrap();
        assert_eq!(
            env.begin_read().first_in("t", b(b"a"), b(b"z")).unwrap().0,
            b"b".to_vec()
        );

        let mut w = env.begin_write().unwrap();
        w.put("t", b"c", b"3");
        w.delete("t", b"b");
        let (k, v) = w.first_in("t", b(b"a"), b(b"z")).unwrap();
        assert_eq!((k, v.to_vec()), (b"c".to_vec(), b"3".to_vec()));
        w.delete("t", b"c");
        assert_eq!(w.first_in("t", b(b"a"), b(b"z")).unwrap().0, b"d".to_vec());
        assert!(w.first_in("t", b(b"e"), b(b"z")).is_none());
    }

    #[test]
    fn test_drop_table_hides_base() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"a", b"1");
        w.commit().unwrap();

        let mut w = env.begin_write().unwrap();
        w.drop_table("t");
        assert!(w.get("t", b"a").is_none());
        assert!(w.scan_all("t").is_empty());
        w.put("t", b"z", b"9");
        assert_eq!(w.scan_all("t").len(), 1);
        w.commit().unwrap();

        let r = env.begin_read();
        assert!(r.get("t", b"a").is_none());
        assert_eq!(r.scan_all("t").len(), 1);
    }

    #[test]
    fn test_inverted_bounds_are_empty() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"a", b"1");
        w.commit().unwrap();

        let r = env.begin_read();
        assert!(r.scan("t", b(b"z"), b(b"a")).is_empty());
        assert!(r.last_in("t", b(b"z"), b(b"a")).is_none());
    }

    #[test]
    fn test_scan_prefix() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);

        let mut w = env.begin_write().unwrap();
        w.put("t", b"ab1", b"1");
        w.put("t", b"ab2", b"2");
        w.put("t", b"ac", b"3");
        w.commit().unwrap();

        assert_eq!(env.begin_read().scan_prefix("t", b"ab").len(), 2);
    }
}
