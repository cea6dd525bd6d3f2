//! Transaction builder.
//!
//! Page writes and statements accumulate in append-only buffers. Savepoints
//! are marks into those buffers, so rolling back to one is a truncation. The
//! commit number is assigned only when the outermost transaction commits.

use crate::error::{Result, StoreError};
use crate::types::Bytes;
use std::collections::{BTreeMap, HashMap};

/// How the transaction was opened, which decides when it ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnOrigin {
    /// `begin()`; ends at `commit()` or `rollback()`.
    Explicit,
    /// Opened by a write outside any transaction.
    Implicit,
    /// Opened by a savepoint; releasing the outermost savepoint commits.
    Savepoint,
}

#[derive(Clone, Debug)]
struct Savepoint {
    name: String,
    writes: usize,
    statements: usize,
}

#[derive(Debug)]
pub struct TxnBuilder {
    origin: TxnOrigin,
    /// Branch head when the transaction started.
    base_commit: u64,
    /// Branch generation when the transaction started.
    base_generation: u64,
    writes: Vec<(u64, Bytes)>,
    /// Page number to the index of its newest write.
    latest: HashMap<u64, usize>,
    statements: Vec<String>,
    savepoints: Vec<Savepoint>,
}

impl TxnBuilder {
    pub fn new(origin: TxnOrigin, base_commit: u64, base_generation: u64) -> Self {
        Self {
            origin,
            base_commit,
            base_generation,
            writes: Vec::new(),
            latest: HashMap::new(),
            statements: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn origin(&self) -> TxnOrigin {
        self.origin
    }

    pub fn base_commit(&self) -> u64 {
        self.base_commit
    }

    pub fn base_generation(&self) -> u64 {
        self.base_generation
    }

    pub fn write(&mut self, page_no: u64, data: Bytes) {
        self.latest.insert(page_no, self.writes.len());
        self.writes.push((page_no, data));
    }

    /// This transaction's own newest image of a page.
    pub fn read(&self, page_no: u64) -> Option<Bytes> {
        self.latest
            .get(&page_no)
            .map(|&idx| self.writes[idx].1.clone())
    }

    pub fn log(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.statements.is_empty()
    }

    pub fn max_written_page(&self) -> Option<u64> {
        self.latest.keys().copied().max()
    }

    /// Final image of every written page.
    pub fn final_pages(&self) -> BTreeMap<u64, Bytes> {
        self.latest
            .iter()
            .map(|(&page, &idx)| (page, self.writes[idx].1.clone()))
            .collect()
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    pub fn savepoint(&mut self, name: &str) {
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            writes: self.writes.len(),
            statements: self.statements.len(),
        });
    }

    fn find(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| StoreError::SavepointNotFound(name.to_string()))
    }

    /// Fold a savepoint and everything above it into the enclosing scope.
    /// Returns true when this ends a savepoint-opened transaction.
    pub fn release(&mut self, name: &str) -> Result<bool> {
        let idx = self.find(name)?;
        self.savepoints.truncate(idx);
        Ok(self.savepoints.is_empty() && self.origin == TxnOrigin::Savepoint)
    }

    /// Discard everything recorded after the savepoint, keeping it open.
    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        let idx = self.find(name)?;
        let mark = self.savepoints[idx].clone();
        self.savepoints.truncate(idx + 1);
        self.writes.truncate(mark.writes);
        self.statements.truncate(mark.statements);

        self.latest.clear();
        for (idx, (page, _)) in self.writes.iter().enumerate() {
            self.latest.insert(*page, idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bytes(s: &str) -> Bytes {
        Arc::from(s.as_bytes())
    }

    #[test]
    fn test_latest_write_wins() {
        let mut txn = TxnBuilder::new(TxnOrigin::Explicit, 0, 0);
        txn.write(1, bytes("a"));
        txn.write(1, bytes("b"));
        txn.write(2, bytes("c"));
        assert_eq!(txn.read(1).as_deref(), Some(&b"b"[..]));
        assert_eq!(txn.final_pages().len(), 2);
        assert_eq!(txn.max_written_page(), Some(2));
    }

    #[test]
    fn test_rollback_to_keeps_savepoint() {
        let mut txn = TxnBuilder::new(TxnOrigin::Explicit, 3, 0);
        txn.write(1, bytes("a"));
        txn.log("s1");
        txn.savepoint("sp");
        txn.write(1, bytes("b"));
        txn.log("s2");

        txn.rollback_to("sp").unwrap();
        assert_eq!(txn.read(1).as_deref(), Some(&b"a"[..]));
        assert_eq!(txn.statements(), &["s1".to_string()]);
        assert_eq!(txn.savepoint_depth(), 1);

        txn.write(2, bytes("x"));
        txn.rollback_to("SP").unwrap();
        assert!(txn.read(2).is_none());
    }

    #[test]
    fn test_nested_release() {
        let mut txn = TxnBuilder::new(TxnOrigin::Savepoint, 0, 0);
        txn.savepoint("outer");
        txn.savepoint("inner");
        txn.write(5, bytes("x"));
        assert!(!txn.release("inner").unwrap());
        assert_eq!(txn.read(5).as_deref(), Some(&b"x"[..]));
        assert!(txn.release("outer").unwrap());
    }

    #[test]
    fn test_release_outer_releases_inner() {
        let mut txn = TxnBuilder::new(TxnOrigin::Explicit, 0, 0);
        txn.savepoint("a");
        txn.savepoint("b");
        assert!(!txn.release("a").unwrap());
        assert_eq!(txn.savepoint_depth(), 0);
        assert!(matches!(
            txn.release("b"),
            Err(StoreError::SavepointNotFound(_))
        ));
    }
}
