//! Per-connection checkout state and the page-consumer contract.

use super::config::ConnectOptions;
use super::txn::{TxnBuilder, TxnOrigin};
use crate::branches::{split_ref, BranchDirectory, DEFAULT_BRANCH};
use crate::commitlog::{self, CommitRange, LogEdit};
use crate::error::{Result, StoreError};
use crate::history::{self, BranchGcOptions, BranchGcResult, MergeOutcome, MergeSpan};
use crate::kv::{ReadTxn, WriteTxn};
use crate::pages;
use crate::store::{Store, StoreConfig};
use crate::types::{BranchId, BranchInfo, Bytes, Checkout, LogRow};
use lru::LruCache;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// (snapshot version, branch, page, as_of)
type CacheKey = (u64, BranchId, u64, u64);

/// One client of a store.
///
/// Outside a transaction every call starts by moving to the latest
/// committed snapshot and, when another connection changed the branch
/// metadata, re-reading the directory. Inside a transaction the snapshot
/// and directory stay fixed until commit or rollback.
pub struct Connection {
    id: u64,
    store: Store,
    options: ConnectOptions,
    dir: BranchDirectory,
    snapshot: ReadTxn,
    checkout: Option<Checkout>,
    txn: Option<TxnBuilder>,
    cache: Option<LruCache<CacheKey, Option<Bytes>>>,
}

impl Connection {
    /// Open a connection from a `file:PATH?branches=on&...` URI.
    pub fn open(uri: &str) -> Result<Self> {
        let (path, options) = ConnectOptions::from_uri(uri)?;
        let store = Store::open(StoreConfig {
            path,
            max_db_size: options.max_db_size,
            ..Default::default()
        })?;
        store.connect(options)
    }

    pub(crate) fn new(store: Store, options: ConnectOptions) -> Result<Self> {
        let env = Arc::clone(store.env());
        let mut snapshot = env.begin_read();
        let mut dir = BranchDirectory::default();

        if options.branches {
            dir = BranchDirectory::load(&snapshot)?;
            if !dir.is_initialized() {
                let mut w = env.begin_write()?;
                let mut fresh = BranchDirectory::load(&w)?;
                if fresh.bootstrap()?.is_some() {
                    fresh.flush(&mut w)?;
                    w.commit()?;
                }
                dir = fresh;
                snapshot = env.begin_read();
            }
        }

        let checkout = dir
            .find(DEFAULT_BRANCH)
            .or_else(|| dir.live().next())
            .map(Checkout::head);
        let cache = NonZeroUsize::new(options.page_cache_size).map(LruCache::new);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            target: "branchdb::txn",
            connection = id,
            branches = options.branches,
            single_connection = options.single_connection,
            "Connection opened"
        );

        Ok(Self {
            id,
            store,
            options,
            dir,
            snapshot,
            checkout,
            txn: None,
            cache,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn checkout_state(&self) -> Option<Checkout> {
        self.checkout
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Resolved page reads currently held in this connection's cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    // ---------------------------------------------------------------------
    // Snapshot and checkout
    // ---------------------------------------------------------------------

    fn refresh(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Ok(());
        }
        let snapshot = self.store.env().begin_read();
        if snapshot.version() == self.snapshot.version() {
            return Ok(());
        }
        if self.options.branches && !self.options.single_connection {
            let counter = BranchDirectory::read_change_counter(&snapshot)?;
            if counter != self.dir.change_counter() {
                self.dir = BranchDirectory::load(&snapshot)?;
                debug!(
                    target: "branchdb::txn",
                    connection = self.id,
                    change_counter = counter,
                    "Branch directory reloaded"
                );
            }
        }
        self.snapshot = snapshot;
        Ok(())
    }

    /// Validate the checkout against the directory. Returns it with the
    /// commit reads resolve at.
    fn resolve_checkout(&self) -> Result<(Checkout, u64)> {
        let checkout = self
            .checkout
            .ok_or_else(|| StoreError::NotFound("no branch is checked out".into()))?;
        let branch = match self.dir.get(checkout.branch) {
            Some(b) if b.visible => b,
            Some(b) => return Err(StoreError::StaleBranch(b.name.clone())),
            None => return Err(StoreError::StaleBranch(format!("id {}", checkout.branch))),
        };
        match checkout.pinned {
            Some(commit) if commit > branch.last_commit => Err(StoreError::StaleCheckout(format!(
                "{}.{} (head is {})",
                branch.name, commit, branch.last_commit
            ))),
            Some(commit) if checkout.generation != branch.generation => {
                Err(StoreError::StaleCheckout(format!(
                    "{}.{} (history was truncated since checkout)",
                    branch.name, commit
                )))
            }
            Some(commit) => Ok((checkout, commit)),
            None => Ok((checkout, branch.last_commit)),
        }
    }

    /// Start of every statement: refresh, then fail if the checkout went stale.
    fn statement(&mut self) -> Result<()> {
        self.refresh()?;
        if self.options.branches && self.checkout.is_some() {
            self.resolve_checkout()?;
        }
        Ok(())
    }

    fn require_branches(&self) -> Result<()> {
        if self.options.branches {
            Ok(())
        } else {
            Err(StoreError::BranchesDisabled)
        }
    }

    /// Guard for commands that change the checkout or the directory.
    fn branch_command(&mut self) -> Result<()> {
        self.require_branches()?;
        if self.txn.is_some() {
            return Err(StoreError::Transaction(
                "branch commands are not allowed inside a transaction".into(),
            ));
        }
        self.refresh()
    }

    fn install(&mut self, fresh: BranchDirectory, touched: &BTreeSet<BranchId>) {
        if self.options.single_connection {
            self.dir.adopt(&fresh, touched);
        } else {
            self.dir = fresh;
        }
        self.snapshot = self.store.env().begin_read();
    }

    /// Run a directory mutation in its own write transaction.
    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut WriteTxn<'_>, &mut BranchDirectory) -> Result<T>,
    ) -> Result<T> {
        let env = Arc::clone(self.store.env());
        let mut w = env.begin_write()?;
        let mut fresh = BranchDirectory::load(&w)?;
        let value = op(&mut w, &mut fresh)?;
        let touched = fresh.touched();
        fresh.flush(&mut w)?;
        w.commit()?;
        self.install(fresh, &touched);
        Ok(value)
    }

    // ---------------------------------------------------------------------
    // Page-consumer contract
    // ---------------------------------------------------------------------

    fn lookup(&mut self, branch: BranchId, page_no: u64, as_of: u64) -> Result<Option<Bytes>> {
        let key = (self.snapshot.version(), branch, page_no, as_of);
        if let Some(hit) = self.cache.as_mut().and_then(|c| c.get(&key)) {
            return Ok(hit.clone());
        }
        let data = pages::read_page(&self.snapshot, &self.dir, branch, page_no, as_of)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.put(key, data.clone());
        }
        Ok(data)
    }

    /// Read a page at the checkout, seeing this connection's uncommitted writes.
    pub fn read_page(&mut self, page_no: u64) -> Result<Bytes> {
        self.statement()?;
        if let Some(data) = self.txn.as_ref().and_then(|t| t.read(page_no)) {
            return Ok(data);
        }
        let data = if self.options.branches {
            let (checkout, as_of) = self.resolve_checkout()?;
            self.lookup(checkout.branch, page_no, as_of)?
        } else {
            pages::read_plain(&self.snapshot, page_no)
        };
        data.ok_or_else(|| StoreError::NotFound(format!("page {}", page_no)))
    }

    /// Read a page as of an earlier commit of the checked-out branch.
    pub fn read_page_at(&mut self, page_no: u64, commit: u64) -> Result<Bytes> {
        self.require_branches()?;
        self.statement()?;
        let (checkout, head) = self.resolve_checkout()?;
        if commit > head {
            return Err(StoreError::NotFound(format!(
                "commit {} (checkout is at {})",
                commit, head
            )));
        }
        self.lookup(checkout.branch, page_no, commit)?
            .ok_or_else(|| StoreError::NotFound(format!("page {} at {}", page_no, commit)))
    }

    /// Head commit and generation a new transaction builds on.
    fn txn_base(&self) -> Result<(u64, u64)> {
        if !self.options.branches {
            return Ok((0, 0));
        }
        let (checkout, head) = self.resolve_checkout()?;
        Ok((head, self.dir.branch(checkout.branch)?.generation))
    }

    fn writable_txn(&mut self) -> Result<&mut TxnBuilder> {
        if self.options.branches {
            if let Some(commit) = self.resolve_checkout()?.0.pinned {
                return Err(StoreError::ReadOnlyCheckout(format!(
                    "checked out at commit {}",
                    commit
                )));
            }
        }
        let (base, generation) = self.txn_base()?;
        Ok(self
            .txn
            .get_or_insert_with(|| TxnBuilder::new(TxnOrigin::Implicit, base, generation)))
    }

    /// Buffer a page image. Outside a transaction this opens one that the
    /// next `commit` publishes.
    pub fn write_page(&mut self, page_no: u64, data: &[u8]) -> Result<()> {
        self.statement()?;
        self.writable_txn()?.write(page_no, Arc::from(data));
        Ok(())
    }

    /// Record the statement text that produced the current transaction's writes.
    pub fn log_statement(&mut self, statement: &str) -> Result<()> {
        if !self.options.branches {
            return Ok(());
        }
        self.statement()?;
        self.writable_txn()?.log(statement);
        Ok(())
    }

    /// Highest page number in use at the checkout, including buffered writes.
    pub fn current_max_page_no(&mut self) -> Result<u64> {
        self.statement()?;
        let written = self
            .txn
            .as_ref()
            .and_then(TxnBuilder::max_written_page)
            .unwrap_or(0);
        let stored = if self.options.branches {
            let (checkout, as_of) = self.resolve_checkout()?;
            pages::max_page_no(&self.snapshot, &self.dir, checkout.branch, as_of)?
        } else {
            pages::plain_max_page_no(&self.snapshot)?
        };
        Ok(stored.max(written))
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    fn open_txn(&mut self, origin: TxnOrigin) -> Result<()> {
        self.statement()?;
        let (base, generation) = self.txn_base()?;
        self.txn = Some(TxnBuilder::new(origin, base, generation));
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(StoreError::Transaction(
                "cannot start a transaction within a transaction".into(),
            ));
        }
        self.open_txn(TxnOrigin::Explicit)
    }

    /// Publish the transaction. Returns the assigned commit, or `None` when
    /// nothing was recorded or branching is off.
    ///
    /// A failed commit discards the transaction.
    pub fn commit(&mut self) -> Result<Option<u64>> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction is active".into()))?;
        let result = self.publish(&txn);
        if let Err(e) = &result {
            warn!(
                target: "branchdb::txn",
                connection = self.id,
                error = %e,
                "Commit failed, transaction discarded"
            );
        }
        self.refresh()?;
        result
    }

    fn publish(&mut self, txn: &TxnBuilder) -> Result<Option<u64>> {
        if txn.is_empty() {
            return Ok(None);
        }
        let env = Arc::clone(self.store.env());
        let mut w = env.begin_write()?;

        if !self.options.branches {
            for (page_no, data) in txn.final_pages() {
                pages::write_plain(&mut w, page_no, data);
            }
            w.commit()?;
            self.snapshot = env.begin_read();
            return Ok(None);
        }

        let checkout = self
            .checkout
            .ok_or_else(|| StoreError::NotFound("no branch is checked out".into()))?;
        let mut fresh = BranchDirectory::load(&w)?;
        let branch = match fresh.get(checkout.branch) {
            Some(b) if b.visible => b.clone(),
            Some(b) => return Err(StoreError::StaleBranch(b.name.clone())),
            None => return Err(StoreError::StaleBranch(format!("id {}", checkout.branch))),
        };
        if branch.last_commit != txn.base_commit() {
            return Err(StoreError::Busy(format!(
                "{} moved from {} to {} during the transaction",
                branch.name,
                txn.base_commit(),
                branch.last_commit
            )));
        }
        if branch.generation != txn.base_generation() {
            return Err(StoreError::Busy(format!(
                "{} was truncated during the transaction",
                branch.name
            )));
        }

        let commit = branch.last_commit + 1;
        let final_pages = txn.final_pages();
        for (page_no, data) in &final_pages {
            pages::write_page(&mut w, branch.id, *page_no, commit, data.clone());
        }
        let previous = pages::max_page_no(&w, &fresh, branch.id, branch.last_commit)?;
        let mark = previous.max(txn.max_written_page().unwrap_or(0));
        pages::set_max_page_mark(&mut w, branch.id, commit, mark);
        commitlog::append(&mut w, branch.id, commit, txn.statements())?;

        fresh.set_last_commit(branch.id, commit)?;
        let touched = fresh.touched();
        fresh.flush(&mut w)?;
        w.commit()?;
        self.install(fresh, &touched);

        debug!(
            target: "branchdb::txn",
            connection = self.id,
            branch = %branch.name,
            commit,
            pages = final_pages.len(),
            statements = txn.statements().len(),
            "Transaction committed"
        );
        Ok(Some(commit))
    }

    pub fn rollback(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction is active".into()))?;
        debug!(
            target: "branchdb::txn",
            connection = self.id,
            statements = txn.statements().len(),
            "Transaction rolled back"
        );
        self.refresh()
    }

    /// Open a savepoint, starting a transaction if none is active.
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        if self.txn.is_none() {
            self.open_txn(TxnOrigin::Savepoint)?;
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.savepoint(name);
        }
        Ok(())
    }

    /// Release a savepoint. Releasing the savepoint that opened the
    /// transaction commits it.
    pub fn release(&mut self, name: &str) -> Result<Option<u64>> {
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| StoreError::SavepointNotFound(name.to_string()))?;
        if txn.release(name)? {
            self.commit()
        } else {
            Ok(None)
        }
    }

    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.txn
            .as_mut()
            .ok_or_else(|| StoreError::SavepointNotFound(name.to_string()))?
            .rollback_to(name)
    }

    // ---------------------------------------------------------------------
    // Branches
    // ---------------------------------------------------------------------

    /// `NAME`, or `NAME.N` when pinned to a commit.
    pub fn current_branch(&mut self) -> Result<String> {
        self.require_branches()?;
        self.refresh()?;
        let (checkout, _) = self.resolve_checkout()?;
        let name = &self.dir.branch(checkout.branch)?.name;
        Ok(match checkout.pinned {
            Some(commit) => format!("{}.{}", name, commit),
            None => name.clone(),
        })
    }

    /// Check out `NAME` (following its head) or `NAME.N` (read-only).
    pub fn checkout(&mut self, reference: &str) -> Result<()> {
        self.branch_command()?;
        let (name, commit) = split_ref(reference)?;
        let branch = self.dir.resolve(name)?;
        let checkout = match commit {
            Some(commit) if commit > branch.last_commit => {
                return Err(StoreError::NotFound(format!(
                    "commit {}.{} (head is {})",
                    name, commit, branch.last_commit
                )))
            }
            Some(commit) => Checkout::at(branch, commit),
            None => Checkout::head(branch),
        };
        debug!(
            target: "branchdb::txn",
            connection = self.id,
            branch = name,
            commit = ?commit,
            "Checkout"
        );
        self.checkout = Some(checkout);
        Ok(())
    }

    /// Live branch names in creation order.
    pub fn branches(&mut self) -> Result<Vec<String>> {
        self.require_branches()?;
        self.statement()?;
        Ok(self.dir.names())
    }

    /// Fork a branch and check it out. `source` is `NAME` or `NAME.N`;
    /// without it the fork is taken at the current checkout.
    pub fn create_branch(&mut self, name: &str, source: Option<&str>) -> Result<BranchId> {
        self.branch_command()?;
        let (source_name, at) = match source {
            Some(reference) => {
                let (source_name, at) = split_ref(reference)?;
                (Some(source_name.to_string()), at)
            }
            None => (None, None),
        };
        let current = match &source_name {
            Some(_) => None,
            None => Some(self.resolve_checkout()?.0),
        };

        let id = self.mutate(|_, dir| {
            let (source_id, at) = match (source_name, current) {
                (Some(source_name), _) => (dir.resolve(&source_name)?.id, at),
                (None, Some(checkout)) => (checkout.branch, checkout.pinned),
                (None, None) => {
                    return Err(StoreError::NotFound("no branch is checked out".into()))
                }
            };
            dir.create(name, Some(source_id), at)
        })?;
        self.checkout = Some(Checkout::head(self.dir.branch(id)?));
        Ok(id)
    }

    pub fn rename_branch(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.branch_command()?;
        self.statement()?;
        self.mutate(|_, dir| dir.rename(old_name, new_name).map(|_| ()))
    }

    /// Hide a branch. Its history stays readable by descendants.
    pub fn delete_branch(&mut self, name: &str) -> Result<()> {
        self.branch_command()?;
        self.statement()?;
        let current = self.checkout.map(|c| c.branch);
        self.mutate(|_, dir| {
            let id = dir.resolve(name)?.id;
            if Some(id) == current {
                return Err(StoreError::CurrentBranch(name.to_string()));
            }
            dir.delete(id)
        })
    }

    pub fn branch_info(&mut self, name: &str) -> Result<BranchInfo> {
        self.require_branches()?;
        self.statement()?;
        self.dir.info(name)
    }

    /// Drop every commit of `name` after `commit`. Returns how many were dropped.
    pub fn truncate_branch(&mut self, name: &str, commit: u64) -> Result<u64> {
        self.branch_command()?;
        self.statement()?;
        let removed = self.mutate(|w, dir| history::truncate(w, dir, name, commit))?;
        // Our own pinned checkout below the cut still sees the same history.
        if let Some(checkout) = self.checkout.as_mut() {
            if let Some(branch) = self.dir.get(checkout.branch) {
                if branch.name == name && checkout.pinned.map_or(false, |p| p <= commit) {
                    checkout.generation = branch.generation;
                }
            }
        }
        Ok(removed)
    }

    /// Move commits of `source` into its parent `target`. `source` may be
    /// `NAME.N` to merge up to that checkpoint; otherwise `count` commits,
    /// or all of them.
    pub fn merge_forward(
        &mut self,
        target: &str,
        source: &str,
        count: Option<i64>,
    ) -> Result<MergeOutcome> {
        self.branch_command()?;
        self.statement()?;
        let (source_name, checkpoint) = split_ref(source)?;
        let span = match (checkpoint, count) {
            (Some(_), Some(_)) => {
                return Err(StoreError::InvalidArgument(
                    "give either a checkpoint or a count, not both".into(),
                ))
            }
            (Some(commit), None) => MergeSpan::Checkpoint(commit),
            (None, Some(count)) => MergeSpan::Count(count),
            (None, None) => MergeSpan::All,
        };
        self.mutate(|w, dir| history::forward_merge(w, dir, target, source_name, span))
    }

    /// Statement log of `name`, or of the checkout when `None`.
    pub fn branch_log(
        &mut self,
        name: Option<&str>,
        range: CommitRange,
        strict: bool,
    ) -> Result<Vec<LogRow>> {
        self.require_branches()?;
        self.statement()?;
        let checkout = self.checkout.map(|c| c.branch);
        let (branch, head) = match name {
            Some(name) => {
                let branch = self.dir.resolve(name)?;
                if Some(branch.id) == checkout {
                    (branch.id, self.resolve_checkout()?.1)
                } else {
                    (branch.id, branch.last_commit)
                }
            }
            None => {
                let (checkout, head) = self.resolve_checkout()?;
                (checkout.branch, head)
            }
        };
        commitlog::query(&self.snapshot, &self.dir, branch, head, range, strict)
    }

    /// Rewrite the statement log. Stored pages are not recomputed.
    pub fn edit_log(&mut self, edit: &LogEdit) -> Result<()> {
        self.branch_command()?;
        self.statement()?;
        self.mutate(|w, dir| commitlog::apply_edit(w, dir, edit))
    }

    /// Reclaim the stores of deleted branches nothing reads through.
    pub fn collect_garbage(&mut self, options: &BranchGcOptions) -> Result<BranchGcResult> {
        self.branch_command()?;
        self.statement()?;
        let current = self.checkout.map(|c| c.branch);
        self.mutate(|w, dir| history::collect_garbage(w, dir, options, current))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(txn) = &self.txn {
            warn!(
                target: "branchdb::txn",
                connection = self.id,
                statements = txn.statements().len(),
                "Connection closed with an open transaction; rolling back"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> Store {
        Store::open_path(dir.path().join("test.db")).unwrap()
    }

    fn read(conn: &mut Connection, page: u64) -> String {
        String::from_utf8(conn.read_page(page).unwrap().to_vec()).unwrap()
    }

    fn commit_page(conn: &mut Connection, page: u64, data: &str) -> u64 {
        conn.write_page(page, data.as_bytes()).unwrap();
        conn.log_statement(&format!("write {} {}", page, data)).unwrap();
        conn.commit().unwrap().unwrap()
    }

    #[test]
    fn test_page_cache_size_from_uri() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let mut cached = Connection::open(&format!("file:{}?branches=on", path.display())).unwrap();
        commit_page(&mut cached, 1, "a");
        read(&mut cached, 1);
        assert_eq!(cached.cached_pages(), 1);

        let mut uncached = Connection::open(&format!(
            "file:{}?branches=on&page_cache_size=0",
            path.display()
        ))
        .unwrap();
        assert_eq!(uncached.options().page_cache_size, 0);
        assert_eq!(read(&mut uncached, 1), "a");
        assert_eq!(uncached.cached_pages(), 0);
    }

    #[test]
    fn test_bootstrap_checks_out_master() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        assert_eq!(conn.current_branch().unwrap(), "master");
        assert_eq!(conn.branches().unwrap(), vec!["master".to_string()]);
    }

    #[test]
    fn test_commit_numbers_are_sequential() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        assert_eq!(commit_page(&mut conn, 1, "a"), 1);
        assert_eq!(commit_page(&mut conn, 1, "b"), 2);
        assert_eq!(read(&mut conn, 1), "b");
        assert_eq!(conn.read_page_at(1, 1).unwrap().as_ref(), b"a");
    }

    #[test]
    fn test_uncommitted_writes_visible_only_locally() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let mut a = store.connect(ConnectOptions::branching()).unwrap();
        let mut b = store.connect(ConnectOptions::branching()).unwrap();

        a.begin().unwrap();
        a.write_page(1, b"draft").unwrap();
        assert_eq!(read(&mut a, 1), "draft");
        assert!(matches!(b.read_page(1), Err(StoreError::NotFound(_))));

        a.commit().unwrap();
        assert_eq!(read(&mut b, 1), "draft");
    }

    #[test]
    fn test_empty_transaction_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        conn.begin().unwrap();
        assert_eq!(conn.commit().unwrap(), None);
        assert!(matches!(conn.commit(), Err(StoreError::Transaction(_))));
    }

    #[test]
    fn test_write_conflict_is_busy() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let mut a = store.connect(ConnectOptions::branching()).unwrap();
        let mut b = store.connect(ConnectOptions::branching()).unwrap();

        a.begin().unwrap();
        a.write_page(1, b"a").unwrap();
        b.begin().unwrap();
        b.write_page(1, b"b").unwrap();

        assert_eq!(a.commit().unwrap(), Some(1));
        assert!(matches!(b.commit(), Err(StoreError::Busy(_))));
        assert!(!b.in_transaction());
        assert_eq!(read(&mut b, 1), "a");
    }

    #[test]
    fn test_pinned_checkout_is_read_only() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        commit_page(&mut conn, 1, "a");
        commit_page(&mut conn, 1, "b");

        conn.checkout("master.1").unwrap();
        assert_eq!(conn.current_branch().unwrap(), "master.1");
        assert_eq!(read(&mut conn, 1), "a");
        assert!(matches!(
            conn.write_page(1, b"x"),
            Err(StoreError::ReadOnlyCheckout(_))
        ));
        assert!(matches!(
            conn.checkout("master.3"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_savepoint_commit_on_release() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        conn.savepoint("outer").unwrap();
        conn.write_page(1, b"one").unwrap();
        conn.savepoint("inner").unwrap();
        conn.write_page(1, b"two").unwrap();
        conn.rollback_to("inner").unwrap();
        assert_eq!(conn.release("inner").unwrap(), None);
        assert_eq!(conn.release("outer").unwrap(), Some(1));
        assert!(!conn.in_transaction());
        assert_eq!(read(&mut conn, 1), "one");
    }

    #[test]
    fn test_branch_commands_rejected_in_transaction() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        conn.begin().unwrap();
        assert!(matches!(
            conn.create_branch("dev", None),
            Err(StoreError::Transaction(_))
        ));
        conn.rollback().unwrap();
        conn.create_branch("dev", None).unwrap();
        assert_eq!(conn.current_branch().unwrap(), "dev");
    }

    #[test]
    fn test_plain_mode() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::default()).unwrap();
        conn.write_page(3, b"plain").unwrap();
        conn.log_statement("ignored").unwrap();
        assert_eq!(conn.commit().unwrap(), None);
        assert_eq!(read(&mut conn, 3), "plain");
        assert_eq!(conn.current_max_page_no().unwrap(), 3);
        assert!(matches!(
            conn.current_branch(),
            Err(StoreError::BranchesDisabled)
        ));
    }

    #[test]
    fn test_max_page_mark_never_shrinks() {
        let dir = TempDir::new().unwrap();
        let mut conn = test_store(&dir).connect(ConnectOptions::branching()).unwrap();
        commit_page(&mut conn, 7, "high");
        commit_page(&mut conn, 2, "low");
        assert_eq!(conn.current_max_page_no().unwrap(), 7);
        conn.write_page(9, b"pending").unwrap();
        assert_eq!(conn.current_max_page_no().unwrap(), 9);
    }
}
