//! Environment: one database file shared by every connection in the process.
//!
//! Several processes may open the same file. Each holds a shared lock on
//! `PATH-lock` while open and takes `PATH-writer` exclusively for the life of
//! a write transaction; frames appended by other processes are replayed
//! before each new transaction starts.

use super::journal::{IntEncoding, Journal, Manifest, Op, Tables};
use super::txn::{is_empty_range, Entries, Overlay, ReadTxn, WriteTxn};
use crate::error::{Result, StoreError};
use crate::types::Bytes;
use fs2::FileExt;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{btree_map, BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::iter::Rev;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Environments currently open in this process, keyed by canonical path.
static OPEN_ENVIRONMENTS: Lazy<Mutex<HashMap<PathBuf, Weak<Environment>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Changed keys a table buffers before folding them into its base.
const FOLD_THRESHOLD: usize = 1024;

type TableEntries = BTreeMap<Vec<u8>, Bytes>;

type Changes = BTreeMap<Vec<u8>, Option<Bytes>>;

/// One table of a snapshot: a shared base plus the keys changed since the
/// last fold. Publishing a commit copies only the changes, so readers that
/// hold an older snapshot keep sharing the base.
#[derive(Clone, Default)]
pub(crate) struct Table {
    base: Arc<TableEntries>,
    changes: Changes,
    len: usize,
}

impl Table {
    fn from_entries(entries: TableEntries) -> Self {
        Self {
            len: entries.len(),
            base: Arc::new(entries),
            changes: Changes::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&Bytes> {
        match self.changes.get(key) {
            Some(change) => change.as_ref(),
            None => self.base.get(key),
        }
    }

    /// Entries within the bounds in ascending order. Bounds must not be
    /// inverted.
    pub(crate) fn range(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Overlay<btree_map::Range<'_, Vec<u8>, Bytes>, btree_map::Range<'_, Vec<u8>, Option<Bytes>>>
    {
        Overlay::new(
            self.base.range::<[u8], _>((lower, upper)),
            self.changes.range::<[u8], _>((lower, upper)),
            false,
        )
    }

    /// Entries within the bounds in descending order.
    pub(crate) fn range_rev(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Overlay<
        Rev<btree_map::Range<'_, Vec<u8>, Bytes>>,
        Rev<btree_map::Range<'_, Vec<u8>, Option<Bytes>>>,
    > {
        Overlay::new(
            self.base.range::<[u8], _>((lower, upper)).rev(),
            self.changes.range::<[u8], _>((lower, upper)).rev(),
            true,
        )
    }

    fn insert(&mut self, key: Vec<u8>, value: Bytes) {
        if self.get(&key).is_none() {
            self.len += 1;
        }
        self.changes.insert(key, Some(value));
        self.maybe_fold();
    }

    fn remove(&mut self, key: Vec<u8>) {
        if self.get(&key).is_some() {
            self.len -= 1;
            self.changes.insert(key, None);
            self.maybe_fold();
        }
    }

    fn maybe_fold(&mut self) {
        if self.changes.len() < FOLD_THRESHOLD {
            return;
        }
        // Copies the base only while an older snapshot still shares it.
        let base = Arc::make_mut(&mut self.base);
        for (key, change) in std::mem::take(&mut self.changes) {
            match change {
                Some(value) => {
                    base.insert(key, value);
                }
                None => {
                    base.remove(&key);
                }
            }
        }
    }

    fn to_entries(&self) -> TableEntries {
        self.range(Bound::Unbounded, Bound::Unbounded)
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

/// Immutable table set published by a commit.
#[derive(Clone, Default)]
pub struct Snapshot {
    pub(crate) version: u64,
    pub(crate) tables: BTreeMap<String, Arc<Table>>,
}

impl Snapshot {
    fn from_tables(tables: Tables) -> Self {
        Self {
            version: 0,
            tables: tables
                .into_iter()
                .map(|(name, entries)| (name, Arc::new(Table::from_entries(entries))))
                .collect(),
        }
    }

    pub(crate) fn get(&self, table: &str, key: &[u8]) -> Option<Bytes> {
        self.tables.get(table)?.get(key).cloned()
    }

    pub(crate) fn first_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        if is_empty_range(lower, upper) {
            return None;
        }
        self.tables
            .get(table)?
            .range(lower, upper)
            .next()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
    }

    pub(crate) fn last_in(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(Vec<u8>, Bytes)> {
        if is_empty_range(lower, upper) {
            return None;
        }
        self.tables
            .get(table)?
            .range_rev(lower, upper)
            .next()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
    }

    pub(crate) fn scan(&self, table: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Entries {
        if is_empty_range(lower, upper) {
            return Vec::new();
        }
        match self.tables.get(table) {
            Some(t) => t
                .range(lower, upper)
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Apply committed operations to the tables they touch.
    pub(crate) fn apply(&mut self, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::Put { table, key, value } => {
                    Arc::make_mut(self.tables.entry(table).or_default()).insert(key, value);
                }
                Op::Delete { table, key } => {
                    if let Some(entries) = self.tables.get_mut(&table) {
                        let entries = Arc::make_mut(entries);
                        entries.remove(key);
                        if entries.is_empty() {
                            self.tables.remove(&table);
                        }
                    }
                }
                Op::DropTable { table } => {
                    self.tables.remove(&table);
                }
            }
        }
    }

    fn to_tables(&self) -> Tables {
        self.tables
            .iter()
            .map(|(name, t)| (name.clone(), t.to_entries()))
            .collect()
    }
}

/// Options for opening an environment.
#[derive(Clone, Debug)]
pub struct EnvOptions {
    pub create_if_missing: bool,

    /// Integer layout for a newly created file.
    pub int_encoding: IntEncoding,

    /// Upper bound on the file size in bytes.
    pub max_size: Option<u64>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            int_encoding: IntEncoding::Varint,
            max_size: None,
        }
    }
}

/// A database file with single-writer, many-reader transactions.
pub struct Environment {
    path: PathBuf,

    /// Shared while open, exclusive for offline tools and compaction.
    lock_file: File,

    /// Opened through [`Environment::open_exclusive`].
    exclusive: bool,

    /// Held exclusively by the process running a write transaction.
    writer_file: File,

    manifest: Manifest,

    /// Latest committed snapshot.
    current: RwLock<Arc<Snapshot>>,

    /// Held for the lifetime of a write transaction.
    journal: Mutex<Journal>,

    /// 0 means unlimited.
    max_size: AtomicU64,
}

impl Environment {
    /// Open (or create) the environment at `path`, reusing the instance
    /// already open in this process if there is one.
    pub fn open(path: impl AsRef<Path>, options: EnvOptions) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let mut registry = OPEN_ENVIRONMENTS.lock();

        if let Ok(canonical) = path.canonicalize() {
            if let Some(env) = registry.get(&canonical).and_then(Weak::upgrade) {
                if let Some(limit) = options.max_size {
                    env.set_max_size(Some(limit));
                }
                return Ok(env);
            }
        }

        let env = Arc::new(Self::open_locked(path, &options, false)?);
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(env.path.clone(), Arc::downgrade(&env));
        Ok(env)
    }

    /// Whether `path` is currently open in this process.
    pub fn is_open(path: impl AsRef<Path>) -> bool {
        let Ok(canonical) = path.as_ref().canonicalize() else {
            return false;
        };
        OPEN_ENVIRONMENTS
            .lock()
            .get(&canonical)
            .map_or(false, |weak| weak.strong_count() > 0)
    }

    /// Open without consulting the process registry, locking out every
    /// other handle on the file. Used by offline tools.
    pub fn open_exclusive(path: impl AsRef<Path>, options: &EnvOptions) -> Result<Self> {
        Self::open_locked(path.as_ref(), options, true)
    }

    fn open_locked(path: &Path, options: &EnvOptions, exclusive: bool) -> Result<Self> {
        let path = path.to_path_buf();
        if !path.exists() && !options.create_if_missing {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let lock_file = Self::acquire_lock(&path, exclusive)?;
        let writer_file = Self::open_lock_file(&Self::sibling(&path, "-writer"))?;

        let (journal, manifest, tables) = {
            let _writer = WriterLock::acquire(&writer_file)?;
            if path.exists() {
                Journal::open(&path)?
            } else {
                let manifest = Manifest {
                    int_encoding: options.int_encoding,
                };
                let journal = Journal::create(&path, &manifest)?;
                info!(target: "branchdb::kv", path = %path.display(), "Created database file");
                (journal, manifest, Tables::new())
            }
        };

        let path = path.canonicalize()?;
        Ok(Self {
            path,
            lock_file,
            exclusive,
            writer_file,
            manifest,
            current: RwLock::new(Arc::new(Snapshot::from_tables(tables))),
            journal: Mutex::new(journal),
            max_size: AtomicU64::new(options.max_size.unwrap_or(0)),
        })
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn acquire_lock(path: &Path, exclusive: bool) -> Result<File> {
        let lock_file = Self::open_lock_file(&Self::sibling(path, "-lock"))?;

        if exclusive {
            lock_file
                .try_lock_exclusive()
                .map_err(|_| StoreError::Locked)?;
        } else {
            FileExt::try_lock_shared(&lock_file).map_err(|_| StoreError::Locked)?;
        }

        Ok(lock_file)
    }

    /// Publish frames other processes appended since this environment last
    /// read the journal.
    fn catch_up(&self, journal: &mut Journal) -> Result<()> {
        let frames = journal.read_new()?;
        if frames.is_empty() {
            return Ok(());
        }
        let mut next = Snapshot::clone(&self.current.read());
        next.version += 1;
        let count = frames.len();
        for ops in frames {
            next.apply(ops);
        }
        debug!(
            target: "branchdb::kv",
            frames = count,
            version = next.version,
            "Replayed commits from another process"
        );
        self.publish(Arc::new(next));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn int_encoding(&self) -> IntEncoding {
        self.manifest.int_encoding
    }

    pub fn max_size(&self) -> Option<u64> {
        match self.max_size.load(Ordering::Acquire) {
            0 => None,
            limit => Some(limit),
        }
    }

    pub fn set_max_size(&self, limit: Option<u64>) {
        self.max_size.store(limit.unwrap_or(0), Ordering::Release);
    }

    /// Current size of the database file.
    pub fn file_size(&self) -> u64 {
        self.journal.lock().len()
    }

    /// Start a read transaction on the latest committed snapshot.
    ///
    /// While a writer of this process holds the journal its base is already
    /// current, so catching up is skipped rather than waited for.
    pub fn begin_read(&self) -> ReadTxn {
        if let Some(mut journal) = self.journal.try_lock() {
            if let Err(e) = self.catch_up(&mut journal) {
                warn!(
                    target: "branchdb::kv",
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read commits from other processes"
                );
            }
        }
        ReadTxn::new(Arc::clone(&self.current.read()))
    }

    /// Start the write transaction, blocking while another one is active in
    /// this or any other process.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let mut journal = self.journal.lock();
        let writer = WriterLock::acquire(&self.writer_file)?;
        self.catch_up(&mut journal)?;
        let base = Arc::clone(&self.current.read());
        Ok(WriteTxn::new(self, journal, writer, base))
    }

    pub(crate) fn publish(&self, snapshot: Arc<Snapshot>) {
        *self.current.write() = snapshot;
    }

    /// Rewrite the file so it holds only the live contents. Fails with
    /// [`StoreError::Locked`] while another process has the file open.
    pub fn compact(&self) -> Result<u64> {
        let mut journal = self.journal.lock();
        let sole = self.exclusive || self.lock_file.try_lock_exclusive().is_ok();
        let result = if sole {
            self.rewrite(&mut journal)
        } else {
            Err(StoreError::Locked)
        };
        if !self.exclusive {
            // A failed upgrade may already have dropped the shared lock.
            FileExt::lock_shared(&self.lock_file)?;
        }
        result
    }

    fn rewrite(&self, journal: &mut Journal) -> Result<u64> {
        self.catch_up(journal)?;
        let before = journal.len();
        let tables = self.current.read().to_tables();
        journal.rewrite(&self.manifest, &tables)?;
        let after = journal.len();
        info!(
            target: "branchdb::kv",
            path = %self.path.display(),
            before,
            after,
            "Compacted database file"
        );
        Ok(before.saturating_sub(after))
    }

    /// Write every given table in one frame. Used by offline conversion.
    pub(crate) fn load_tables(&self, tables: Tables) -> Result<()> {
        let mut w = self.begin_write()?;
        for (name, entries) in tables {
            for (key, value) in entries {
                w.put_shared(&name, key, value);
            }
        }
        w.commit()
    }
}

/// Exclusive hold on the writer lock file, released on drop.
pub(crate) struct WriterLock<'a>(&'a File);

impl<'a> WriterLock<'a> {
    fn acquire(file: &'a File) -> Result<Self> {
        file.lock_exclusive()?;
        Ok(Self(file))
    }
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.0);
    }
}

/// Copy every table of a snapshot. Used by conversion tooling.
pub(crate) fn tables_from_snapshot(txn: &ReadTxn) -> Tables {
    use super::txn::KvRead;
    txn.table_names()
        .into_iter()
        .map(|name| {
            let entries = txn.scan_all(&name).into_iter().collect();
            (name, entries)
        })
        .collect()
}
