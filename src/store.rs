//! Shared per-file store handle.

use crate::branches::BranchDirectory;
use crate::commitlog;
use crate::connection::{ConnectOptions, Connection};
use crate::error::{Result, StoreError};
use crate::kv::{EnvOptions, Environment, IntEncoding, KvRead};
use crate::pages;
use crate::types::StoreStats;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Database file.
    pub path: PathBuf,

    /// Whether to create the file if it doesn't exist.
    pub create_if_missing: bool,

    /// Upper bound on the file size in bytes.
    pub max_db_size: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./branchdb.db"),
            create_if_missing: true,
            max_db_size: None,
        }
    }
}

/// A database file. Cloning is cheap; every clone and every store opened on
/// the same path in this process share one environment.
#[derive(Clone)]
pub struct Store {
    config: StoreConfig,
    env: Arc<Environment>,
}

impl Store {
    /// Open or create the database described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let env = Environment::open(
            &config.path,
            EnvOptions {
                create_if_missing: config.create_if_missing,
                int_encoding: IntEncoding::Varint,
                max_size: config.max_db_size,
            },
        )?;
        if env.int_encoding() != IntEncoding::Varint {
            return Err(StoreError::InvalidFormat(format!(
                "{} uses the legacy fixed-width layout; convert it first",
                config.path.display()
            )));
        }
        Ok(Self { config, env })
    }

    /// Open with defaults.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    pub fn path(&self) -> &Path {
        self.env.path()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Open a new connection.
    pub fn connect(&self, options: ConnectOptions) -> Result<Connection> {
        if let Some(limit) = options.max_db_size {
            self.env.set_max_size(Some(limit));
        }
        Connection::new(self.clone(), options)
    }

    /// Rewrite the file to drop superseded journal frames. Returns bytes freed.
    pub fn compact(&self) -> Result<u64> {
        self.env.compact()
    }

    /// Summary of what the file holds.
    pub fn stats(&self) -> Result<StoreStats> {
        let snapshot = self.env.begin_read();
        let dir = BranchDirectory::load(&snapshot)?;

        let mut stats = StoreStats {
            branch_count: dir.live().count(),
            deleted_branch_count: dir.all().filter(|b| !b.visible).count(),
            table_count: snapshot.table_names().len(),
            file_size: self.env.file_size(),
            snapshot_version: snapshot.version(),
            ..Default::default()
        };
        for branch in dir.all() {
            stats.page_versions += pages::version_count(&snapshot, branch.id) as u64;
            stats.log_entries += commitlog::entry_count(&snapshot, branch.id) as u64;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_shares_environment() {
        let dir = TempDir::new().unwrap();
        let a = Store::open_path(dir.path().join("db")).unwrap();
        let b = Store::open_path(dir.path().join("db")).unwrap();
        assert!(Arc::ptr_eq(a.env(), b.env()));
    }

    #[test]
    fn test_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let result = Store::open(StoreConfig {
            path: dir.path().join("missing"),
            create_if_missing: false,
            ..Default::default()
        });
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_stats_counts_commits() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_path(dir.path().join("db")).unwrap();
        let mut conn = store.connect(ConnectOptions::branching()).unwrap();

        conn.write_page(1, b"one").unwrap();
        conn.log_statement("insert 1").unwrap();
        conn.commit().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.branch_count, 1);
        assert_eq!(stats.page_versions, 1);
        assert_eq!(stats.log_entries, 1);
        assert!(stats.file_size > 0);
    }
}
