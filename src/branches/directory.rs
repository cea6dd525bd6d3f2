//! Branch directory: the authoritative registry of branches.
//!
//! Branches live in an arena indexed by id. Parent links are plain ids, so
//! walking the ancestry is a chain of index lookups guarded against cycles.

use crate::error::{Result, StoreError};
use crate::kv::{KvRead, WriteTxn, MAIN_TABLE};
use crate::types::{Branch, BranchId, BranchInfo};
use crate::varint;
use std::collections::BTreeSet;
use tracing::info;

/// Name of the branch created with a new database.
pub const DEFAULT_BRANCH: &str = "master";

/// Longest ancestor chain accepted before the metadata is considered corrupt.
pub const MAX_ANCESTRY_DEPTH: usize = 4096;

const LAST_BRANCH_ID: &str = "last_branch_id";
const CHANGE_COUNTER: &str = "change_counter";

const FIELD_NAME: &str = "name";
const FIELD_VISIBLE: &str = "visible";
const FIELD_SOURCE_BRANCH: &str = "source_branch";
const FIELD_SOURCE_COMMIT: &str = "source_commit";
const FIELD_LAST_COMMIT: &str = "last_commit";
const FIELD_GENERATION: &str = "generation";

/// All per-branch metadata fields.
pub const BRANCH_FIELDS: [&str; 6] = [
    FIELD_NAME,
    FIELD_VISIBLE,
    FIELD_SOURCE_BRANCH,
    FIELD_SOURCE_COMMIT,
    FIELD_LAST_COMMIT,
    FIELD_GENERATION,
];

/// Metadata key for one field of a branch.
pub fn meta_key(id: BranchId, field: &str) -> String {
    format!("b{}.{}", id.0, field)
}

/// Reject names the directory cannot store or parse back.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Split `NAME` or `NAME.N` into the name and optional commit.
pub fn split_ref(reference: &str) -> Result<(&str, Option<u64>)> {
    match reference.split_once('.') {
        None => Ok((reference, None)),
        Some((name, commit)) => {
            let commit = commit.parse::<u64>().map_err(|_| {
                StoreError::InvalidArgument(format!("bad commit in {:?}", reference))
            })?;
            Ok((name, Some(commit)))
        }
    }
}

fn read_u64(txn: &impl KvRead, key: &str) -> Result<Option<u64>> {
    match txn.get(MAIN_TABLE, key.as_bytes()) {
        Some(raw) => Ok(Some(varint::decode_exact(&raw)?)),
        None => Ok(None),
    }
}

fn write_u64(txn: &mut WriteTxn<'_>, key: &str, value: u64) {
    txn.put(MAIN_TABLE, key.as_bytes(), &varint::encode(value));
}

/// One step of an ancestor walk: look at `branch` for commits up to `bound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineageStep {
    pub branch: BranchId,
    pub bound: u64,
    /// Commits at or below this belong to ancestors.
    pub floor: u64,
}

/// In-memory copy of the branch metadata.
#[derive(Clone, Debug, Default)]
pub struct BranchDirectory {
    /// Indexed by id; slot 0 is unused.
    slots: Vec<Option<Branch>>,
    last_branch_id: u32,
    change_counter: u64,
    dirty: BTreeSet<BranchId>,
    removed: BTreeSet<BranchId>,
}

impl BranchDirectory {
    /// Read the change counter without loading the directory.
    pub fn read_change_counter(txn: &impl KvRead) -> Result<u64> {
        Ok(read_u64(txn, CHANGE_COUNTER)?.unwrap_or(0))
    }

    /// Load every branch record.
    pub fn load(txn: &impl KvRead) -> Result<Self> {
        let last_branch_id = read_u64(txn, LAST_BRANCH_ID)?.unwrap_or(0);
        let last_branch_id = u32::try_from(last_branch_id)
            .map_err(|_| StoreError::Corruption(format!("last_branch_id {}", last_branch_id)))?;

        let mut slots = vec![None; last_branch_id as usize + 1];
        for raw in 1..=last_branch_id {
            let id = BranchId(raw);
            let Some(name) = txn.get(MAIN_TABLE, meta_key(id, FIELD_NAME).as_bytes()) else {
                continue;
            };
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| StoreError::Corruption(format!("branch {} name is not UTF-8", raw)))?;
            let field = |f: &str| read_u64(txn, &meta_key(id, f)).map(Option::unwrap_or_default);

            let source = field(FIELD_SOURCE_BRANCH)?;
            let source_branch = match source {
                0 => None,
                s => Some(BranchId(u32::try_from(s).map_err(|_| {
                    StoreError::Corruption(format!("branch {} source {}", raw, s))
                })?)),
            };
            slots[raw as usize] = Some(Branch {
                id,
                name,
                visible: field(FIELD_VISIBLE)? != 0,
                source_branch,
                source_commit: field(FIELD_SOURCE_COMMIT)?,
                last_commit: field(FIELD_LAST_COMMIT)?,
                generation: field(FIELD_GENERATION)?,
            });
        }

        Ok(Self {
            slots,
            last_branch_id,
            change_counter: Self::read_change_counter(txn)?,
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.last_branch_id > 0
    }

    pub fn change_counter(&self) -> u64 {
        self.change_counter
    }

    pub fn last_branch_id(&self) -> u32 {
        self.last_branch_id
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Create the default root branch on an empty directory.
    pub fn bootstrap(&mut self) -> Result<Option<BranchId>> {
        if self.is_initialized() {
            return Ok(None);
        }
        let id = self.create(DEFAULT_BRANCH, None, None)?;
        Ok(Some(id))
    }

    /// Branch by id, including deleted ones.
    pub fn get(&self, id: BranchId) -> Option<&Branch> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Branch by id, treating a missing record as corruption.
    pub fn branch(&self, id: BranchId) -> Result<&Branch> {
        self.get(id)
            .ok_or_else(|| StoreError::Corruption(format!("missing branch record {}", id)))
    }

    fn branch_mut(&mut self, id: BranchId) -> Result<&mut Branch> {
        self.dirty.insert(id);
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| StoreError::Corruption(format!("missing branch record {}", id)))
    }

    /// Live branch by name.
    pub fn find(&self, name: &str) -> Option<&Branch> {
        self.live().find(|b| b.name == name)
    }

    /// Live branch by name, or `NotFound`.
    pub fn resolve(&self, name: &str) -> Result<&Branch> {
        self.find(name)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", name)))
    }

    /// Live branches in creation order.
    pub fn live(&self) -> impl Iterator<Item = &Branch> {
        self.all().filter(|b| b.visible)
    }

    /// Every recorded branch, deleted ones included.
    pub fn all(&self) -> impl Iterator<Item = &Branch> {
        self.slots.iter().flatten()
    }

    pub fn names(&self) -> Vec<String> {
        self.live().map(|b| b.name.clone()).collect()
    }

    /// Register a new branch.
    ///
    /// With a source, `at` defaults to the source head. Forking exactly at
    /// the source's own fork point attaches the new branch to the ancestor
    /// that owns that commit.
    pub fn create(
        &mut self,
        name: &str,
        source: Option<BranchId>,
        at: Option<u64>,
    ) -> Result<BranchId> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(StoreError::DuplicateName(name.to_string()));
        }

        let (source_branch, source_commit) = match source {
            None => (None, at.unwrap_or(0)),
            Some(source_id) => {
                let mut owner = self.branch(source_id)?;
                let commit = at.unwrap_or(owner.last_commit);
                if commit > owner.last_commit {
                    return Err(StoreError::InvalidForkPoint(format!(
                        "{}.{} is beyond head {}",
                        owner.name, commit, owner.last_commit
                    )));
                }
                let mut depth = 0;
                while commit == owner.source_commit && commit > 0 {
                    let Some(parent) = owner.source_branch else {
                        break;
                    };
                    owner = self.branch(parent)?;
                    depth += 1;
                    if depth > MAX_ANCESTRY_DEPTH {
                        return Err(StoreError::Corruption("branch ancestry cycle".into()));
                    }
                }
                if commit < owner.source_commit {
                    return Err(StoreError::InvalidForkPoint(format!(
                        "{}.{} precedes its fork point {}",
                        owner.name, commit, owner.source_commit
                    )));
                }
                (Some(owner.id), commit)
            }
        };

        let id = BranchId(self.last_branch_id + 1);
        self.last_branch_id = id.0;
        if self.slots.len() <= id.0 as usize {
            self.slots.resize(id.0 as usize + 1, None);
        }
        self.slots[id.0 as usize] = Some(Branch {
            id,
            name: name.to_string(),
            visible: true,
            source_branch,
            source_commit,
            last_commit: source_commit,
            generation: 0,
        });
        self.dirty.insert(id);

        info!(
            target: "branchdb::branches",
            branch = name,
            id = id.0,
            source = ?source_branch,
            source_commit,
            "Branch created"
        );
        Ok(id)
    }

    /// Change the name of a live branch. Ids and stored history are untouched.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<BranchId> {
        validate_name(new_name)?;
        let id = self.resolve(old_name)?.id;
        if self.find(new_name).is_some() {
            return Err(StoreError::DuplicateName(new_name.to_string()));
        }
        self.branch_mut(id)?.name = new_name.to_string();
        info!(target: "branchdb::branches", from = old_name, to = new_name, "Branch renamed");
        Ok(id)
    }

    /// Hide a branch. Its record and history stay for descendants.
    pub fn delete(&mut self, id: BranchId) -> Result<()> {
        let branch = self.branch_mut(id)?;
        branch.visible = false;
        info!(target: "branchdb::branches", branch = %branch.name, id = id.0, "Branch deleted");
        Ok(())
    }

    /// Forget a branch record entirely. Only garbage collection does this.
    pub fn remove(&mut self, id: BranchId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
        self.dirty.remove(&id);
        self.removed.insert(id);
    }

    pub fn set_last_commit(&mut self, id: BranchId, commit: u64) -> Result<()> {
        self.branch_mut(id)?.last_commit = commit;
        Ok(())
    }

    /// Mark the branch's history as rewritten. Returns the new generation.
    pub fn bump_generation(&mut self, id: BranchId) -> Result<u64> {
        let branch = self.branch_mut(id)?;
        branch.generation += 1;
        Ok(branch.generation)
    }

    pub fn set_source(&mut self, id: BranchId, source: BranchId, commit: u64) -> Result<()> {
        let branch = self.branch_mut(id)?;
        branch.source_branch = Some(source);
        branch.source_commit = commit;
        Ok(())
    }

    /// `branch_info` summary.
    pub fn info(&self, name: &str) -> Result<BranchInfo> {
        let branch = self.resolve(name)?;
        let source_branch = match branch.source_branch {
            Some(parent) => Some(self.branch(parent)?.name.clone()),
            None => None,
        };
        Ok(BranchInfo {
            source_commit: source_branch.as_ref().map(|_| branch.source_commit),
            source_branch,
            total_commits: branch.last_commit,
        })
    }

    /// The ancestor walk for reading `id` as of `as_of`: the branch itself
    /// first, then each ancestor bounded by the fork point below it.
    pub fn lineage(&self, id: BranchId, as_of: u64) -> Result<Vec<LineageStep>> {
        let mut steps = Vec::new();
        let mut current = self.branch(id)?;
        let mut bound = as_of;
        loop {
            steps.push(LineageStep {
                branch: current.id,
                bound,
                floor: current.source_commit,
            });
            if steps.len() > MAX_ANCESTRY_DEPTH {
                return Err(StoreError::Corruption(format!(
                    "ancestry of branch {} exceeds {} levels",
                    id, MAX_ANCESTRY_DEPTH
                )));
            }
            let Some(parent) = current.source_branch else {
                break;
            };
            bound = bound.min(current.source_commit);
            current = self.branch(parent)?;
        }
        Ok(steps)
    }

    /// Ids reachable from any live branch through parent links.
    pub fn referenced(&self) -> BTreeSet<BranchId> {
        let mut seen = BTreeSet::new();
        for branch in self.live() {
            let mut current = Some(branch.id);
            let mut depth = 0;
            while let Some(id) = current {
                if !seen.insert(id) || depth > MAX_ANCESTRY_DEPTH {
                    break;
                }
                depth += 1;
                current = self.get(id).and_then(|b| b.source_branch);
            }
        }
        seen
    }

    /// Referenced branches whose parent is `id`.
    pub fn children(&self, id: BranchId) -> Vec<&Branch> {
        let referenced = self.referenced();
        self.all()
            .filter(|b| b.source_branch == Some(id) && referenced.contains(&b.id))
            .collect()
    }

    /// The child with the highest fork point on `id`, if any.
    pub fn highest_fork(&self, id: BranchId) -> Option<&Branch> {
        self.children(id).into_iter().max_by_key(|b| b.source_commit)
    }

    /// Copy selected records from a fresher directory.
    pub fn adopt(&mut self, fresh: &BranchDirectory, ids: &BTreeSet<BranchId>) {
        self.last_branch_id = self.last_branch_id.max(fresh.last_branch_id);
        self.change_counter = fresh.change_counter;
        if self.slots.len() < fresh.slots.len() {
            self.slots.resize(fresh.slots.len(), None);
        }
        for id in ids {
            let idx = id.0 as usize;
            if idx < self.slots.len() {
                self.slots[idx] = fresh.get(*id).cloned();
            }
        }
    }

    /// Ids modified since the last flush.
    pub fn touched(&self) -> BTreeSet<BranchId> {
        self.dirty.union(&self.removed).copied().collect()
    }

    /// Write modified records and bump the change counter.
    pub fn flush(&mut self, txn: &mut WriteTxn<'_>) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        for id in std::mem::take(&mut self.dirty) {
            let branch = self.branch(id)?.clone();
            txn.put(
                MAIN_TABLE,
                meta_key(id, FIELD_NAME).as_bytes(),
                branch.name.as_bytes(),
            );
            write_u64(txn, &meta_key(id, FIELD_VISIBLE), branch.visible as u64);
            write_u64(
                txn,
                &meta_key(id, FIELD_SOURCE_BRANCH),
                branch.source_branch.map_or(0, |s| s.0 as u64),
            );
            write_u64(txn, &meta_key(id, FIELD_SOURCE_COMMIT), branch.source_commit);
            write_u64(txn, &meta_key(id, FIELD_LAST_COMMIT), branch.last_commit);
            if branch.generation > 0 {
                write_u64(txn, &meta_key(id, FIELD_GENERATION), branch.generation);
            }
        }
        for id in std::mem::take(&mut self.removed) {
            for field in BRANCH_FIELDS {
                txn.delete(MAIN_TABLE, meta_key(id, field).as_bytes());
            }
        }
        write_u64(txn, LAST_BRANCH_ID, self.last_branch_id as u64);
        self.change_counter += 1;
        write_u64(txn, CHANGE_COUNTER, self.change_counter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{EnvOptions, Environment};
    use tempfile::TempDir;

    fn directory() -> BranchDirectory {
        let mut dir = BranchDirectory::default();
        dir.bootstrap().unwrap();
        dir
    }

    fn master(dir: &BranchDirectory) -> BranchId {
        dir.resolve(DEFAULT_BRANCH).unwrap().id
    }

    #[test]
    fn test_bootstrap_creates_master() {
        let dir = directory();
        let master = dir.resolve(DEFAULT_BRANCH).unwrap();
        assert_eq!(master.id, BranchId(1));
        assert!(master.is_root());
        assert_eq!(master.last_commit, 0);
    }

    #[test]
    fn test_create_validates_name() {
        let mut dir = directory();
        let m = master(&dir);
        assert!(matches!(
            dir.create("a.b", Some(m), None),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            dir.create("", Some(m), None),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            dir.create(DEFAULT_BRANCH, Some(m), None),
            Err(StoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_fork_point_bounds() {
        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 3).unwrap();

        assert!(matches!(
            dir.create("late", Some(m), Some(4)),
            Err(StoreError::InvalidForkPoint(_))
        ));

        let test = dir.create("test", Some(m), Some(2)).unwrap();
        dir.set_last_commit(test, 4).unwrap();
        assert!(matches!(
            dir.create("early", Some(test), Some(1)),
            Err(StoreError::InvalidForkPoint(_))
        ));
    }

    #[test]
    fn test_fork_at_source_fork_point_reroots() {
        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 3).unwrap();
        let test = dir.create("test", Some(m), Some(2)).unwrap();
        dir.set_last_commit(test, 4).unwrap();

        let sub = dir.create("sub", Some(test), Some(2)).unwrap();
        let sub = dir.get(sub).unwrap();
        assert_eq!(sub.source_branch, Some(m));
        assert_eq!(sub.source_commit, 2);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut dir = directory();
        let m = master(&dir);
        let a = dir.create("a", Some(m), None).unwrap();
        dir.delete(a).unwrap();
        let b = dir.create("a", Some(m), None).unwrap();
        assert!(b > a);
        assert_eq!(dir.names(), vec!["master".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_rename_keeps_id() {
        let mut dir = directory();
        let m = master(&dir);
        let a = dir.create("a", Some(m), None).unwrap();
        assert_eq!(dir.rename("a", "b").unwrap(), a);
        assert!(dir.find("a").is_none());
        assert_eq!(dir.resolve("b").unwrap().id, a);
        assert!(matches!(
            dir.rename("missing", "c"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            dir.rename("b", DEFAULT_BRANCH),
            Err(StoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_info() {
        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 3).unwrap();
        let dev = dir.create("dev", Some(m), Some(2)).unwrap();
        dir.set_last_commit(dev, 5).unwrap();

        let info = dir.info("dev").unwrap();
        assert_eq!(info.source_branch.as_deref(), Some("master"));
        assert_eq!(info.source_commit, Some(2));
        assert_eq!(info.total_commits, 5);

        let root = dir.info("master").unwrap();
        assert!(root.source_branch.is_none());
        assert_eq!(root.total_commits, 3);
    }

    #[test]
    fn test_lineage_bounds() {
        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 10).unwrap();
        let a = dir.create("a", Some(m), Some(4)).unwrap();
        dir.set_last_commit(a, 8).unwrap();
        let b = dir.create("b", Some(a), Some(6)).unwrap();
        dir.set_last_commit(b, 9).unwrap();

        let steps = dir.lineage(b, 9).unwrap();
        let pairs: Vec<_> = steps.iter().map(|s| (s.branch, s.bound)).collect();
        assert_eq!(pairs, vec![(b, 9), (a, 6), (m, 4)]);
    }

    #[test]
    fn test_lineage_cycle_is_corruption() {
        let mut dir = directory();
        let m = master(&dir);
        let a = dir.create("a", Some(m), None).unwrap();
        dir.set_source(m, a, 0).unwrap();
        assert!(matches!(
            dir.lineage(a, 0),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn test_deleted_child_with_live_descendant_is_referenced() {
        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 5).unwrap();
        let a = dir.create("a", Some(m), Some(3)).unwrap();
        dir.set_last_commit(a, 4).unwrap();
        let b = dir.create("b", Some(a), Some(4)).unwrap();
        dir.delete(a).unwrap();

        assert!(dir.referenced().contains(&a));
        assert_eq!(dir.highest_fork(m).map(|c| c.id), Some(a));

        dir.delete(b).unwrap();
        assert!(dir.highest_fork(m).is_none());
    }

    #[test]
    fn test_flush_and_load() {
        let tmp = TempDir::new().unwrap();
        let env = Environment::open(tmp.path().join("db"), EnvOptions::default()).unwrap();

        let mut dir = directory();
        let m = master(&dir);
        dir.set_last_commit(m, 7).unwrap();
        let dev = dir.create("dev", Some(m), Some(5)).unwrap();
        dir.delete(dev).unwrap();
        assert_eq!(dir.bump_generation(m).unwrap(), 1);
        assert_eq!(dir.bump_generation(m).unwrap(), 2);

        let mut w = env.begin_write().unwrap();
        dir.flush(&mut w).unwrap();
        w.commit().unwrap();
        assert!(!dir.is_dirty());

        let loaded = BranchDirectory::load(&env.begin_read()).unwrap();
        assert_eq!(loaded.change_counter(), 1);
        assert_eq!(loaded.names(), vec!["master".to_string()]);
        let dev = loaded.get(dev).unwrap();
        assert!(!dev.visible);
        assert_eq!(dev.name, "dev");
        assert_eq!(dev.source_commit, 5);
        assert_eq!(loaded.branch(m).unwrap().last_commit, 7);
        assert_eq!(loaded.branch(m).unwrap().generation, 2);
        assert_eq!(dev.generation, 0);
    }

    #[test]
    fn test_split_ref() {
        assert_eq!(split_ref("master").unwrap(), ("master", None));
        assert_eq!(split_ref("master.12").unwrap(), ("master", Some(12)));
        assert!(matches!(
            split_ref("master.x"),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
