//! Offline file conversions.
//!
//! Both conversions work on closed files only and hold the cross-process
//! lock while they run.

use crate::branches::{BranchDirectory, BRANCH_FIELDS};
use crate::commitlog::log_table;
use crate::error::{Result, StoreError};
use crate::kv::env::tables_from_snapshot;
use crate::kv::journal::Tables;
use crate::kv::{EnvOptions, Environment, IntEncoding, KvRead, ReadTxn, WriteTxn};
use crate::pages::{maxpage_table, pages_table};
use crate::types::BranchId;
use crate::varint;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Conventional shift applied when widening commit ids to 64 bits.
pub const COMMIT_ID_SHIFT: u64 = 0xFFFF_FFFE;

/// What a conversion rewrote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub branches: u64,
    pub page_versions: usize,
    pub max_page_marks: usize,
    pub log_entries: usize,
}

fn refuse_if_open(path: &Path) -> Result<()> {
    if Environment::is_open(path) {
        return Err(StoreError::Locked);
    }
    Ok(())
}

fn existing() -> EnvOptions {
    EnvOptions {
        create_if_missing: false,
        ..Default::default()
    }
}

fn fixed_u32(raw: &[u8], what: &str) -> Result<u64> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| StoreError::Corruption(format!("{} is {} bytes, expected 4", what, raw.len())))?;
    Ok(u32::from_le_bytes(bytes) as u64)
}

fn fixed_pair(raw: &[u8], what: &str) -> Result<(u64, u64)> {
    if raw.len() != 8 {
        return Err(StoreError::Corruption(format!(
            "{} key is {} bytes, expected 8",
            what,
            raw.len()
        )));
    }
    let hi = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64;
    let lo = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
    Ok((hi, lo))
}

/// Per-branch table a name refers to.
enum BranchTable {
    Pages,
    MaxPage,
    Log,
}

fn classify(table: &str) -> Option<BranchTable> {
    let rest = table.strip_prefix('b')?;
    let (id, kind) = rest.split_once('-')?;
    id.parse::<u32>().ok()?;
    match kind {
        "pages" => Some(BranchTable::Pages),
        "maxpage" => Some(BranchTable::MaxPage),
        "log" => Some(BranchTable::Log),
        _ => None,
    }
}

fn convert_meta(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let name = String::from_utf8_lossy(key);
    if name == "last_branch_id" || name == "change_counter" {
        return Ok(varint::encode(fixed_u32(value, &name)?));
    }
    let field = name
        .split_once('.')
        .filter(|(prefix, field)| prefix.starts_with('b') && BRANCH_FIELDS.contains(field))
        .map(|(_, field)| field);
    match field {
        Some("name") => Ok(value.strip_suffix(&[0]).unwrap_or(value).to_vec()),
        Some(_) => Ok(varint::encode(fixed_u32(value, &name)?)),
        None => Ok(value.to_vec()),
    }
}

/// Rewrite a legacy fixed-width file as a new varint file at `dst`.
///
/// Logical content is unchanged: every integer in keys and values is
/// re-encoded and branch names lose their NUL terminator.
pub fn convert_legacy(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<ConversionReport> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    refuse_if_open(src)?;
    if dst.exists() {
        return Err(StoreError::InvalidArgument(format!(
            "{} already exists",
            dst.display()
        )));
    }

    let source = Environment::open_exclusive(src, &existing())?;
    if source.int_encoding() != IntEncoding::LegacyFixed32 {
        return Err(StoreError::InvalidFormat(format!(
            "{} is not a legacy file",
            src.display()
        )));
    }
    let legacy = tables_from_snapshot(&source.begin_read());

    let mut report = ConversionReport::default();
    let mut tables = Tables::new();
    for (name, entries) in legacy {
        let mut converted = BTreeMap::new();
        for (key, value) in entries {
            let (key, value) = match classify(&name) {
                Some(BranchTable::Pages) => {
                    let (page, commit) = fixed_pair(&key, &name)?;
                    report.page_versions += 1;
                    (varint::encode_pair(page, commit), value)
                }
                Some(BranchTable::MaxPage) => {
                    let commit = fixed_u32(&key, &name)?;
                    let max_page = fixed_u32(&value, &name)?;
                    report.max_page_marks += 1;
                    (varint::encode(commit), Arc::from(varint::encode(max_page)))
                }
                Some(BranchTable::Log) => {
                    let (commit, seq) = fixed_pair(&key, &name)?;
                    report.log_entries += 1;
                    (varint::encode_pair(commit, seq), value)
                }
                None => {
                    let value = convert_meta(&key, &value)?;
                    (key, Arc::from(value))
                }
            };
            converted.insert(key, value);
        }
        tables.insert(name, converted);
    }

    let target = Environment::open_exclusive(dst, &EnvOptions::default())?;
    target.load_tables(tables)?;
    report.branches = BranchDirectory::load(&target.begin_read())?.all().count() as u64;

    info!(
        target: "branchdb::kv",
        src = %src.display(),
        dst = %dst.display(),
        branches = report.branches,
        pages = report.page_versions,
        statements = report.log_entries,
        "Converted legacy file"
    );
    Ok(report)
}

/// Re-key every entry of `table` whose commit is below `shift`.
fn shift_table(
    snapshot: &ReadTxn,
    w: &mut WriteTxn<'_>,
    table: &str,
    shift: u64,
    rekey: impl Fn(&[u8], u64) -> Result<Option<Vec<u8>>>,
) -> Result<usize> {
    let mut moved = Vec::new();
    for (key, value) in snapshot.scan_all(table) {
        if let Some(new_key) = rekey(&key, shift)? {
            moved.push((key, new_key, value));
        }
    }
    for (old_key, _, _) in &moved {
        w.delete(table, old_key);
    }
    for (_, new_key, value) in &moved {
        w.put_shared(table, new_key.clone(), value.clone());
    }
    Ok(moved.len())
}

fn shift_page_key(key: &[u8], shift: u64) -> Result<Option<Vec<u8>>> {
    let (page_no, commit) = varint::decode_pair(key)?;
    Ok((commit < shift).then(|| varint::encode_pair(page_no, commit + shift)))
}

fn shift_log_key(key: &[u8], shift: u64) -> Result<Option<Vec<u8>>> {
    let (commit, seq) = varint::decode_pair(key)?;
    Ok((commit < shift).then(|| varint::encode_pair(commit + shift, seq)))
}

fn shift_single(key: &[u8], shift: u64) -> Result<Option<Vec<u8>>> {
    let commit = varint::decode_exact(key)?;
    Ok((commit < shift).then(|| varint::encode(commit + shift)))
}

/// Move every commit id below `shift` up by `shift`, in place.
///
/// Heads and non-zero fork points move with the stored keys, so every
/// branch reads exactly as before under its new commit numbers.
pub fn widen_commit_ids(path: impl AsRef<Path>, shift: u64) -> Result<ConversionReport> {
    let path = path.as_ref();
    refuse_if_open(path)?;
    if shift == 0 {
        return Err(StoreError::InvalidArgument("shift must be positive".into()));
    }

    let env = Environment::open_exclusive(path, &existing())?;
    if env.int_encoding() != IntEncoding::Varint {
        return Err(StoreError::InvalidFormat(format!(
            "{} uses the legacy layout; convert it first",
            path.display()
        )));
    }
    let snapshot = env.begin_read();
    let mut dir = BranchDirectory::load(&snapshot)?;
    let ids: Vec<BranchId> = dir.all().map(|b| b.id).collect();

    let mut report = ConversionReport {
        branches: ids.len() as u64,
        ..Default::default()
    };
    let mut w = env.begin_write()?;
    for id in ids {
        let branch = dir.branch(id)?.clone();
        let last_commit = branch
            .last_commit
            .checked_add(shift)
            .ok_or_else(|| StoreError::Overflow(format!("{}.last_commit", branch.name)))?;
        dir.set_last_commit(id, last_commit)?;
        if let Some(source) = branch.source_branch {
            if branch.source_commit > 0 {
                dir.set_source(id, source, branch.source_commit + shift)?;
            }
        }

        report.page_versions += shift_table(&snapshot, &mut w, &pages_table(id), shift, shift_page_key)?;
        report.max_page_marks +=
            shift_table(&snapshot, &mut w, &maxpage_table(id), shift, shift_single)?;
        report.log_entries += shift_table(&snapshot, &mut w, &log_table(id), shift, shift_log_key)?;
    }
    dir.flush(&mut w)?;
    w.commit()?;

    info!(
        target: "branchdb::kv",
        path = %path.display(),
        shift,
        branches = report.branches,
        pages = report.page_versions,
        "Widened commit ids"
    );
    Ok(report)
}
