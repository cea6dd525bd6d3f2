//! Append-only journal backing an environment file.
//!
//! Layout: `MAGIC | VERSION | u32 manifest length | manifest (MessagePack)`
//! followed by frames `u32 length | payload | u32 crc32`. A payload is the
//! list of table operations of one committed write transaction.

use crate::error::{Result, StoreError};
use crate::types::Bytes;
use crate::varint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Magic bytes for environment files.
const JOURNAL_MAGIC: &[u8; 4] = b"BDB\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Frame overhead: length prefix plus checksum.
pub const FRAME_OVERHEAD: u64 = 8;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_DROP_TABLE: u8 = 3;

/// How integers inside keys and values are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntEncoding {
    /// Order-preserving varints.
    Varint,
    /// Fixed 4-byte integers written by older releases.
    LegacyFixed32,
}

/// File-level metadata stored in the header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub int_encoding: IntEncoding,
}

/// One mutation recorded in a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put {
        table: String,
        key: Vec<u8>,
        value: Bytes,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
    DropTable {
        table: String,
    },
}

/// Tables recovered by replaying a journal.
pub type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Bytes>>;

/// Write handle for a journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Journal {
    /// Create a new journal with the given manifest, failing if the file exists.
    pub fn create(path: impl AsRef<Path>, manifest: &Manifest) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let len = write_header(&mut file, manifest)?;
        file.sync_all()?;
        Ok(Self { path, file, len })
    }

    /// Open an existing journal, replaying every complete frame.
    ///
    /// A torn or corrupt tail is cut off so later appends start from the
    /// last durable commit.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Manifest, Tables)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let (manifest, tables, valid_len) = {
            let map = unsafe { memmap2::Mmap::map(&file)? };
            replay(&map)?
        };

        if valid_len < file_len {
            warn!(
                target: "branchdb::kv",
                path = %path.display(),
                discarded = file_len - valid_len,
                "Truncating incomplete journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path,
                file,
                len: valid_len,
            },
            manifest,
            tables,
        ))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames appended through other handles on the same file since this
    /// one last read or wrote. An incomplete frame at the tail is left for
    /// a later call.
    pub fn read_new(&mut self) -> Result<Vec<Vec<Op>>> {
        let file_len = self.file.metadata()?.len();
        if file_len <= self.len {
            return Ok(Vec::new());
        }
        let map = unsafe { memmap2::Mmap::map(&self.file)? };
        let start = usize::try_from(self.len)
            .map_err(|_| StoreError::Overflow("journal offset".into()))?;
        let (frames, used) = read_frames(&map[start..]);
        self.len += used as u64;
        Ok(frames)
    }

    /// Append one frame and sync it. On failure the file is cut back to its
    /// previous length.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let frame_len = u32::try_from(payload.len())
            .map_err(|_| StoreError::Overflow("journal frame larger than 4 GiB".into()))?;
        let checksum = crc32fast::hash(payload);

        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&frame_len.to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let result = self
            .file
            .seek(SeekFrom::Start(self.len))
            .and_then(|_| self.file.write_all(&frame))
            .and_then(|_| self.file.sync_data());

        match result {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                let _ = self.file.set_len(self.len);
                Err(e.into())
            }
        }
    }

    /// Replace the journal with a single frame holding `tables`.
    pub fn rewrite(&mut self, manifest: &Manifest, tables: &Tables) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp, manifest)?;
        tmp.sync_all()?;
        drop(tmp);

        let mut rewritten = Journal {
            path: tmp_path.clone(),
            file: OpenOptions::new().read(true).write(true).open(&tmp_path)?,
            len: 0,
        };
        rewritten.len = rewritten.file.metadata()?.len();

        let ops: Vec<Op> = tables
            .iter()
            .flat_map(|(table, entries)| {
                entries.iter().map(move |(key, value)| Op::Put {
                    table: table.clone(),
                    key: key.clone(),
                    value: Arc::clone(value),
                })
            })
            .collect();
        if !ops.is_empty() {
            rewritten.append(&encode_ops(&ops))?;
        }

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.len = rewritten.len;
        Ok(())
    }
}

fn write_header(file: &mut File, manifest: &Manifest) -> Result<u64> {
    let encoded = rmp_serde::to_vec(manifest)?;
    file.write_all(JOURNAL_MAGIC)?;
    file.write_all(&[JOURNAL_VERSION])?;
    file.write_all(&(encoded.len() as u32).to_le_bytes())?;
    file.write_all(&encoded)?;
    Ok((JOURNAL_MAGIC.len() + 1 + 4 + encoded.len()) as u64)
}

/// Read only the manifest of a journal file.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let bytes = fs::read(path)?;
    let (manifest, _) = read_header(&bytes)?;
    Ok(manifest)
}

fn read_header(data: &[u8]) -> Result<(Manifest, usize)> {
    if data.len() < JOURNAL_MAGIC.len() + 5 || &data[..4] != JOURNAL_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
    }
    if data[4] != JOURNAL_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported journal version: {}",
            data[4]
        )));
    }
    let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let end = 9 + len;
    if data.len() < end {
        return Err(StoreError::InvalidFormat("Truncated journal header".into()));
    }
    let manifest: Manifest = rmp_serde::from_slice(&data[9..end])?;
    Ok((manifest, end))
}

/// Replay every valid frame, returning the tables and the length of the
/// durable prefix.
fn replay(data: &[u8]) -> Result<(Manifest, Tables, u64)> {
    let (manifest, start) = read_header(data)?;
    let mut tables = Tables::new();
    let (frames, used) = read_frames(&data[start..]);
    for ops in frames {
        apply_ops(&mut tables, ops);
    }
    Ok((manifest, tables, (start + used) as u64))
}

/// Decode the complete, checksummed frames at the front of `data`,
/// returning their operations and the number of bytes they span.
fn read_frames(data: &[u8]) -> (Vec<Vec<Op>>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let body = pos + 4;
        let end = body + len + 4;
        if end > data.len() {
            break;
        }
        let payload = &data[body..body + len];
        let stored = u32::from_le_bytes([
            data[body + len],
            data[body + len + 1],
            data[body + len + 2],
            data[body + len + 3],
        ]);
        if crc32fast::hash(payload) != stored {
            break;
        }
        match decode_ops(payload) {
            Ok(ops) => frames.push(ops),
            Err(_) => break,
        }
        pos = end;
    }

    (frames, pos)
}

/// Apply decoded operations to an in-memory table set.
pub fn apply_ops(tables: &mut Tables, ops: Vec<Op>) {
    for op in ops {
        match op {
            Op::Put { table, key, value } => {
                tables.entry(table).or_default().insert(key, value);
            }
            Op::Delete { table, key } => {
                if let Some(entries) = tables.get_mut(&table) {
                    entries.remove(&key);
                    if entries.is_empty() {
                        tables.remove(&table);
                    }
                }
            }
            Op::DropTable { table } => {
                tables.remove(&table);
            }
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    varint::encode_into(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Encode a frame payload.
pub fn encode_ops(ops: &[Op]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            Op::Put { table, key, value } => {
                out.push(OP_PUT);
                put_bytes(&mut out, table.as_bytes());
                put_bytes(&mut out, key);
                put_bytes(&mut out, value);
            }
            Op::Delete { table, key } => {
                out.push(OP_DELETE);
                put_bytes(&mut out, table.as_bytes());
                put_bytes(&mut out, key);
            }
            Op::DropTable { table } => {
                out.push(OP_DROP_TABLE);
                put_bytes(&mut out, table.as_bytes());
            }
        }
    }
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self) -> Result<&'a [u8]> {
        let (len, used) = varint::decode(&self.data[self.pos..])?;
        let start = self.pos + used;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| StoreError::Corruption("journal field overruns frame".into()))?;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    fn table(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::Corruption("table name is not UTF-8".into()))
    }
}

/// Decode a frame payload.
pub fn decode_ops(payload: &[u8]) -> Result<Vec<Op>> {
    let mut cursor = Cursor {
        data: payload,
        pos: 0,
    };
    let mut ops = Vec::new();
    while cursor.pos < payload.len() {
        let tag = payload[cursor.pos];
        cursor.pos += 1;
        let op = match tag {
            OP_PUT => Op::Put {
                table: cursor.table()?,
                key: cursor.bytes()?.to_vec(),
                value: Arc::from(cursor.bytes()?),
            },
            OP_DELETE => Op::Delete {
                table: cursor.table()?,
                key: cursor.bytes()?.to_vec(),
            },
            OP_DROP_TABLE => Op::DropTable {
                table: cursor.table()?,
            },
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown journal op tag {}",
                    other
                )))
            }
        };
        ops.push(op);
    }
    Ok(ops)
}
