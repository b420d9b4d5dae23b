//! VKT Files - Single-File Portable Block Stores
//!
//! # Layout
//!
//! ```text
//! header (64 bytes) | index: canonical JSON | body: one zstd frame per block
//! ```
//!
//! Header fields, little-endian:
//!
//! | offset | field          |
//! |--------|----------------|
//! | 0      | magic `VKT\0`  |
//! | 4      | format version (u16) |
//! | 6      | reserved (u16) |
//! | 8      | block count (u32) |
//! | 12     | index offset (u64) |
//! | 20     | index length (u64) |
//! | 28     | body crc32     |
//! | 32     | index crc32    |
//! | 36     | modified-at, unix millis (i64) |
//! | 44     | tenant uuid (16 bytes) |
//! | 60     | header crc32 over bytes 0..60 |
//!
//! Blocks are written in coordinate-key order of their first owner, so
//! blocks with shared prefixes sit next to each other. Each block is its
//! own frame: a lookup decompresses only the block and, for a delta, its
//! base. Output is deterministic for identical store contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CoreConfig, VktOptions};
use crate::coordinate::{Coordinate, CoordinatePrefix};
use crate::error::{CoreError, Result};
use crate::hashing::{canonical_json, ContentHash};
use crate::store::{reconstruct, CoordinateRecord, Encoding, SemanticBlockStore, StoredBlock};
use crate::tenant::TenantId;
use crate::ENGINE_VERSION;

pub const VKT_MAGIC: [u8; 4] = *b"VKT\0";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VktHeader {
    pub format_version: u16,
    pub block_count: u32,
    pub index_offset: u64,
    pub index_len: u64,
    pub body_checksum: u32,
    pub index_checksum: u32,
    pub modified_at_ms: i64,
    pub tenant: TenantId,
}

impl VktHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&VKT_MAGIC);
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.block_count.to_le_bytes());
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_len.to_le_bytes());
        buf.extend_from_slice(&self.body_checksum.to_le_bytes());
        buf.extend_from_slice(&self.index_checksum.to_le_bytes());
        buf.extend_from_slice(&self.modified_at_ms.to_le_bytes());
        buf.extend_from_slice(self.tenant.as_uuid().as_bytes());
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CoreError::corrupt("file shorter than header"));
        }
        let data = &data[..HEADER_LEN];
        if data[0..4] != VKT_MAGIC {
            return Err(CoreError::corrupt("bad magic"));
        }

        let stored = u32::from_le_bytes(le_array(&data[60..64]));
        if crc32fast::hash(&data[..60]) != stored {
            return Err(CoreError::corrupt("header checksum mismatch"));
        }

        let format_version = u16::from_le_bytes(le_array(&data[4..6]));
        if format_version != FORMAT_VERSION {
            return Err(CoreError::corrupt(format!(
                "unsupported format version {}",
                format_version
            )));
        }

        Ok(Self {
            format_version,
            block_count: u32::from_le_bytes(le_array(&data[8..12])),
            index_offset: u64::from_le_bytes(le_array(&data[12..20])),
            index_len: u64::from_le_bytes(le_array(&data[20..28])),
            body_checksum: u32::from_le_bytes(le_array(&data[28..32])),
            index_checksum: u32::from_le_bytes(le_array(&data[32..36])),
            modified_at_ms: i64::from_le_bytes(le_array(&data[36..44])),
            tenant: TenantId::from_uuid(Uuid::from_bytes(le_array(&data[44..60]))),
        })
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.modified_at_ms)
    }
}

/// Copy a slice whose length the caller has already fixed.
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexBlock {
    hash: ContentHash,
    offset: u64,
    length: u64,
    raw_len: u64,
    #[serde(default)]
    base: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    key: String,
    record: CoordinateRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VktIndex {
    writer_version: String,
    max_chain_depth: u8,
    /// Body order.
    blocks: Vec<IndexBlock>,
    /// Sorted by key.
    records: Vec<IndexRecord>,
}

pub fn save(store: &SemanticBlockStore) -> Result<Vec<u8>> {
    save_with(store, &VktOptions::default())
}

/// Serialize `store` into VKT bytes.
pub fn save_with(store: &SemanticBlockStore, options: &VktOptions) -> Result<Vec<u8>> {
    let snapshot = store.snapshot();

    // Each block sorts under the smallest key that owns it; orphans go last.
    let mut first_owner: HashMap<&ContentHash, String> = HashMap::new();
    for record in &snapshot.records {
        let key = record.coordinate.key();
        first_owner
            .entry(&record.content_hash)
            .and_modify(|current| {
                if key < *current {
                    *current = key.clone();
                }
            })
            .or_insert_with(|| key.clone());
    }

    let mut ordered: Vec<(Option<&String>, &StoredBlock)> = snapshot
        .blocks
        .iter()
        .map(|b| (first_owner.get(&b.hash), b))
        .collect();
    ordered.sort_by(|(ka, a), (kb, b)| match (ka, kb) {
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.hash.cmp(&b.hash)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.hash.cmp(&b.hash),
    });

    let mut body = Vec::new();
    let mut blocks = Vec::with_capacity(ordered.len());
    for (_, block) in &ordered {
        let frame = zstd::encode_all(block.stored_bytes(), options.compression_level)?;
        blocks.push(IndexBlock {
            hash: block.hash.clone(),
            offset: body.len() as u64,
            length: frame.len() as u64,
            raw_len: block.raw_len as u64,
            base: block.base().cloned(),
        });
        body.extend_from_slice(&frame);
    }

    let mut records: Vec<IndexRecord> = snapshot
        .records
        .iter()
        .map(|r| IndexRecord {
            key: r.coordinate.key(),
            record: r.clone(),
        })
        .collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));

    let modified_at_ms = snapshot
        .records
        .iter()
        .map(|r| r.touched_at().timestamp_millis())
        .max()
        .unwrap_or(0);

    let index = VktIndex {
        writer_version: ENGINE_VERSION.to_string(),
        max_chain_depth: snapshot.max_chain_depth,
        blocks,
        records,
    };
    let index_bytes = canonical_json(&index)?.into_bytes();

    let header = VktHeader {
        format_version: FORMAT_VERSION,
        block_count: index.blocks.len() as u32,
        index_offset: HEADER_LEN as u64,
        index_len: index_bytes.len() as u64,
        body_checksum: crc32fast::hash(&body),
        index_checksum: crc32fast::hash(&index_bytes),
        modified_at_ms,
        tenant: snapshot.tenant,
    };

    let mut out = header.to_bytes();
    out.reserve(index_bytes.len() + body.len());
    out.extend_from_slice(&index_bytes);
    out.extend_from_slice(&body);

    debug!(
        tenant = %snapshot.tenant,
        blocks = index.blocks.len(),
        records = index.records.len(),
        bytes = out.len(),
        "serialized vkt file"
    );
    Ok(out)
}

/// Load VKT bytes into an equivalent in-memory store.
pub fn load(bytes: Vec<u8>) -> Result<SemanticBlockStore> {
    VktFile::from_bytes(bytes)?.into_store(&CoreConfig::default())
}

/// An immutable, validated VKT image with lazy per-block decoding.
#[derive(Debug)]
pub struct VktFile {
    header: VktHeader,
    bytes: Vec<u8>,
    index: VktIndex,
    block_pos: HashMap<ContentHash, usize>,
    record_pos: HashMap<String, usize>,
}

impl VktFile {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(fs::read(path)?)
    }

    /// Check header, checksums and index consistency. Block frames are
    /// not decompressed here.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = VktHeader::from_bytes(&bytes)?;

        let index_end = header
            .index_offset
            .checked_add(header.index_len)
            .ok_or_else(|| CoreError::corrupt("index range overflows"))?;
        if header.index_offset != HEADER_LEN as u64 || index_end > bytes.len() as u64 {
            return Err(CoreError::corrupt(format!(
                "index range {}..{} does not fit the {}-byte file",
                header.index_offset,
                index_end,
                bytes.len()
            )));
        }

        let index_end = index_end as usize;
        let index_bytes = &bytes[HEADER_LEN..index_end];
        if crc32fast::hash(index_bytes) != header.index_checksum {
            return Err(CoreError::corrupt("index checksum mismatch"));
        }
        let body = &bytes[index_end..];
        if crc32fast::hash(body) != header.body_checksum {
            return Err(CoreError::corrupt("body checksum mismatch"));
        }

        let index: VktIndex = serde_json::from_slice(index_bytes)
            .map_err(|e| CoreError::corrupt(format!("unreadable index: {}", e)))?;
        check_writer_version(&index.writer_version)?;

        if index.blocks.len() != header.block_count as usize {
            return Err(CoreError::corrupt(format!(
                "header declares {} blocks, index has {}",
                header.block_count,
                index.blocks.len()
            )));
        }

        let mut block_pos = HashMap::with_capacity(index.blocks.len());
        for (i, block) in index.blocks.iter().enumerate() {
            let end = block.offset.checked_add(block.length);
            if end.map_or(true, |end| end > body.len() as u64) {
                return Err(CoreError::corrupt(format!(
                    "block {} lies outside the body",
                    block.hash.short()
                )));
            }
            if block_pos.insert(block.hash.clone(), i).is_some() {
                return Err(CoreError::corrupt(format!("duplicate block {}", block.hash.short())));
            }
        }
        if let Some(block) = index
            .blocks
            .iter()
            .find(|b| b.base.as_ref().map_or(false, |base| !block_pos.contains_key(base)))
        {
            return Err(CoreError::corrupt(format!(
                "delta block {} references a missing base",
                block.hash.short()
            )));
        }

        let mut record_pos = HashMap::with_capacity(index.records.len());
        for (i, entry) in index.records.iter().enumerate() {
            let record = &entry.record;
            if entry.key != record.coordinate.key() {
                return Err(CoreError::corrupt(format!("index key mismatch for {}", record.coordinate)));
            }
            if i > 0 && index.records[i - 1].key >= entry.key {
                return Err(CoreError::corrupt("index records out of order"));
            }
            if record.tenant != header.tenant {
                return Err(CoreError::corrupt(format!(
                    "record {} belongs to another tenant",
                    record.coordinate
                )));
            }
            if record.is_live() && !block_pos.contains_key(&record.content_hash) {
                return Err(CoreError::corrupt(format!(
                    "live record {} has no block",
                    record.coordinate
                )));
            }
            record_pos.insert(entry.key.clone(), i);
        }

        Ok(Self {
            header,
            bytes,
            index,
            block_pos,
            record_pos,
        })
    }

    pub fn header(&self) -> &VktHeader {
        &self.header
    }

    pub fn tenant(&self) -> &TenantId {
        &self.header.tenant
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.index.records.iter().filter(|r| r.record.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, coordinate: &Coordinate) -> Option<&CoordinateRecord> {
        self.record_pos
            .get(&coordinate.key())
            .map(|&i| &self.index.records[i].record)
    }

    /// Reconstruct one payload, decoding only its block and base.
    pub fn query(&self, coordinate: &Coordinate) -> Result<Vec<u8>> {
        let record = self
            .record(coordinate)
            .ok_or_else(|| CoreError::NotFound(coordinate.to_string()))?;
        if !record.is_live() {
            return Err(CoreError::Tombstoned(coordinate.to_string()));
        }
        reconstruct(
            &record.content_hash,
            coordinate.as_str(),
            self.index.max_chain_depth,
            |hash| self.read_block(hash),
        )
    }

    /// Live coordinates under `prefix`, lazily, in key order. The scan is
    /// `Clone`, so it can be restarted from any point.
    pub fn query_prefix(&self, prefix: &CoordinatePrefix) -> PrefixScan<'_> {
        let start = self
            .index
            .records
            .partition_point(|r| r.key.as_str() < prefix.as_key());
        PrefixScan {
            records: &self.index.records,
            prefix: prefix.clone(),
            pos: start,
        }
    }

    pub fn coordinates(&self) -> PrefixScan<'_> {
        self.query_prefix(&CoordinatePrefix::all())
    }

    fn body(&self) -> &[u8] {
        &self.bytes[(self.header.index_offset + self.header.index_len) as usize..]
    }

    fn read_block(&self, hash: &ContentHash) -> Result<Option<(Vec<u8>, Option<ContentHash>)>> {
        let Some(&i) = self.block_pos.get(hash) else {
            return Ok(None);
        };
        let entry = &self.index.blocks[i];
        let start = entry.offset as usize;
        let frame = &self.body()[start..start + entry.length as usize];
        let bytes = zstd::decode_all(frame)
            .map_err(|e| CoreError::corrupt(format!("block {} does not decompress: {}", hash.short(), e)))?;
        Ok(Some((bytes, entry.base.clone())))
    }

    /// Materialize a full store. Every live payload is reconstructed and
    /// hash-checked before the store is returned.
    pub fn into_store(self, config: &CoreConfig) -> Result<SemanticBlockStore> {
        let mut blocks = Vec::with_capacity(self.index.blocks.len());
        for entry in &self.index.blocks {
            let (bytes, base) = self
                .read_block(&entry.hash)?
                .ok_or_else(|| CoreError::corrupt(format!("block {} vanished", entry.hash.short())))?;
            let encoding = match base {
                None => Encoding::Full(bytes),
                Some(base) => Encoding::Delta { base, delta: bytes },
            };
            blocks.push(StoredBlock::new(entry.hash.clone(), encoding, entry.raw_len as usize));
        }

        let mut policy = config.store.clone();
        policy.max_chain_depth = policy.max_chain_depth.max(self.index.max_chain_depth);

        let records: Vec<CoordinateRecord> = self.index.records.into_iter().map(|r| r.record).collect();
        let live: Vec<Coordinate> = records
            .iter()
            .filter(|r| r.is_live())
            .map(|r| r.coordinate.clone())
            .collect();

        let store = SemanticBlockStore::from_parts(
            self.header.tenant,
            policy,
            config.validation.clone(),
            records,
            blocks,
        )?;
        for coordinate in &live {
            store
                .get(coordinate)
                .map_err(|e| CoreError::corrupt(format!("{} does not reconstruct: {}", coordinate, e)))?;
        }

        info!(tenant = %self.header.tenant, records = live.len(), "loaded vkt store");
        Ok(store)
    }
}

fn check_writer_version(writer: &str) -> Result<()> {
    let writer = semver::Version::parse(writer)
        .map_err(|_| CoreError::corrupt(format!("invalid writer version '{}'", writer)))?;
    let engine = semver::Version::parse(ENGINE_VERSION)
        .map_err(|_| CoreError::corrupt("invalid engine version"))?;
    if writer.major > engine.major {
        return Err(CoreError::corrupt(format!(
            "written by engine {}, this engine is {}",
            writer, engine
        )));
    }
    Ok(())
}

/// Lazy scan over index records matching a prefix.
#[derive(Debug, Clone)]
pub struct PrefixScan<'a> {
    records: &'a [IndexRecord],
    prefix: CoordinatePrefix,
    pos: usize,
}

impl<'a> Iterator for PrefixScan<'a> {
    type Item = &'a Coordinate;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.records.get(self.pos) {
            if !entry.key.starts_with(self.prefix.as_key()) {
                self.pos = self.records.len();
                return None;
            }
            self.pos += 1;
            if entry.record.is_live() && self.prefix.matches_key(&entry.key) {
                return Some(&entry.record.coordinate);
            }
        }
        None
    }
}

/// Sole writer of one VKT path.
///
/// An exclusive `<path>.lock` file, holding the writer's pid, is kept for
/// the manager's lifetime. A lock left by a process that no longer exists
/// is reclaimed on `open`.
/// Saves go to a temp file in the same directory and are renamed over the
/// target, so readers see the old file or the new one, never a mix.
#[derive(Debug)]
pub struct VktFileManager {
    path: PathBuf,
    lock_path: PathBuf,
    options: VktOptions,
}

impl VktFileManager {
    pub fn open(path: impl Into<PathBuf>, options: VktOptions) -> Result<Self> {
        let path = path.into();
        let lock_path = lock_path_for(&path);

        let mut lock = match create_lock(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !Self::clear_stale_lock(&path)? {
                    return Err(CoreError::WriterLocked(path.display().to_string()));
                }
                create_lock(&lock_path).map_err(|e| match e.kind() {
                    ErrorKind::AlreadyExists => CoreError::WriterLocked(path.display().to_string()),
                    _ => e.into(),
                })?
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(lock, "{}", std::process::id())?;

        Ok(Self {
            path,
            lock_path,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, store: &SemanticBlockStore) -> Result<()> {
        let bytes = save_with(store, &self.options)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(path = %self.path.display(), bytes = bytes.len(), "saved vkt file");
        Ok(())
    }

    pub fn load(&self, config: &CoreConfig) -> Result<SemanticBlockStore> {
        VktFile::open(&self.path)?.into_store(config)
    }

    /// Remove the writer lock on `path` if the process that took it is gone.
    ///
    /// Returns whether a lock was removed. A lock whose holder cannot be
    /// identified (unreadable pid, or no liveness check on this platform)
    /// is left in place.
    pub fn clear_stale_lock(path: &Path) -> Result<bool> {
        let lock_path = lock_path_for(path);
        let content = match fs::read_to_string(&lock_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            debug!(path = %lock_path.display(), "writer lock holds no pid, leaving it");
            return Ok(false);
        };
        if process_exists(pid) {
            return Ok(false);
        }

        match fs::remove_file(&lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        warn!(path = %lock_path.display(), pid, "removed stale vkt writer lock");
        Ok(true)
    }

    /// Read-only view for concurrent readers; needs no writer lock.
    pub fn open_snapshot(path: &Path) -> Result<Arc<VktFile>> {
        Ok(Arc::new(VktFile::open(path)?))
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    PathBuf::from(lock_path)
}

fn create_lock(lock_path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(lock_path)
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return true;
    }
    // Signal 0 checks existence without delivering anything.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}

impl Drop for VktFileManager {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to release vkt writer lock");
        }
    }
}
