//! Semantic Block Store - Content-Addressed, Prefix-Delta Storage
//!
//! CRITICAL: `put` MUST validate the coordinate against this store's own
//! records before anything is written. There is no unvalidated write path.
//!
//! Blocks live in an arena keyed by content hash. A block is either a full
//! payload or a delta against a base block chosen by longest shared
//! coordinate prefix. Reconstruction walks base references with an explicit
//! depth bound, so a runaway or cyclic chain is an error, not a hang.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::config::{StorePolicy, ValidationLimits};
use crate::coordinate::{Coordinate, CoordinatePrefix};
use crate::delta;
use crate::error::{CoreError, Result};
use crate::hashing::ContentHash;
use crate::tenant::TenantId;
use crate::validation::{RecordLookup, RecordStatus, ValidationContext, ValidationResult, Validator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateRecord {
    pub coordinate: Coordinate,
    pub tenant: TenantId,
    pub created_at: DateTime<Utc>,
    pub content_hash: ContentHash,
    #[serde(default)]
    pub payload_ref: Option<String>,
    /// Incremented each time a tombstoned coordinate is stored again.
    pub version: u32,
    /// Store-wide insertion order; breaks ties when choosing delta bases.
    pub sequence: u64,
    #[serde(default)]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl CoordinateRecord {
    pub fn is_live(&self) -> bool {
        self.tombstoned_at.is_none()
    }

    pub fn status(&self) -> RecordStatus {
        if self.is_live() {
            RecordStatus::Live
        } else {
            RecordStatus::Tombstoned
        }
    }

    /// Latest moment this record changed.
    pub fn touched_at(&self) -> DateTime<Utc> {
        self.tombstoned_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockKind {
    Full,
    Delta { base: ContentHash },
}

/// Public view of the block backing a coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticBlock {
    pub coordinate: Coordinate,
    pub content_hash: ContentHash,
    pub kind: BlockKind,
    /// Length of the reconstructed payload.
    pub raw_len: usize,
    /// Length of what is actually kept: the payload or the encoded delta.
    pub stored_len: usize,
}

impl SemanticBlock {
    pub fn is_delta(&self) -> bool {
        matches!(self.kind, BlockKind::Delta { .. })
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Encoding {
    Full(Vec<u8>),
    Delta { base: ContentHash, delta: Vec<u8> },
}

#[derive(Debug, Clone)]
pub(crate) struct StoredBlock {
    pub(crate) hash: ContentHash,
    pub(crate) encoding: Encoding,
    pub(crate) raw_len: usize,
    live_owners: usize,
    dependents: usize,
}

impl StoredBlock {
    pub(crate) fn new(hash: ContentHash, encoding: Encoding, raw_len: usize) -> Self {
        Self {
            hash,
            encoding,
            raw_len,
            live_owners: 0,
            dependents: 0,
        }
    }

    pub(crate) fn base(&self) -> Option<&ContentHash> {
        match &self.encoding {
            Encoding::Full(_) => None,
            Encoding::Delta { base, .. } => Some(base),
        }
    }

    pub(crate) fn stored_bytes(&self) -> &[u8] {
        match &self.encoding {
            Encoding::Full(bytes) => bytes,
            Encoding::Delta { delta, .. } => delta,
        }
    }

    fn kind(&self) -> BlockKind {
        match self.base() {
            None => BlockKind::Full,
            Some(base) => BlockKind::Delta { base: base.clone() },
        }
    }

    fn reclaimable(&self) -> bool {
        self.live_owners == 0 && self.dependents == 0
    }
}

/// Walk base references from `hash`, then apply deltas back up the chain.
///
/// `fetch` returns the stored bytes and base reference of one block, or
/// `None` if the arena has no such block. At most `max_depth` delta hops
/// are followed. The result is checked against `hash`.
pub(crate) fn reconstruct<F>(
    hash: &ContentHash,
    coordinate: &str,
    max_depth: u8,
    mut fetch: F,
) -> Result<Vec<u8>>
where
    F: FnMut(&ContentHash) -> Result<Option<(Vec<u8>, Option<ContentHash>)>>,
{
    let mut deltas = Vec::new();
    let mut current = hash.clone();
    let mut payload = loop {
        let (bytes, base) = fetch(&current)?.ok_or_else(|| CoreError::BrokenDeltaChain {
            coordinate: coordinate.to_string(),
            base: current.to_string(),
        })?;
        match base {
            None => break bytes,
            Some(base) => {
                if deltas.len() >= max_depth as usize {
                    return Err(CoreError::ChainDepthExceeded {
                        coordinate: coordinate.to_string(),
                        max_depth,
                    });
                }
                deltas.push(bytes);
                current = base;
            }
        }
    };

    for encoded in deltas.iter().rev() {
        payload = delta::apply(&payload, encoded)?;
    }

    let actual = ContentHash::of(&payload);
    if actual != *hash {
        return Err(CoreError::IntegrityMismatch {
            coordinate: coordinate.to_string(),
            expected: hash.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(payload)
}

#[derive(Debug)]
struct StoreState {
    tenant: TenantId,
    /// Keyed by `Coordinate::key`, so iteration is prefix-ordered.
    records: BTreeMap<String, CoordinateRecord>,
    blocks: HashMap<ContentHash, StoredBlock>,
    next_sequence: u64,
}

impl StoreState {
    fn live_record(&self, coordinate: &Coordinate) -> Result<&CoordinateRecord> {
        let record = self
            .records
            .get(&coordinate.key())
            .ok_or_else(|| CoreError::NotFound(coordinate.to_string()))?;
        if !record.is_live() {
            return Err(CoreError::Tombstoned(coordinate.to_string()));
        }
        Ok(record)
    }

    fn reconstruct(&self, hash: &ContentHash, coordinate: &str, max_depth: u8) -> Result<Vec<u8>> {
        reconstruct(hash, coordinate, max_depth, |h| {
            Ok(self
                .blocks
                .get(h)
                .map(|b| (b.stored_bytes().to_vec(), b.base().cloned())))
        })
    }

    /// Delta hops from `hash` to a full block; `limit + 1` if longer or broken.
    fn chain_depth(&self, hash: &ContentHash, limit: u8) -> u8 {
        let mut depth = 0;
        let mut current = self.blocks.get(hash);
        while let Some(block) = current {
            let Some(base) = block.base() else {
                return depth;
            };
            if depth > limit {
                break;
            }
            depth += 1;
            current = self.blocks.get(base);
        }
        limit.saturating_add(1)
    }

    fn insert_block(&mut self, block: StoredBlock) {
        if let Some(base) = block.base().cloned() {
            if let Some(base_block) = self.blocks.get_mut(&base) {
                base_block.dependents += 1;
            }
        }
        self.blocks.insert(block.hash.clone(), block);
    }

    fn remove_block(&mut self, hash: &ContentHash) -> Option<StoredBlock> {
        let block = self.blocks.remove(hash)?;
        if let Some(base) = block.base() {
            if let Some(base_block) = self.blocks.get_mut(base) {
                base_block.dependents = base_block.dependents.saturating_sub(1);
            }
        }
        Some(block)
    }

    fn describe(&self, record: &CoordinateRecord) -> Option<SemanticBlock> {
        let block = self.blocks.get(&record.content_hash)?;
        Some(SemanticBlock {
            coordinate: record.coordinate.clone(),
            content_hash: block.hash.clone(),
            kind: block.kind(),
            raw_len: block.raw_len,
            stored_len: block.stored_bytes().len(),
        })
    }
}

impl RecordLookup for StoreState {
    fn status(&self, tenant: &TenantId, coordinate: &Coordinate) -> Option<RecordStatus> {
        if *tenant != self.tenant {
            return None;
        }
        self.records.get(&coordinate.key()).map(|r| r.status())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub live_records: usize,
    pub tombstones: usize,
    pub full_blocks: usize,
    pub delta_blocks: usize,
    pub raw_bytes: usize,
    pub stored_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub purged_blocks: usize,
    pub reclaimed_bytes: usize,
    /// Set when the pass stopped early; the store is still consistent.
    pub interrupted: bool,
}

/// Everything `vkt` needs to write a store out.
pub(crate) struct StoreSnapshot {
    pub(crate) tenant: TenantId,
    pub(crate) max_chain_depth: u8,
    pub(crate) records: Vec<CoordinateRecord>,
    pub(crate) blocks: Vec<StoredBlock>,
}

/// Tenant-scoped block store. One lock guards the whole tenant scope.
pub struct SemanticBlockStore {
    tenant: TenantId,
    policy: StorePolicy,
    validator: Validator,
    state: RwLock<StoreState>,
}

impl SemanticBlockStore {
    pub fn new(tenant: TenantId) -> Self {
        Self::with_config(tenant, StorePolicy::default(), ValidationLimits::default())
    }

    pub fn with_config(tenant: TenantId, policy: StorePolicy, limits: ValidationLimits) -> Self {
        Self {
            tenant,
            policy,
            validator: Validator::with_limits(limits),
            state: RwLock::new(StoreState {
                tenant,
                records: BTreeMap::new(),
                blocks: HashMap::new(),
                next_sequence: 0,
            }),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    /// Validate against the records currently in this store.
    pub fn validate(&self, coordinate: &Coordinate) -> ValidationResult {
        let state = self.state.read();
        let ctx = ValidationContext::with_lookup(&self.tenant, &*state);
        self.validator.validate(coordinate, &ctx)
    }

    pub fn put(&self, coordinate: &Coordinate, payload: &[u8]) -> Result<SemanticBlock> {
        self.put_with_ref(coordinate, payload, None)
    }

    /// Store `payload` under `coordinate`.
    ///
    /// This ALWAYS validates first; any violation rejects the write.
    pub fn put_with_ref(
        &self,
        coordinate: &Coordinate,
        payload: &[u8],
        payload_ref: Option<String>,
    ) -> Result<SemanticBlock> {
        let hash = ContentHash::of(payload);
        let mut state = self.state.write();

        let validation = {
            let ctx = ValidationContext::with_lookup(&self.tenant, &*state);
            self.validator.validate(coordinate, &ctx)
        };
        if !validation.valid {
            debug!(coordinate = %coordinate, rules = ?validation.violated_rules(), "put rejected");
            return Err(CoreError::ValidationRejected {
                coordinate: coordinate.to_string(),
                result: validation,
            });
        }

        if !state.blocks.contains_key(&hash) {
            let block = self.encode_block(&state, coordinate, payload, hash.clone())?;
            state.insert_block(block);
        } else {
            debug!(coordinate = %coordinate, hash = hash.short(), "payload deduplicated");
        }
        if let Some(block) = state.blocks.get_mut(&hash) {
            block.live_owners += 1;
        }

        let key = coordinate.key();
        let version = state.records.get(&key).map_or(1, |r| r.version + 1);
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let record = CoordinateRecord {
            coordinate: coordinate.clone(),
            tenant: self.tenant,
            created_at: Utc::now(),
            content_hash: hash,
            payload_ref,
            version,
            sequence,
            tombstoned_at: None,
        };
        let block = state
            .describe(&record)
            .ok_or_else(|| CoreError::NotFound(coordinate.to_string()))?;
        state.records.insert(key, record);
        Ok(block)
    }

    /// Pick the live block sharing the longest coordinate prefix with
    /// `coordinate` and a comparable size; newer records win ties.
    fn choose_base<'s>(
        &self,
        state: &'s StoreState,
        coordinate: &Coordinate,
        payload_len: usize,
    ) -> Option<&'s StoredBlock> {
        state
            .records
            .values()
            .filter(|r| r.is_live())
            .filter_map(|r| {
                let block = state.blocks.get(&r.content_hash)?;
                let shared = coordinate.shared_prefix_len(&r.coordinate);
                if shared < self.policy.min_shared_segments
                    || !self.policy.size_compatible(block.raw_len, payload_len)
                {
                    return None;
                }
                Some((shared, r.sequence, block))
            })
            .max_by_key(|(shared, sequence, _)| (*shared, *sequence))
            .map(|(_, _, block)| block)
    }

    fn encode_block(
        &self,
        state: &StoreState,
        coordinate: &Coordinate,
        payload: &[u8],
        hash: ContentHash,
    ) -> Result<StoredBlock> {
        let full = |hash| StoredBlock::new(hash, Encoding::Full(payload.to_vec()), payload.len());

        let Some(base) = self.choose_base(state, coordinate, payload.len()) else {
            debug!(coordinate = %coordinate, hash = hash.short(), "stored full block (no base)");
            return Ok(full(hash));
        };

        let max_depth = self.policy.max_chain_depth;
        if state.chain_depth(&base.hash, max_depth) >= max_depth {
            debug!(
                coordinate = %coordinate,
                base = base.hash.short(),
                "base at maximum chain depth, forcing full copy"
            );
            return Ok(full(hash));
        }

        let base_payload = state.reconstruct(&base.hash, coordinate.as_str(), max_depth)?;
        let encoded = delta::encode(&base_payload, payload);
        if !self.policy.delta_worthwhile(encoded.len(), payload.len()) {
            debug!(
                coordinate = %coordinate,
                delta_len = encoded.len(),
                raw_len = payload.len(),
                "delta not worthwhile, stored full block"
            );
            return Ok(full(hash));
        }

        debug!(
            coordinate = %coordinate,
            base = base.hash.short(),
            delta_len = encoded.len(),
            raw_len = payload.len(),
            "stored delta block"
        );
        Ok(StoredBlock::new(
            hash,
            Encoding::Delta {
                base: base.hash.clone(),
                delta: encoded,
            },
            payload.len(),
        ))
    }

    /// Reconstruct the exact bytes last stored under `coordinate`.
    pub fn get(&self, coordinate: &Coordinate) -> Result<Vec<u8>> {
        let state = self.state.read();
        let record = state.live_record(coordinate)?;
        state.reconstruct(&record.content_hash, coordinate.as_str(), self.policy.max_chain_depth)
    }

    /// Tombstone the record. Its block stays in the arena while any delta
    /// depends on it; `compact` reclaims it afterwards.
    pub fn delete(&self, coordinate: &Coordinate) -> Result<CoordinateRecord> {
        let mut state = self.state.write();
        let hash = state.live_record(coordinate)?.content_hash.clone();

        if let Some(block) = state.blocks.get_mut(&hash) {
            block.live_owners = block.live_owners.saturating_sub(1);
            if block.live_owners == 0 && block.dependents > 0 {
                info!(
                    coordinate = %coordinate,
                    hash = hash.short(),
                    dependents = block.dependents,
                    "tombstoned block retained as delta base"
                );
            }
        }

        let record = state
            .records
            .get_mut(&coordinate.key())
            .ok_or_else(|| CoreError::NotFound(coordinate.to_string()))?;
        record.tombstoned_at = Some(Utc::now());
        Ok(record.clone())
    }

    /// Latest record for `coordinate`, live or tombstoned.
    pub fn record(&self, coordinate: &Coordinate) -> Option<CoordinateRecord> {
        self.state.read().records.get(&coordinate.key()).cloned()
    }

    pub fn block(&self, coordinate: &Coordinate) -> Option<SemanticBlock> {
        let state = self.state.read();
        let record = state.records.get(&coordinate.key())?;
        state.describe(record)
    }

    /// Live coordinates under `prefix`, in key order.
    pub fn scan(&self, prefix: &CoordinatePrefix) -> Vec<Coordinate> {
        let state = self.state.read();
        state
            .records
            .range(prefix.as_key().to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix.as_key()))
            .filter(|(key, record)| record.is_live() && prefix.matches_key(key))
            .map(|(_, record)| record.coordinate.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.values().filter(|r| r.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        let mut stats = StoreStats::default();
        for record in state.records.values() {
            if record.is_live() {
                stats.live_records += 1;
            } else {
                stats.tombstones += 1;
            }
        }
        for block in state.blocks.values() {
            match block.encoding {
                Encoding::Full(_) => stats.full_blocks += 1,
                Encoding::Delta { .. } => stats.delta_blocks += 1,
            }
            stats.raw_bytes += block.raw_len;
            stats.stored_bytes += block.stored_bytes().len();
        }
        stats
    }

    /// Rewrite the block behind `coordinate` as a full copy, dropping its
    /// dependency on a base. Explicit maintenance only.
    pub fn flatten(&self, coordinate: &Coordinate) -> Result<SemanticBlock> {
        let mut state = self.state.write();
        let record = state.live_record(coordinate)?.clone();
        let max_depth = self.policy.max_chain_depth;

        let is_delta = state
            .blocks
            .get(&record.content_hash)
            .map_or(false, |b| b.base().is_some());
        if is_delta {
            let payload = state.reconstruct(&record.content_hash, coordinate.as_str(), max_depth)?;
            if let Some(old) = state.remove_block(&record.content_hash) {
                let mut block = StoredBlock::new(old.hash, Encoding::Full(payload), old.raw_len);
                block.live_owners = old.live_owners;
                block.dependents = old.dependents;
                state.insert_block(block);
            }
            info!(coordinate = %coordinate, hash = record.content_hash.short(), "flattened delta block");
        }

        state
            .describe(&record)
            .ok_or_else(|| CoreError::NotFound(coordinate.to_string()))
    }

    pub fn compact(&self) -> CompactionReport {
        self.compact_until(|| false)
    }

    /// Purge blocks with no live owner and no dependent delta, one block
    /// per lock acquisition. `interrupt` is polled between blocks.
    pub fn compact_until<F>(&self, mut interrupt: F) -> CompactionReport
    where
        F: FnMut() -> bool,
    {
        let mut report = CompactionReport::default();
        loop {
            if interrupt() {
                report.interrupted = true;
                info!(purged = report.purged_blocks, "compaction interrupted");
                break;
            }

            let mut state = self.state.write();
            let victim = state
                .blocks
                .values()
                .filter(|b| b.reclaimable())
                .map(|b| b.hash.clone())
                .min();
            let Some(hash) = victim else {
                break;
            };
            if let Some(block) = state.remove_block(&hash) {
                debug!(hash = hash.short(), "purged block");
                report.purged_blocks += 1;
                report.reclaimed_bytes += block.stored_bytes().len();
            }
        }
        if !report.interrupted {
            info!(
                purged = report.purged_blocks,
                reclaimed_bytes = report.reclaimed_bytes,
                "compaction complete"
            );
        }
        report
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        StoreSnapshot {
            tenant: self.tenant,
            max_chain_depth: self.policy.max_chain_depth,
            records: state.records.values().cloned().collect(),
            blocks: state.blocks.values().cloned().collect(),
        }
    }

    /// Rebuild a store from persisted parts, re-deriving ownership counts.
    pub(crate) fn from_parts(
        tenant: TenantId,
        policy: StorePolicy,
        limits: ValidationLimits,
        records: Vec<CoordinateRecord>,
        blocks: Vec<StoredBlock>,
    ) -> Result<Self> {
        let store = Self::with_config(tenant, policy, limits);
        {
            let mut state = store.state.write();
            for block in blocks {
                state.blocks.insert(block.hash.clone(), block);
            }

            let bases: Vec<ContentHash> = state.blocks.values().filter_map(|b| b.base().cloned()).collect();
            for base in bases {
                let block = state.blocks.get_mut(&base).ok_or_else(|| {
                    CoreError::corrupt(format!("delta base {} has no block", base))
                })?;
                block.dependents += 1;
            }

            for record in records {
                if record.tenant != tenant {
                    return Err(CoreError::corrupt(format!(
                        "record {} belongs to tenant {}",
                        record.coordinate, record.tenant
                    )));
                }
                if record.is_live() {
                    let block = state.blocks.get_mut(&record.content_hash).ok_or_else(|| {
                        CoreError::corrupt(format!("live record {} has no block", record.coordinate))
                    })?;
                    block.live_owners += 1;
                }
                state.next_sequence = state.next_sequence.max(record.sequence + 1);
                state.records.insert(record.coordinate.key(), record);
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(s: &str) -> Coordinate {
        Coordinate::parse(s).unwrap()
    }

    fn lyric(verse: &str) -> Vec<u8> {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("line {i}: the melody rises over the harbour lights\n"));
        }
        text.push_str(verse);
        text.into_bytes()
    }

    #[test]
    fn test_put_get_full_block() {
        let store = SemanticBlockStore::new(TenantId::new());
        let c = coord("Music.Vocal.Pitch.Draft");
        let block = store.put(&c, b"a4 440hz").unwrap();
        assert_eq!(block.kind, BlockKind::Full);
        assert_eq!(store.get(&c).unwrap(), b"a4 440hz");
    }

    #[test]
    fn test_similar_payload_under_shared_prefix_is_delta() {
        let store = SemanticBlockStore::new(TenantId::new());
        let first = coord("Music.Lyric.Rhyme.Draft.verse1");
        let second = coord("Music.Lyric.Rhyme.Draft.verse2");
        let base = store.put(&first, &lyric("coda one")).unwrap();

        let block = store.put(&second, &lyric("coda two, slightly longer")).unwrap();
        assert_eq!(block.kind, BlockKind::Delta { base: base.content_hash });
        assert!(block.stored_len < block.raw_len / 2);
        assert_eq!(store.get(&second).unwrap(), lyric("coda two, slightly longer"));
    }

    #[test]
    fn test_longest_prefix_wins_then_most_recent() {
        let store = SemanticBlockStore::new(TenantId::new());
        store.put(&coord("Music.Lyric.Rhyme.Draft.a"), &lyric("a")).unwrap();
        store.put(&coord("Music.Lyric.Meter.Draft.b"), &lyric("b")).unwrap();
        store.put(&coord("Music.Lyric.Theme.Draft.x"), &lyric("x")).unwrap();
        let nearer_new = store.put(&coord("Music.Lyric.Theme.Draft.y"), &lyric("y")).unwrap();
        assert!(nearer_new.is_delta());

        // Flatten so every candidate is a depth-0 base.
        for c in ["Music.Lyric.Meter.Draft.b", "Music.Lyric.Theme.Draft.x", "Music.Lyric.Theme.Draft.y"] {
            store.flatten(&coord(c)).unwrap();
        }
        let block = store.put(&coord("Music.Lyric.Theme.Draft.z"), &lyric("z")).unwrap();
        assert_eq!(block.kind, BlockKind::Delta { base: nearer_new.content_hash });
    }

    #[test]
    fn test_unrelated_sizes_are_not_delta_bases() {
        let store = SemanticBlockStore::new(TenantId::new());
        store.put(&coord("Video.Edit.Cut.Draft.a"), &vec![7u8; 10_000]).unwrap();
        let block = store.put(&coord("Video.Edit.Cut.Draft.b"), &[7u8; 100]).unwrap();
        assert_eq!(block.kind, BlockKind::Full);
    }

    #[test]
    fn test_chain_depth_forces_full_copy() {
        let store = SemanticBlockStore::new(TenantId::new());
        store.put(&coord("Text.Script.Tone.Draft.a"), &lyric("a")).unwrap();
        let second = store.put(&coord("Text.Script.Tone.Draft.b"), &lyric("b")).unwrap();
        assert!(second.is_delta());

        // The newest, longest-prefix base is now a delta at max depth 1.
        let third = store.put(&coord("Text.Script.Tone.Draft.b2"), &lyric("b2")).unwrap();
        assert_eq!(third.kind, BlockKind::Full);
    }

    #[test]
    fn test_identical_payloads_share_a_block() {
        let store = SemanticBlockStore::new(TenantId::new());
        let a = store.put(&coord("Image.Photo.Palette.Draft.a"), b"same").unwrap();
        let b = store.put(&coord("Image.Photo.Palette.Draft.b"), b"same").unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(store.stats().full_blocks, 1);

        store.delete(&coord("Image.Photo.Palette.Draft.a")).unwrap();
        assert_eq!(store.compact().purged_blocks, 0);
        assert_eq!(store.get(&coord("Image.Photo.Palette.Draft.b")).unwrap(), b"same");
    }

    #[test]
    fn test_put_rejects_invalid_coordinate() {
        let store = SemanticBlockStore::new(TenantId::new());
        let err = store.put(&coord("Image.Vocal.Pitch.Draft"), b"x").unwrap_err();
        match err {
            CoreError::ValidationRejected { result, .. } => {
                assert!(result.has_violation("MK.02"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_then_reput_bumps_version() {
        let store = SemanticBlockStore::new(TenantId::new());
        let c = coord("Voice.Narration.Tone.Draft");
        store.put(&c, b"v1").unwrap();
        let tombstone = store.delete(&c).unwrap();
        assert!(!tombstone.is_live());
        assert!(matches!(store.get(&c), Err(CoreError::Tombstoned(_))));
        assert!(matches!(store.delete(&c), Err(CoreError::Tombstoned(_))));

        store.put(&c, b"v2").unwrap();
        assert_eq!(store.record(&c).unwrap().version, 2);
        assert_eq!(store.get(&c).unwrap(), b"v2");
    }

    #[test]
    fn test_missing_coordinate() {
        let store = SemanticBlockStore::new(TenantId::new());
        let c = coord("Voice.Narration.Tone.Draft");
        assert!(matches!(store.get(&c), Err(CoreError::NotFound(_))));
        assert!(matches!(store.delete(&c), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_compaction_waits_for_dependents() {
        let store = SemanticBlockStore::new(TenantId::new());
        let base = coord("Music.Lyric.Rhyme.Draft.verse1");
        let derived = coord("Music.Lyric.Rhyme.Draft.verse2");
        store.put(&base, &lyric("one")).unwrap();
        assert!(store.put(&derived, &lyric("two")).unwrap().is_delta());

        store.delete(&base).unwrap();
        assert_eq!(store.compact().purged_blocks, 0);
        assert_eq!(store.get(&derived).unwrap(), lyric("two"));

        store.delete(&derived).unwrap();
        let report = store.compact();
        assert_eq!(report.purged_blocks, 2);
        assert_eq!(store.stats().full_blocks + store.stats().delta_blocks, 0);
        assert_eq!(store.stats().tombstones, 2);
    }

    #[test]
    fn test_compaction_is_interruptible() {
        let store = SemanticBlockStore::new(TenantId::new());
        for i in 0..3 {
            let c = coord(&format!("Image.Design.Layout.Draft.p{i}"));
            store.put(&c, format!("payload {i}").as_bytes()).unwrap();
            store.delete(&c).unwrap();
        }
        let mut polls = 0;
        let report = store.compact_until(|| {
            polls += 1;
            polls > 1
        });
        assert!(report.interrupted);
        assert_eq!(report.purged_blocks, 1);
        assert_eq!(store.compact().purged_blocks, 2);
    }

    #[test]
    fn test_flatten_detaches_from_base() {
        let store = SemanticBlockStore::new(TenantId::new());
        let base = coord("Music.Lyric.Rhyme.Draft.verse1");
        let derived = coord("Music.Lyric.Rhyme.Draft.verse2");
        store.put(&base, &lyric("one")).unwrap();
        store.put(&derived, &lyric("two")).unwrap();

        let flat = store.flatten(&derived).unwrap();
        assert_eq!(flat.kind, BlockKind::Full);
        store.delete(&base).unwrap();
        assert_eq!(store.compact().purged_blocks, 1);
        assert_eq!(store.get(&derived).unwrap(), lyric("two"));
    }

    #[test]
    fn test_scan_by_prefix() {
        let store = SemanticBlockStore::new(TenantId::new());
        for c in [
            "Music.Vocal.Pitch.Draft",
            "Music.Vocal.Tempo.Draft.intro",
            "Music.Mix.Balance.Draft",
            "Video.Edit.Cut.Draft",
        ] {
            store.put(&coord(c), c.as_bytes()).unwrap();
        }
        store.delete(&coord("Music.Vocal.Pitch.Draft")).unwrap();

        let found = store.scan(&CoordinatePrefix::parse("music.vocal").unwrap());
        assert_eq!(found, vec![coord("Music.Vocal.Tempo.Draft.intro")]);
        assert_eq!(store.scan(&CoordinatePrefix::all()).len(), 3);
    }

    #[test]
    fn test_broken_chain_is_reported() {
        let state = StoreState {
            tenant: TenantId::new(),
            records: BTreeMap::new(),
            blocks: HashMap::new(),
            next_sequence: 0,
        };
        let hash = ContentHash::of(b"gone");
        let err = state.reconstruct(&hash, "Music.Vocal.Pitch.Draft", 1).unwrap_err();
        assert!(matches!(err, CoreError::BrokenDeltaChain { .. }));
    }

    #[test]
    fn test_get_reports_missing_base() {
        let store = SemanticBlockStore::new(TenantId::new());
        let base = store.put(&coord("Music.Lyric.Theme.Draft.a"), &lyric("a")).unwrap();
        let derived = coord("Music.Lyric.Theme.Draft.b");
        assert!(store.put(&derived, &lyric("b")).unwrap().is_delta());

        store.state.write().blocks.remove(&base.content_hash);
        match store.get(&derived) {
            Err(CoreError::BrokenDeltaChain { coordinate, base: missing }) => {
                assert_eq!(coordinate, derived.to_string());
                assert_eq!(missing, base.content_hash.to_string());
            }
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[test]
    fn test_runaway_chain_is_bounded() {
        let a = ContentHash::of(b"a");
        let b = ContentHash::of(b"b");
        // a -> b -> a: a cycle that must not loop forever.
        let err = reconstruct(&a, "Music.Vocal.Pitch.Draft", 4, |h| {
            let base = if *h == a { b.clone() } else { a.clone() };
            Ok(Some((Vec::new(), Some(base))))
        })
        .unwrap_err();
        assert!(matches!(err, CoreError::ChainDepthExceeded { max_depth: 4, .. }));
    }
}
