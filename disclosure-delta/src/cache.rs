//! Change-record cache.
//!
//! Maps (entity, quarter_prev, quarter_curr, section) to the validated
//! records of that section. A pair only counts as cached once every
//! required section has an entry; anything less is a miss for the whole
//! pair. Entries never expire; they leave only through `invalidate` or
//! `clear`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use disclosure_common::Result;

use crate::storage::BlobStore;
use crate::types::{CacheKey, ChangeRecord, PairContext, Section};

const SNAPSHOT_VERSION: u32 = 1;

/// Narrative cached for a pair, tied to the records it was written for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedSummary {
    fingerprint: String,
    summary: String,
}

/// Persisted form of the cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Vec<ChangeRecord>>,
    #[serde(default)]
    summaries: BTreeMap<String, CachedSummary>,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pairs: usize,
    pub complete_pairs: usize,
    pub records: usize,
    pub summaries: usize,
}

/// Change-record cache backed by a [`BlobStore`] key.
pub struct ChangeCache {
    store: Arc<dyn BlobStore>,
    key: String,
    required: Vec<Section>,
    entries: RwLock<BTreeMap<CacheKey, Vec<ChangeRecord>>>,
    summaries: RwLock<BTreeMap<PairContext, CachedSummary>>,
}

impl ChangeCache {
    /// Create an empty cache. `required` lists the sections a pair needs
    /// before it counts as cached.
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<String>, required: Vec<Section>) -> Self {
        Self {
            store,
            key: key.into(),
            required,
            entries: RwLock::new(BTreeMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn required_sections(&self) -> &[Section] {
        &self.required
    }

    // ========================================================================
    // Durable round-trip
    // ========================================================================

    /// Replace the in-memory contents with the persisted snapshot.
    ///
    /// Missing, corrupt or foreign-version data loads as an empty cache.
    pub async fn load(&self) -> usize {
        let snapshot = match self.store.read(&self.key).await {
            None => {
                debug!(key = %self.key, "No cache snapshot yet");
                Snapshot::default()
            }
            Some(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(s) if s.version == SNAPSHOT_VERSION => s,
                Ok(s) => {
                    warn!(version = s.version, "Unsupported cache snapshot version, starting empty");
                    Snapshot::default()
                }
                Err(e) => {
                    warn!(error = %e, "Corrupt cache snapshot, starting empty");
                    Snapshot::default()
                }
            },
        };

        let mut entries = BTreeMap::new();
        for (raw, records) in snapshot.entries {
            match CacheKey::decode(&raw) {
                Some(key) => {
                    entries.insert(key, records);
                }
                None => warn!(key = %raw, "Skipping undecodable cache key"),
            }
        }

        let summaries: BTreeMap<_, _> = snapshot
            .summaries
            .into_iter()
            .filter_map(|(raw, summary)| PairContext::decode(&raw).map(|pair| (pair, summary)))
            .collect();

        let loaded = entries.len();
        if let Ok(mut cache) = self.entries.write() {
            *cache = entries;
        }
        if let Ok(mut cache) = self.summaries.write() {
            *cache = summaries;
        }

        info!(entries = loaded, store = %self.store.describe(), "Loaded change cache");
        loaded
    }

    /// Write the whole cache to the store, keys in sorted order.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = {
            let entries = self
                .entries
                .read()
                .map(|c| c.iter().map(|(k, v)| (k.encode(), v.clone())).collect())
                .unwrap_or_default();
            let summaries = self
                .summaries
                .read()
                .map(|c| c.iter().map(|(k, v)| (k.encode(), v.clone())).collect())
                .unwrap_or_default();
            Snapshot {
                version: SNAPSHOT_VERSION,
                entries,
                summaries,
            }
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.store.write(&self.key, &bytes).await?;
        debug!(entries = snapshot.entries.len(), "Persisted change cache");
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Records for one section, or `None` unless the whole pair is cached.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<ChangeRecord>> {
        let cache = self.entries.read().ok()?;
        if !self.complete_in(&cache, &key.pair) {
            return None;
        }
        cache.get(key).cloned()
    }

    /// All records of a pair in required-section order, or `None` unless
    /// every required section is cached.
    pub fn get_pair(&self, pair: &PairContext) -> Option<Vec<ChangeRecord>> {
        let cache = self.entries.read().ok()?;
        if !self.complete_in(&cache, pair) {
            return None;
        }

        let mut records = Vec::new();
        for section in &self.required {
            records.extend(cache.get(&pair.key(*section))?.iter().cloned());
        }
        Some(records)
    }

    pub fn is_pair_complete(&self, pair: &PairContext) -> bool {
        self.entries
            .read()
            .map(|c| self.complete_in(&c, pair))
            .unwrap_or(false)
    }

    fn complete_in(&self, cache: &BTreeMap<CacheKey, Vec<ChangeRecord>>, pair: &PairContext) -> bool {
        self.required
            .iter()
            .all(|section| cache.contains_key(&pair.key(*section)))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Store records for one key, replacing any previous entry.
    pub fn put(&self, key: CacheKey, records: Vec<ChangeRecord>) {
        if let Ok(mut cache) = self.entries.write() {
            cache.insert(key, records);
        }
    }

    /// Store every required section of a pair. Records are routed by their
    /// `section`; sections with no records get an empty entry.
    pub fn put_pair(&self, pair: &PairContext, records: &[ChangeRecord]) {
        let mut by_section: BTreeMap<Section, Vec<ChangeRecord>> =
            self.required.iter().map(|s| (*s, Vec::new())).collect();
        for record in records {
            by_section.entry(record.section).or_default().push(record.clone());
        }

        if let Ok(mut cache) = self.entries.write() {
            for (section, records) in by_section {
                cache.insert(pair.key(section), records);
            }
        }
    }

    /// Cached narrative for a pair, if it was written for `fingerprint`.
    pub fn summary_for(&self, pair: &PairContext, fingerprint: &str) -> Option<String> {
        let cache = self.summaries.read().ok()?;
        cache
            .get(pair)
            .filter(|s| s.fingerprint == fingerprint)
            .map(|s| s.summary.clone())
    }

    pub fn store_summary(&self, pair: &PairContext, fingerprint: &str, summary: &str) {
        if let Ok(mut cache) = self.summaries.write() {
            cache.insert(
                pair.clone(),
                CachedSummary {
                    fingerprint: fingerprint.to_string(),
                    summary: summary.to_string(),
                },
            );
        }
    }

    /// Drop every entry and summary of an entity (case-insensitive).
    /// Returns the number of entries removed.
    pub fn invalidate(&self, entity: &str) -> usize {
        let wanted = entity.to_lowercase();
        let mut removed = 0;

        if let Ok(mut cache) = self.entries.write() {
            let before = cache.len();
            cache.retain(|k, _| k.pair.entity.to_lowercase() != wanted);
            removed = before - cache.len();
        }
        if let Ok(mut cache) = self.summaries.write() {
            cache.retain(|k, _| k.entity.to_lowercase() != wanted);
        }

        info!(entity, removed, "Invalidated cached entity");
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.entries.write() {
            cache.clear();
        }
        if let Ok(mut cache) = self.summaries.write() {
            cache.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, pairs, complete_pairs, records) = self
            .entries
            .read()
            .map(|c| {
                let pairs: HashSet<&PairContext> = c.keys().map(|k| &k.pair).collect();
                let complete = pairs.iter().filter(|p| self.complete_in(&c, p)).count();
                let records = c.values().map(Vec::len).sum();
                (c.len(), pairs.len(), complete, records)
            })
            .unwrap_or((0, 0, 0, 0));

        CacheStats {
            entries,
            pairs,
            complete_pairs,
            records,
            summaries: self.summaries.read().map(|c| c.len()).unwrap_or(0),
        }
    }
}

/// Remove duplicates across a whole batch.
///
/// Key: (entity lowercased, quarter_curr, quote_new lowercased). The first
/// occurrence in input order wins. Returns the kept records and the number
/// removed.
pub fn global_dedup(records: Vec<ChangeRecord>) -> (Vec<ChangeRecord>, usize) {
    let mut seen = HashSet::new();
    let before = records.len();

    let kept: Vec<ChangeRecord> = records
        .into_iter()
        .filter(|r| {
            seen.insert((
                r.entity.to_lowercase(),
                r.quarter_curr.clone(),
                r.quote_new.to_lowercase(),
            ))
        })
        .collect();

    let removed = before - kept.len();
    if removed > 0 {
        info!(removed, "Global dedup suppressed duplicate records");
    }
    (kept, removed)
}

/// SHA-256 over the canonical JSON of `records`.
pub fn fingerprint(records: &[ChangeRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        if let Ok(bytes) = serde_json::to_vec(record) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{SignalClassification, ValidationStatus};

    fn record(entity: &str, section: Section, quote_new: &str) -> ChangeRecord {
        ChangeRecord {
            entity: entity.into(),
            section,
            quarter_prev: "Q1_2024".into(),
            quarter_curr: "Q2_2024".into(),
            quote_old: "old wording".into(),
            quote_new: quote_new.into(),
            description: "tone shift".into(),
            signal_classification: SignalClassification::Positive,
            signal_score: 3.0,
            validation_status: Some(ValidationStatus::Verified),
            validation_note: String::new(),
            market_validation: None,
            market_note: String::new(),
        }
    }

    fn pair() -> PairContext {
        PairContext::new("ACME", "Q1_2024", "Q2_2024")
    }

    fn cache() -> (MemoryStore, ChangeCache) {
        let mem = MemoryStore::new();
        let cache = ChangeCache::new(Arc::new(mem.clone()), "cache.json", Section::ALL.to_vec());
        (mem, cache)
    }

    #[test]
    fn test_partial_pair_is_a_miss() {
        let (_, cache) = cache();
        cache.put(pair().key(Section::MdA), vec![record("ACME", Section::MdA, "a")]);
        cache.put(pair().key(Section::RiskFactors), vec![]);

        assert!(cache.get(&pair().key(Section::MdA)).is_none());
        assert!(cache.get_pair(&pair()).is_none());
        assert!(!cache.is_pair_complete(&pair()));

        cache.put(pair().key(Section::Accounting), vec![]);
        assert_eq!(cache.get(&pair().key(Section::MdA)).unwrap().len(), 1);
        assert_eq!(cache.get_pair(&pair()).unwrap().len(), 1);
    }

    #[test]
    fn test_put_overwrites() {
        let (_, cache) = cache();
        cache.put_pair(&pair(), &[record("ACME", Section::MdA, "a")]);
        cache.put(pair().key(Section::MdA), vec![]);
        assert!(cache.get_pair(&pair()).unwrap().is_empty());
    }

    #[test]
    fn test_put_pair_fills_empty_sections() {
        let (_, cache) = cache();
        cache.put_pair(&pair(), &[record("ACME", Section::Accounting, "x")]);
        assert!(cache.is_pair_complete(&pair()));
        assert_eq!(cache.stats().entries, 3);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let (mem, cache) = cache();
        cache.put_pair(&pair(), &[record("ACME", Section::MdA, "a")]);
        cache.store_summary(&pair(), "fp", "ACME improved.");
        cache.persist().await.unwrap();

        let reloaded = ChangeCache::new(Arc::new(mem), "cache.json", Section::ALL.to_vec());
        assert_eq!(reloaded.load().await, 3);
        assert_eq!(reloaded.get_pair(&pair()).unwrap().len(), 1);
        assert_eq!(reloaded.summary_for(&pair(), "fp").as_deref(), Some("ACME improved."));
        assert!(reloaded.summary_for(&pair(), "other").is_none());
    }

    #[tokio::test]
    async fn test_reload_with_pipe_in_quarter_labels() {
        let (mem, cache) = cache();
        let odd = PairContext::new("ACME", "FY24|H1", "FY24|H2");
        cache.put_pair(&odd, &[]);
        cache.store_summary(&odd, "fp", "Half-year view.");
        cache.persist().await.unwrap();

        let reloaded = ChangeCache::new(Arc::new(mem), "cache.json", Section::ALL.to_vec());
        assert_eq!(reloaded.load().await, 3);
        assert!(reloaded.is_pair_complete(&odd));
        assert_eq!(reloaded.summary_for(&odd, "fp").as_deref(), Some("Half-year view."));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_loads_empty() {
        let (mem, cache) = cache();
        mem.write("cache.json", b"\x00\x01 not json").await.unwrap();
        assert_eq!(cache.load().await, 0);
        assert!(cache.get_pair(&pair()).is_none());
    }

    #[tokio::test]
    async fn test_persisted_keys_sorted() {
        let (mem, cache) = cache();
        let later = PairContext::new("ZED", "Q1_2024", "Q2_2024");
        cache.put_pair(&later, &[]);
        cache.put_pair(&pair(), &[]);
        cache.persist().await.unwrap();

        let bytes = mem.read("cache.json").await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let acme = text.find("ACME|").unwrap();
        let zed = text.find("ZED|").unwrap();
        assert!(acme < zed);
    }

    #[test]
    fn test_invalidate_entity() {
        let (_, cache) = cache();
        cache.put_pair(&pair(), &[]);
        cache.put_pair(&PairContext::new("Other", "Q1_2024", "Q2_2024"), &[]);
        cache.store_summary(&pair(), "fp", "s");

        assert_eq!(cache.invalidate("acme"), 3);
        assert!(cache.get_pair(&pair()).is_none());
        assert_eq!(cache.stats().pairs, 1);
        assert_eq!(cache.stats().summaries, 0);
    }

    #[test]
    fn test_global_dedup_first_wins_case_insensitive() {
        let records = vec![
            record("ACME", Section::MdA, "Margins Expanded"),
            record("acme", Section::RiskFactors, "margins expanded"),
            record("ACME", Section::MdA, "Costs fell"),
        ];
        let (kept, removed) = global_dedup(records);
        assert_eq!(removed, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].section, Section::MdA);
        assert_eq!(kept[1].quote_new, "Costs fell");
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = vec![record("ACME", Section::MdA, "a")];
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b[0].signal_score = 4.0;
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }
}
