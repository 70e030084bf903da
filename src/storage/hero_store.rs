//! Hero rotation records: pool cache, rotation history, short-term memory and
//! the transient failure registry.
//!
//! Every record is a JSON envelope stored under a namespaced key and written to
//! both the session area and the durable area. Reads prefer the session area,
//! fall back to the durable one, and heal themselves: malformed or expired
//! entries are dropped and the pruned envelope is written back.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{HeroKind, NormalizedHeroItem, SlotCounts};
use crate::storage::kv_store::{KeyValueStore, NullKvStore, SessionKvStore, StoreError};

const KEY_PREFIX: &str = "spotlight.v1";
const ENVELOPE_VERSION: u32 = 1;
const HISTORY_MAX_ENTRIES: usize = 500;
const MEMORY_MAX_ENTRIES: usize = 200;
const FAILURE_MAX_ENTRIES: usize = 300;
pub const DEFAULT_HISTORY_WINDOW_MS: i64 = 14 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordFamily {
    Pool,
    History,
    Memory,
    Failures,
}

impl RecordFamily {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::History => "history",
            Self::Memory => "memory",
            Self::Failures => "failures",
        }
    }

    fn key(self, kind: HeroKind) -> String {
        format!("{KEY_PREFIX}.{}.{}", self.as_str(), kind.as_str())
    }
}

/// Build statistics carried alongside a cached pool.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMeta {
    pub candidate_count: usize,
    pub selected_count: usize,
    pub normalized_count: usize,
    pub failed_count: usize,
    pub enrichment_enabled: bool,
    pub rate_limited: bool,
    pub aborted: bool,
    pub build_ms: i64,
}

/// Cached pool for one catalog kind.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPool {
    pub kind: HeroKind,
    pub items: Vec<NormalizedHeroItem>,
    pub updated_at: i64,
    pub expires_at: i64,
    pub policy_hash: String,
    pub slot_summary: SlotCounts,
    pub meta: PoolMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    PolicyMismatch,
    Corrupt(String),
    Backend(String),
}

/// Result of a pool cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolLookup {
    Fresh(StoredPool),
    /// Past `expires_at` but inside the grace window the caller allowed.
    Stale(StoredPool),
    Miss(MissReason),
}

pub trait TimedEntry {
    fn id(&self) -> &str;
    fn ts(&self) -> i64;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MemoryEntry {
    pub id: String,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct FailureEntry {
    pub id: String,
    pub ts: i64,
    #[serde(default = "default_hits")]
    pub hits: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_hits() -> u32 {
    1
}

impl TimedEntry for HistoryEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn ts(&self) -> i64 {
        self.ts
    }
}

impl TimedEntry for MemoryEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn ts(&self) -> i64 {
        self.ts
    }
}

impl TimedEntry for FailureEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn ts(&self) -> i64 {
        self.ts
    }
}

/// Ordered entries (most recent first) plus a lookup set of their ids.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEntries<E> {
    pub entries: Vec<E>,
    pub ids: HashSet<String>,
}

impl<E: TimedEntry> TimedEntries<E> {
    fn from_entries(entries: Vec<E>) -> Self {
        let ids = entries.iter().map(|entry| entry.id().to_string()).collect();
        Self { entries, ids }
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type HeroHistory = TimedEntries<HistoryEntry>;
pub type HeroMemory = TimedEntries<MemoryEntry>;
pub type HeroFailures = TimedEntries<FailureEntry>;

#[derive(serde::Serialize)]
struct EnvelopeOut<'a, E> {
    version: u32,
    entries: &'a [E],
}

struct ParsedEnvelope<E> {
    entries: Vec<E>,
    healed: bool,
}

fn parse_envelope<E: DeserializeOwned + TimedEntry>(raw: &str) -> ParsedEnvelope<E> {
    let Ok(envelope) = serde_json::from_str::<Value>(raw) else {
        return ParsedEnvelope {
            entries: Vec::new(),
            healed: true,
        };
    };
    let Some(items) = envelope.get("entries").and_then(Value::as_array) else {
        return ParsedEnvelope {
            entries: Vec::new(),
            healed: true,
        };
    };

    let mut healed = false;
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<E>(item.clone()) {
            Ok(entry) if !entry.id().trim().is_empty() && entry.ts() >= 0 => {
                if seen.insert(entry.id().to_string()) {
                    entries.push(entry);
                } else {
                    healed = true;
                }
            }
            _ => healed = true,
        }
    }
    ParsedEnvelope { entries, healed }
}

fn within_window(ts: i64, now: i64, window_ms: i64) -> bool {
    now.saturating_sub(ts) < window_ms
}

/// Persistence facade over the durable and session areas.
pub struct HeroStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl HeroStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    /// Store without a durable backend; records live for the process only.
    pub fn session_only() -> Self {
        Self::new(Arc::new(NullKvStore), Arc::new(SessionKvStore::new()))
    }

    fn areas(&self) -> [&dyn KeyValueStore; 2] {
        [self.session.as_ref(), self.durable.as_ref()]
    }

    /// Raw values from each area, most preferred first. Fails only when every area fails.
    fn read_candidates(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut values = Vec::new();
        let mut first_error = None;
        let mut failures = 0usize;
        for area in self.areas() {
            match area.get(key) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(error) => {
                    warn!("Store[{}]: read of {} failed: {}", area.area_name(), key, error);
                    failures += 1;
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) if failures == self.areas().len() => Err(error),
            _ => Ok(values),
        }
    }

    fn write_all(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut first_error = None;
        let mut failures = 0usize;
        for area in self.areas() {
            if let Err(error) = area.set(key, value) {
                warn!("Store[{}]: write of {} failed: {}", area.area_name(), key, error);
                failures += 1;
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) if failures == self.areas().len() => Err(error),
            _ => Ok(()),
        }
    }

    fn remove_all(&self, key: &str) -> Result<(), StoreError> {
        let mut first_error = None;
        for area in self.areas() {
            if let Err(error) = area.remove(key) {
                warn!("Store[{}]: removal of {} failed: {}", area.area_name(), key, error);
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn load_entries<E: DeserializeOwned + TimedEntry>(
        &self,
        key: &str,
    ) -> Result<ParsedEnvelope<E>, StoreError> {
        let values = self.read_candidates(key)?;
        let Some(first) = values.first() else {
            return Ok(ParsedEnvelope {
                entries: Vec::new(),
                healed: false,
            });
        };
        let mut parsed = parse_envelope::<E>(first);
        // A session copy that was entirely unreadable defers to the durable copy.
        if parsed.healed && parsed.entries.is_empty() {
            if let Some(second) = values.get(1) {
                parsed = parse_envelope::<E>(second);
                parsed.healed = true;
            }
        }
        Ok(parsed)
    }

    fn save_entries<E: Serialize>(&self, key: &str, entries: &[E]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&EnvelopeOut {
            version: ENVELOPE_VERSION,
            entries,
        })
        .map_err(|error| StoreError::Encode(error.to_string()))?;
        self.write_all(key, &encoded)
    }

    fn read_pruned<E: DeserializeOwned + Serialize + TimedEntry>(
        &self,
        key: &str,
        now: i64,
        window_ms: i64,
    ) -> Result<Vec<E>, StoreError> {
        let parsed = self.load_entries::<E>(key)?;
        let before = parsed.entries.len();
        let entries: Vec<E> = parsed
            .entries
            .into_iter()
            .filter(|entry| within_window(entry.ts(), now, window_ms))
            .collect();
        if parsed.healed || entries.len() != before {
            // The pruned view is still correct if the write-back fails.
            if let Err(error) = self.save_entries(key, &entries) {
                debug!("Store: could not write back pruned {}: {}", key, error);
            }
        }
        Ok(entries)
    }

    /// Pushes `ids` to the front with `ts = now`, keeps unexpired older
    /// entries behind them, and caps the list.
    fn record_recent<E, F>(
        &self,
        key: &str,
        ids: &[String],
        now: i64,
        window_ms: i64,
        max_entries: usize,
        make_entry: F,
    ) -> Result<TimedEntries<E>, StoreError>
    where
        E: DeserializeOwned + Serialize + TimedEntry,
        F: Fn(&str, i64) -> E,
    {
        let existing = self.read_pruned::<E>(key, now, window_ms).unwrap_or_default();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(ids.len() + existing.len());
        for id in ids {
            let trimmed = id.trim();
            if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
                continue;
            }
            entries.push(make_entry(trimmed, now));
        }
        for entry in existing {
            if seen.insert(entry.id().to_string()) {
                entries.push(entry);
            }
        }
        entries.truncate(max_entries);
        self.save_entries(key, &entries)?;
        Ok(TimedEntries::from_entries(entries))
    }

    pub fn get_stored_pool(
        &self,
        kind: HeroKind,
        now: i64,
        policy_hash: &str,
        grace_ms: Option<i64>,
    ) -> PoolLookup {
        let values = match self.read_candidates(&RecordFamily::Pool.key(kind)) {
            Ok(values) => values,
            Err(error) => return PoolLookup::Miss(MissReason::Backend(error.to_string())),
        };
        let mut corrupt = None;
        let mut pool = None;
        for value in values {
            match serde_json::from_str::<StoredPool>(&value) {
                Ok(parsed) if parsed.kind == kind => {
                    pool = Some(parsed);
                    break;
                }
                Ok(_) => {
                    corrupt.get_or_insert_with(|| "pool stored under the wrong kind".to_string());
                }
                Err(error) => {
                    corrupt.get_or_insert_with(|| error.to_string());
                }
            }
        }
        let Some(pool) = pool else {
            return PoolLookup::Miss(match corrupt {
                Some(message) => MissReason::Corrupt(message),
                None => MissReason::Absent,
            });
        };

        if pool.policy_hash != policy_hash {
            return PoolLookup::Miss(MissReason::PolicyMismatch);
        }
        if now < pool.expires_at {
            return PoolLookup::Fresh(pool);
        }
        match grace_ms {
            Some(grace) if now < pool.expires_at.saturating_add(grace.max(0)) => {
                PoolLookup::Stale(pool)
            }
            _ => PoolLookup::Miss(MissReason::Expired),
        }
    }

    pub fn store_pool(&self, kind: HeroKind, pool: &StoredPool) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_string(pool).map_err(|error| StoreError::Encode(error.to_string()))?;
        self.write_all(&RecordFamily::Pool.key(kind), &encoded)
    }

    pub fn invalidate_pool(&self, kind: HeroKind) -> Result<(), StoreError> {
        self.remove_all(&RecordFamily::Pool.key(kind))
    }

    pub fn record_hero_history(
        &self,
        kind: HeroKind,
        ids: &[String],
        now: i64,
        window_ms: i64,
    ) -> Result<HeroHistory, StoreError> {
        self.record_recent(
            &RecordFamily::History.key(kind),
            ids,
            now,
            window_ms,
            HISTORY_MAX_ENTRIES,
            |id, ts| HistoryEntry {
                id: id.to_string(),
                ts,
            },
        )
    }

    pub fn get_hero_history(
        &self,
        kind: HeroKind,
        now: i64,
        window_ms: i64,
    ) -> Result<HeroHistory, StoreError> {
        self.read_pruned(&RecordFamily::History.key(kind), now, window_ms)
            .map(TimedEntries::from_entries)
    }

    pub fn record_hero_memory(
        &self,
        kind: HeroKind,
        ids: &[String],
        now: i64,
        window_ms: i64,
    ) -> Result<HeroMemory, StoreError> {
        self.record_recent(
            &RecordFamily::Memory.key(kind),
            ids,
            now,
            window_ms,
            MEMORY_MAX_ENTRIES,
            |id, ts| MemoryEntry {
                id: id.to_string(),
                ts,
            },
        )
    }

    pub fn get_hero_memory(
        &self,
        kind: HeroKind,
        now: i64,
        window_ms: i64,
    ) -> Result<HeroMemory, StoreError> {
        self.read_pruned(&RecordFamily::Memory.key(kind), now, window_ms)
            .map(TimedEntries::from_entries)
    }

    pub fn clear_hero_memory(&self, kind: HeroKind) -> Result<(), StoreError> {
        self.remove_all(&RecordFamily::Memory.key(kind))
    }

    /// Records one failure. A repeat failure of the same id bumps `hits`.
    pub fn record_hero_failure(
        &self,
        kind: HeroKind,
        id: &str,
        reason: &str,
        now: i64,
        ttl_ms: i64,
    ) -> Result<FailureEntry, StoreError> {
        let key = RecordFamily::Failures.key(kind);
        let existing = self
            .read_pruned::<FailureEntry>(&key, now, ttl_ms)
            .unwrap_or_default();
        let previous_hits = existing
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.hits)
            .unwrap_or(0);
        let recorded = FailureEntry {
            id: id.to_string(),
            ts: now,
            hits: previous_hits.saturating_add(1),
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        };
        let mut entries = Vec::with_capacity(existing.len() + 1);
        entries.push(recorded.clone());
        entries.extend(existing.into_iter().filter(|entry| entry.id != id));
        entries.truncate(FAILURE_MAX_ENTRIES);
        self.save_entries(&key, &entries)?;
        Ok(recorded)
    }

    /// Drops `id` from the failure registry. Returns whether it was present.
    pub fn resolve_hero_failure(&self, kind: HeroKind, id: &str) -> Result<bool, StoreError> {
        let key = RecordFamily::Failures.key(kind);
        let parsed = self.load_entries::<FailureEntry>(&key)?;
        let before = parsed.entries.len();
        let entries: Vec<FailureEntry> = parsed
            .entries
            .into_iter()
            .filter(|entry| entry.id != id)
            .collect();
        let removed = entries.len() != before;
        if removed || parsed.healed {
            self.save_entries(&key, &entries)?;
        }
        Ok(removed)
    }

    pub fn get_hero_failures(
        &self,
        kind: HeroKind,
        now: i64,
        ttl_ms: i64,
    ) -> Result<HeroFailures, StoreError> {
        self.read_pruned(&RecordFamily::Failures.key(kind), now, ttl_ms)
            .map(TimedEntries::from_entries)
    }

    pub fn clear_hero_failures(&self, kind: HeroKind) -> Result<(), StoreError> {
        self.remove_all(&RecordFamily::Failures.key(kind))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::{HeroStore, MissReason, PoolLookup, PoolMeta, StoredPool};
    use crate::db_manager::DbManager;
    use crate::protocol::{CallToAction, CtaTarget, HeroKind, NormalizedHeroItem, SlotName};
    use crate::storage::kv_store::{KeyValueStore, SessionKvStore, StoreError};

    const HOUR_MS: i64 = 60 * 60 * 1000;

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("disk unavailable".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk unavailable".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk unavailable".to_string()))
        }
        fn area_name(&self) -> &'static str {
            "failing"
        }
    }

    fn test_store() -> (HeroStore, Arc<DbManager>, Arc<SessionKvStore>) {
        let durable = Arc::new(DbManager::new_in_memory().expect("failed to create in-memory db"));
        let session = Arc::new(SessionKvStore::new());
        (
            HeroStore::new(durable.clone(), session.clone()),
            durable,
            session,
        )
    }

    fn sample_item(id: &str) -> NormalizedHeroItem {
        NormalizedHeroItem {
            id: id.to_string(),
            kind: HeroKind::Movies,
            slot: SlotName::New,
            title: format!("Title {id}"),
            tagline: None,
            overview: Some("Overview".to_string()),
            year: Some(1999),
            runtime_minutes: Some(120),
            rating: Some(7.5),
            vote_count: Some(1000),
            genres: vec!["drama".to_string()],
            certification: None,
            backdrops: Vec::new(),
            season_count: None,
            episode_count: None,
            cta: CallToAction {
                target: CtaTarget::Library,
                id: id.to_string(),
            },
            enrichment: None,
        }
    }

    fn sample_pool(now: i64, policy_hash: &str) -> StoredPool {
        let mut slot_summary = BTreeMap::new();
        slot_summary.insert(SlotName::New, 2);
        StoredPool {
            kind: HeroKind::Movies,
            items: vec![sample_item("1"), sample_item("2")],
            updated_at: now,
            expires_at: now + HOUR_MS,
            policy_hash: policy_hash.to_string(),
            slot_summary,
            meta: PoolMeta::default(),
        }
    }

    #[test]
    fn test_get_stored_pool_returns_stored_payload_before_expiry() {
        let (store, _, _) = test_store();
        let pool = sample_pool(1_000, "abc");
        store.store_pool(HeroKind::Movies, &pool).expect("store pool");

        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, 2_000, "abc", None),
            PoolLookup::Fresh(pool)
        );
    }

    #[test]
    fn test_get_stored_pool_grace_window_and_expiry() {
        let (store, _, _) = test_store();
        let pool = sample_pool(0, "abc");
        store.store_pool(HeroKind::Movies, &pool).expect("store pool");
        let grace = 10 * 60 * 1000;

        assert!(matches!(
            store.get_stored_pool(HeroKind::Movies, HOUR_MS, "abc", Some(grace)),
            PoolLookup::Stale(_)
        ));
        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, HOUR_MS, "abc", None),
            PoolLookup::Miss(MissReason::Expired)
        );
        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, HOUR_MS + grace, "abc", Some(grace)),
            PoolLookup::Miss(MissReason::Expired)
        );
    }

    #[test]
    fn test_get_stored_pool_rejects_other_policy_and_missing_data() {
        let (store, _, _) = test_store();
        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, 0, "abc", None),
            PoolLookup::Miss(MissReason::Absent)
        );
        store
            .store_pool(HeroKind::Movies, &sample_pool(0, "abc"))
            .expect("store pool");
        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, 1, "other", None),
            PoolLookup::Miss(MissReason::PolicyMismatch)
        );
        assert_eq!(
            store.get_stored_pool(HeroKind::Shows, 1, "abc", None),
            PoolLookup::Miss(MissReason::Absent)
        );
    }

    #[test]
    fn test_corrupt_session_pool_falls_back_to_durable_copy() {
        let (store, _, session) = test_store();
        let pool = sample_pool(0, "abc");
        store.store_pool(HeroKind::Movies, &pool).expect("store pool");
        session
            .set("spotlight.v1.pool.movies", "{not json")
            .expect("overwrite session copy");

        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, 1, "abc", None),
            PoolLookup::Fresh(pool)
        );
    }

    #[test]
    fn test_corrupt_pool_everywhere_is_a_corrupt_miss() {
        let (store, durable, session) = test_store();
        session.set("spotlight.v1.pool.movies", "[]").expect("set");
        durable.set("spotlight.v1.pool.movies", "[]").expect("set");
        assert!(matches!(
            store.get_stored_pool(HeroKind::Movies, 1, "abc", None),
            PoolLookup::Miss(MissReason::Corrupt(_))
        ));
    }

    #[test]
    fn test_invalidate_pool_clears_both_areas() {
        let (store, durable, session) = test_store();
        store
            .store_pool(HeroKind::Movies, &sample_pool(0, "abc"))
            .expect("store pool");
        store.invalidate_pool(HeroKind::Movies).expect("invalidate");
        assert_eq!(durable.get("spotlight.v1.pool.movies").expect("get"), None);
        assert_eq!(session.get("spotlight.v1.pool.movies").expect("get"), None);
    }

    #[test]
    fn test_session_only_store_survives_failing_durable_area() {
        let store = HeroStore::new(Arc::new(FailingStore), Arc::new(SessionKvStore::new()));
        let pool = sample_pool(0, "abc");
        store.store_pool(HeroKind::Movies, &pool).expect("session write suffices");
        assert_eq!(
            store.get_stored_pool(HeroKind::Movies, 1, "abc", None),
            PoolLookup::Fresh(pool)
        );
    }

    #[test]
    fn test_all_areas_failing_is_a_backend_miss() {
        let store = HeroStore::new(Arc::new(FailingStore), Arc::new(FailingStore));
        assert!(store
            .store_pool(HeroKind::Movies, &sample_pool(0, "abc"))
            .is_err());
        assert!(matches!(
            store.get_stored_pool(HeroKind::Movies, 1, "abc", None),
            PoolLookup::Miss(MissReason::Backend(_))
        ));
    }

    #[test]
    fn test_history_dedups_orders_and_prunes() {
        let (store, _, _) = test_store();
        let window = 10_000;
        store
            .record_hero_history(HeroKind::Movies, &["a".into(), "b".into()], 1_000, window)
            .expect("record");
        let history = store
            .record_hero_history(HeroKind::Movies, &["c".into(), "a".into(), "c".into()], 5_000, window)
            .expect("record");
        let ids: Vec<&str> = history.entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(history.contains("b"));

        let later = store
            .get_hero_history(HeroKind::Movies, 11_500, window)
            .expect("read");
        let ids: Vec<&str> = later.entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_memory_prefers_new_ids_and_clears() {
        let (store, _, _) = test_store();
        store
            .record_hero_memory(HeroKind::Shows, &["x".into(), "y".into()], 100, 1_000)
            .expect("record");
        let memory = store
            .record_hero_memory(HeroKind::Shows, &["y".into(), "z".into()], 200, 1_000)
            .expect("record");
        assert_eq!(memory.entries[0].id, "y");
        assert_eq!(memory.entries[0].ts, 200);
        assert_eq!(memory.entries[2].id, "x");
        assert_eq!(memory.len(), 3);

        store.clear_hero_memory(HeroKind::Shows).expect("clear");
        assert!(store
            .get_hero_memory(HeroKind::Shows, 300, 1_000)
            .expect("read")
            .is_empty());
    }

    #[test]
    fn test_failure_ttl_window() {
        let (store, _, _) = test_store();
        let ttl = 90_000;
        store
            .record_hero_failure(HeroKind::Movies, "X", "no title", 0, ttl)
            .expect("record");
        assert!(store
            .get_hero_failures(HeroKind::Movies, 60_000, ttl)
            .expect("read")
            .contains("X"));
        assert!(!store
            .get_hero_failures(HeroKind::Movies, 95_000, ttl)
            .expect("read")
            .contains("X"));
    }

    #[test]
    fn test_repeat_failure_increments_hits_and_resolve_removes() {
        let (store, _, _) = test_store();
        let ttl = 60_000;
        store
            .record_hero_failure(HeroKind::Movies, "X", "timeout", 1_000, ttl)
            .expect("record");
        let second = store
            .record_hero_failure(HeroKind::Movies, "X", "timeout", 2_000, ttl)
            .expect("record");
        assert_eq!(second.hits, 2);
        assert_eq!(second.ts, 2_000);

        assert!(store.resolve_hero_failure(HeroKind::Movies, "X").expect("resolve"));
        assert!(!store
            .get_hero_failures(HeroKind::Movies, 3_000, ttl)
            .expect("read")
            .contains("X"));
        assert!(!store.resolve_hero_failure(HeroKind::Movies, "X").expect("resolve"));
    }

    #[test]
    fn test_malformed_entries_are_dropped_and_healed() {
        let (store, durable, session) = test_store();
        let raw = r#"{"version":1,"entries":[{"id":"ok","ts":50},{"id":"","ts":60},{"ts":70},"junk",{"id":"ok","ts":80}]}"#;
        session.set("spotlight.v1.history.movies", raw).expect("set");

        let history = store
            .get_hero_history(HeroKind::Movies, 100, 1_000)
            .expect("read");
        assert_eq!(history.len(), 1);
        assert!(history.contains("ok"));

        let healed = durable
            .get("spotlight.v1.history.movies")
            .expect("get")
            .expect("healed envelope written back");
        assert!(!healed.contains("junk"));
    }

    #[test]
    fn test_unreadable_envelope_reads_as_empty() {
        let (store, _, session) = test_store();
        session
            .set("spotlight.v1.failures.movies", "definitely not json")
            .expect("set");
        assert!(store
            .get_hero_failures(HeroKind::Movies, 10, 1_000)
            .expect("read")
            .is_empty());
    }

    struct ReadOnlyStore(Arc<SessionKvStore>);

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        fn area_name(&self) -> &'static str {
            "read-only"
        }
    }

    #[test]
    fn test_failed_write_back_still_returns_pruned_view() {
        let (writer, _, session) = test_store();
        writer
            .record_hero_history(HeroKind::Movies, &["a".into()], 1_000, 10_000)
            .expect("record");
        writer
            .record_hero_history(HeroKind::Movies, &["b".into()], 9_000, 10_000)
            .expect("record");

        let reader = HeroStore::new(
            Arc::new(ReadOnlyStore(session.clone())),
            Arc::new(ReadOnlyStore(session.clone())),
        );
        let history = reader
            .get_hero_history(HeroKind::Movies, 12_000, 10_000)
            .expect("pruned view despite failing write-back");
        let ids: Vec<&str> = history.entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
        let stored = session
            .get("spotlight.v1.history.movies")
            .expect("get")
            .expect("envelope still present");
        assert!(stored.contains("\"a\""));
    }
}
