//! Builds, caches and serves hero pools.
//!
//! One build runs per kind at a time. A fresh or grace-period cached pool is
//! served without touching the network. Otherwise candidates are planned,
//! then enriched and normalized strictly in selection order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::broadcast::Sender;

use crate::enrichment::{AbortSignal, Credential, EnrichmentClient, EnrichmentError, FetchOptions};
use crate::hero::candidate::prepare_candidates;
use crate::hero::item_normalizer::{normalize_hero_item, NormalizeSettings};
use crate::hero::selection_planner::{plan, selection_rng, Exclusions};
use crate::policy::{plan_slots, Policy};
use crate::protocol::{
    CatalogItem, HeroKind, HeroMessage, NormalizedHeroItem, ProgressEvent, ProgressStage,
    RotationNotification, SlotCounts, SlotName,
};
use crate::storage::hero_store::{HeroStore, PoolLookup, PoolMeta, StoredPool};

/// How the returned pool was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSource {
    Built,
    Cache,
    /// Expired, but served inside the grace window.
    Grace,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeroPool {
    pub kind: HeroKind,
    pub items: Vec<NormalizedHeroItem>,
    pub slot_summary: SlotCounts,
    pub updated_at: i64,
    pub expires_at: i64,
    pub policy_hash: String,
    pub meta: PoolMeta,
    pub source: PoolSource,
}

impl HeroPool {
    fn from_stored(stored: StoredPool, source: PoolSource) -> Self {
        Self {
            kind: stored.kind,
            items: stored.items,
            slot_summary: stored.slot_summary,
            updated_at: stored.updated_at,
            expires_at: stored.expires_at,
            policy_hash: stored.policy_hash,
            meta: stored.meta,
            source,
        }
    }

    fn to_stored(&self) -> StoredPool {
        StoredPool {
            kind: self.kind,
            items: self.items.clone(),
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            policy_hash: self.policy_hash.clone(),
            slot_summary: self.slot_summary.clone(),
            meta: self.meta.clone(),
        }
    }

    /// Item featured at `now`.
    pub fn current_item(&self, now: i64, rotation_interval_ms: i64) -> Option<&NormalizedHeroItem> {
        current_hero(self, now, rotation_interval_ms).and_then(|index| self.items.get(index))
    }
}

/// Index of the featured item: `(now / interval) % len`.
pub fn current_hero(pool: &HeroPool, now: i64, rotation_interval_ms: i64) -> Option<usize> {
    if pool.items.is_empty() {
        return None;
    }
    if rotation_interval_ms <= 0 {
        return Some(0);
    }
    let step = now.max(0) / rotation_interval_ms;
    Some((step as u64 % pool.items.len() as u64) as usize)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("no usable catalog items for {0}")]
    NoCandidates(HeroKind),
    #[error("build for {0} was aborted before any item was ready")]
    Aborted(HeroKind),
    /// Every pick failed; the previously cached pool is left in place.
    #[error("no item for {0} could be normalized")]
    NoUsableItems(HeroKind),
    #[error("build lock for {0} is poisoned")]
    Poisoned(HeroKind),
}

/// One pool request.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub kind: HeroKind,
    pub items: Arc<Vec<CatalogItem>>,
    /// Skips the cached pool.
    pub force: bool,
    pub abort: AbortSignal,
    /// Keep going after an abort, normalizing the remaining picks from raw data.
    pub continue_after_abort: bool,
    pub credential: Option<Credential>,
    pub seed: Option<u64>,
    pub now_ms: i64,
}

impl PoolRequest {
    pub fn new(kind: HeroKind, items: Arc<Vec<CatalogItem>>) -> Self {
        Self {
            kind,
            items,
            force: false,
            abort: AbortSignal::new(),
            continue_after_abort: false,
            credential: None,
            seed: None,
            now_ms: crate::now_unix_ms(),
        }
    }
}

pub struct PoolBuilder {
    store: Arc<HeroStore>,
    client: Arc<EnrichmentClient>,
    settings: NormalizeSettings,
    build_locks: HashMap<HeroKind, Mutex<()>>,
    progress: Option<Sender<HeroMessage>>,
}

impl PoolBuilder {
    pub fn new(
        store: Arc<HeroStore>,
        client: Arc<EnrichmentClient>,
        settings: NormalizeSettings,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            build_locks: HeroKind::ALL
                .iter()
                .map(|kind| (*kind, Mutex::new(())))
                .collect(),
            progress: None,
        }
    }

    /// Publishes progress events on `bus`.
    pub fn with_progress(mut self, bus: Sender<HeroMessage>) -> Self {
        self.progress = Some(bus);
        self
    }

    pub fn store(&self) -> &HeroStore {
        &self.store
    }

    pub fn client(&self) -> &EnrichmentClient {
        &self.client
    }

    fn emit(
        &self,
        stage: ProgressStage,
        kind: HeroKind,
        index: usize,
        total: usize,
        pick: Option<(SlotName, &str)>,
    ) {
        let Some(bus) = &self.progress else {
            return;
        };
        let event = ProgressEvent {
            stage,
            kind,
            index,
            total,
            slot: pick.map(|(slot, _)| slot),
            id: pick.map(|(_, id)| id.to_string()),
        };
        let _ = bus.send(HeroMessage::Notification(RotationNotification::Progress(
            event,
        )));
    }

    fn load_exclusions(&self, policy: &Policy, kind: HeroKind, now: i64) -> Exclusions {
        let history = self
            .store
            .get_hero_history(kind, now, policy.history_window_ms)
            .map(|history| history.ids)
            .unwrap_or_else(|error| {
                warn!("Hero[{}]: rotation history unavailable: {}", kind, error);
                Default::default()
            });
        let memory = self
            .store
            .get_hero_memory(kind, now, policy.memory_window_ms())
            .map(|memory| memory.ids)
            .unwrap_or_else(|error| {
                warn!("Hero[{}]: hero memory unavailable: {}", kind, error);
                Default::default()
            });
        let failures = self
            .store
            .get_hero_failures(kind, now, policy.failure_ttl_ms)
            .map(|failures| failures.ids)
            .unwrap_or_else(|error| {
                warn!("Hero[{}]: failure registry unavailable: {}", kind, error);
                Default::default()
            });
        Exclusions {
            memory,
            history,
            failures,
        }
    }

    fn record_failure(&self, policy: &Policy, kind: HeroKind, id: &str, reason: &str, now: i64) {
        match self
            .store
            .record_hero_failure(kind, id, reason, now, policy.failure_ttl_ms)
        {
            Ok(entry) => debug!(
                "Hero[{}]: recorded failure for {} ({} hits): {}",
                kind, id, entry.hits, reason
            ),
            Err(error) => warn!("Hero[{}]: could not record failure for {}: {}", kind, id, error),
        }
    }

    pub fn build_pool(&self, policy: &Policy, request: &PoolRequest) -> Result<HeroPool, BuildError> {
        let kind = request.kind;
        let now = request.now_ms;
        let started = Instant::now();
        let _build_guard = match self.build_locks.get(&kind) {
            Some(lock) => Some(lock.lock().map_err(|_| BuildError::Poisoned(kind))?),
            None => None,
        };

        let policy_hash = policy.signature(kind);
        self.emit(ProgressStage::Start, kind, 0, 0, None);

        if !request.force {
            match self
                .store
                .get_stored_pool(kind, now, &policy_hash, Some(policy.cache_grace_ms))
            {
                PoolLookup::Fresh(stored) => {
                    debug!("Hero[{}]: serving cached pool", kind);
                    return Ok(self.serve_cached(stored, PoolSource::Cache));
                }
                PoolLookup::Stale(stored) => {
                    info!("Hero[{}]: serving expired pool inside grace window", kind);
                    return Ok(self.serve_cached(stored, PoolSource::Grace));
                }
                PoolLookup::Miss(reason) => {
                    debug!("Hero[{}]: pool cache miss ({:?})", kind, reason);
                }
            }
        }

        let candidates = prepare_candidates(&request.items, now);
        if candidates.is_empty() {
            return Err(self.fail(kind, 0, BuildError::NoCandidates(kind)));
        }
        let exclusions = self.load_exclusions(policy, kind, now);
        let slot_plan = plan_slots(policy.pool_size(kind), &policy.quotas);
        let mut rng = selection_rng(request.seed);
        let selection = plan(
            &candidates,
            &slot_plan,
            &policy.diversity,
            &exclusions,
            &mut rng,
        );

        let mut raw_by_id: HashMap<&str, &CatalogItem> = HashMap::new();
        for item in request.items.iter() {
            raw_by_id.entry(item.rating_key.trim()).or_insert(item);
        }

        let total = selection.selected.len();
        let enrichment_enabled = self.client.is_enabled();
        let mut meta = PoolMeta {
            candidate_count: candidates.len(),
            selected_count: total,
            enrichment_enabled,
            ..PoolMeta::default()
        };
        let options = FetchOptions {
            abort: request.abort.clone(),
            credential: request.credential.clone(),
            bypass_cache: false,
        };
        let mut skip_enrichment = !enrichment_enabled;
        let mut items: Vec<NormalizedHeroItem> = Vec::with_capacity(total);

        for (index, pick) in selection.selected.iter().enumerate() {
            let id = pick.candidate.id.as_str();
            if request.abort.is_aborted() && !meta.aborted {
                meta.aborted = true;
                if !request.continue_after_abort {
                    break;
                }
                skip_enrichment = true;
            }
            self.emit(
                ProgressStage::Normalizing,
                kind,
                index,
                total,
                Some((pick.slot, id)),
            );
            let Some(raw) = raw_by_id.get(id).copied() else {
                continue;
            };

            let fetched = if skip_enrichment {
                Err(EnrichmentError::Disabled("enrichment skipped".to_string()))
            } else {
                self.client
                    .fetch_details_for_item(raw, kind.media_type(), &policy.language, &options)
            };

            let normalized = match fetched {
                Ok(fetch) => normalize_hero_item(
                    raw,
                    kind,
                    pick.slot,
                    Some(&fetch),
                    &policy.text_limits,
                    &self.settings,
                ),
                Err(EnrichmentError::Aborted) => {
                    meta.aborted = true;
                    info!("Hero[{}]: enrichment aborted at {}", kind, id);
                    if !request.continue_after_abort {
                        break;
                    }
                    skip_enrichment = true;
                    continue;
                }
                Err(error) if error.is_item_neutral() => {
                    if let EnrichmentError::RateLimited { retry_after_ms } = error {
                        meta.rate_limited = true;
                        debug!(
                            "Hero[{}]: rate limited for {} ms, using catalog data for {}",
                            kind, retry_after_ms, id
                        );
                    }
                    normalize_hero_item(
                        raw,
                        kind,
                        pick.slot,
                        None,
                        &policy.text_limits,
                        &self.settings,
                    )
                }
                Err(error) => {
                    meta.failed_count += 1;
                    self.record_failure(policy, kind, id, &error.to_string(), now);
                    continue;
                }
            };

            match normalized {
                Some(item) => {
                    if let Err(error) = self.store.resolve_hero_failure(kind, id) {
                        warn!("Hero[{}]: could not resolve failure for {}: {}", kind, id, error);
                    }
                    items.push(item);
                }
                None => {
                    meta.failed_count += 1;
                    self.record_failure(policy, kind, id, "no displayable title", now);
                }
            }
        }

        if items.is_empty() {
            let error = if meta.aborted {
                BuildError::Aborted(kind)
            } else {
                warn!(
                    "Hero[{}]: all {} picks failed, keeping the cached pool",
                    kind, total
                );
                BuildError::NoUsableItems(kind)
            };
            return Err(self.fail(kind, total, error));
        }

        meta.normalized_count = items.len();
        meta.build_ms = started.elapsed().as_millis().min(i64::MAX as u128) as i64;
        let mut slot_summary: SlotCounts = SlotName::PRIORITY.iter().map(|slot| (*slot, 0)).collect();
        for item in &items {
            *slot_summary.entry(item.slot).or_insert(0) += 1;
        }
        let pool = HeroPool {
            kind,
            items,
            slot_summary,
            updated_at: now,
            expires_at: now.saturating_add(policy.cache_ttl_ms),
            policy_hash,
            meta,
            source: PoolSource::Built,
        };

        if pool.meta.aborted {
            info!(
                "Hero[{}]: aborted build kept {} items, not caching",
                kind,
                pool.items.len()
            );
        } else {
            self.persist(policy, &pool, now);
        }

        info!(
            "Hero[{}]: built pool with {}/{} items in {} ms",
            kind,
            pool.items.len(),
            total,
            pool.meta.build_ms
        );
        self.emit(ProgressStage::Done, kind, pool.items.len(), total, None);
        Ok(pool)
    }

    /// Closes the progress stream opened by `Start` for a build that produced nothing.
    fn fail(&self, kind: HeroKind, total: usize, error: BuildError) -> BuildError {
        self.emit(ProgressStage::Done, kind, 0, total, None);
        error
    }

    fn serve_cached(&self, stored: StoredPool, source: PoolSource) -> HeroPool {
        let pool = HeroPool::from_stored(stored, source);
        let count = pool.items.len();
        self.emit(ProgressStage::Cache, pool.kind, count, count, None);
        self.emit(ProgressStage::Done, pool.kind, count, count, None);
        pool
    }

    fn persist(&self, policy: &Policy, pool: &HeroPool, now: i64) {
        let kind = pool.kind;
        if let Err(error) = self.store.store_pool(kind, &pool.to_stored()) {
            warn!("Hero[{}]: could not store pool: {}", kind, error);
        }
        let ids: Vec<String> = pool.items.iter().map(|item| item.id.clone()).collect();
        if let Err(error) = self
            .store
            .record_hero_history(kind, &ids, now, policy.history_window_ms)
        {
            warn!("Hero[{}]: could not record rotation history: {}", kind, error);
        }
        if let Err(error) = self
            .store
            .record_hero_memory(kind, &ids, now, policy.memory_window_ms())
        {
            warn!("Hero[{}]: could not record hero memory: {}", kind, error);
        }
    }

    fn cached_pool(&self, policy: &Policy, kind: HeroKind, now: i64) -> Option<HeroPool> {
        match self.store.get_stored_pool(
            kind,
            now,
            &policy.signature(kind),
            Some(policy.cache_grace_ms),
        ) {
            PoolLookup::Fresh(stored) => Some(HeroPool::from_stored(stored, PoolSource::Cache)),
            PoolLookup::Stale(stored) => Some(HeroPool::from_stored(stored, PoolSource::Grace)),
            PoolLookup::Miss(_) => None,
        }
    }

    /// The kind's cached pool when it is big enough to show, otherwise the
    /// fallback kind's cached pool, otherwise whatever the kind has.
    pub fn resolve_display_pool(&self, policy: &Policy, kind: HeroKind, now: i64) -> Option<HeroPool> {
        let own = self
            .cached_pool(policy, kind, now)
            .filter(|pool| !pool.items.is_empty());
        if own
            .as_ref()
            .is_some_and(|pool| pool.items.len() >= policy.min_pool_size)
        {
            return own;
        }
        let fallback = policy
            .fallback_kind
            .filter(|fallback| *fallback != kind)
            .and_then(|fallback| self.cached_pool(policy, fallback, now))
            .filter(|pool| !pool.items.is_empty());
        if let Some(fallback) = fallback {
            debug!(
                "Hero[{}]: showing {} pool instead of undersized pool",
                kind, fallback.kind
            );
            return Some(fallback);
        }
        own
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::broadcast;

    use super::{current_hero, BuildError, PoolBuilder, PoolRequest, PoolSource};
    use crate::config::EnrichmentConfig;
    use crate::enrichment::testing::{json_response, ScriptedTransport};
    use crate::enrichment::transport::{HttpResponse, TransportError};
    use crate::enrichment::{EnrichmentClient, NoTokenStore};
    use crate::hero::item_normalizer::NormalizeSettings;
    use crate::policy::{DiversityWeights, Policy, SlotQuotas};
    use crate::protocol::{
        CatalogItem, CtaTarget, GenreTag, HeroKind, HeroMessage, ProgressStage,
        RotationNotification,
    };
    use crate::storage::hero_store::HeroStore;

    const NOW: i64 = 1_717_200_000_000;

    fn policy(pool_size: usize) -> Policy {
        let mut policy = Policy::default();
        policy.movies_pool_size = pool_size;
        policy.shows_pool_size = pool_size;
        policy.quotas = SlotQuotas {
            new: 1.0,
            top_rated: 0.0,
            old_but_gold: 0.0,
            random: 0.0,
        };
        policy.diversity = DiversityWeights {
            genre: 0.0,
            year: 0.0,
        };
        policy
    }

    /// Ids 1..=count, most recently added first when ordered by id desc.
    fn catalog(count: u64) -> Arc<Vec<CatalogItem>> {
        Arc::new(
            (1..=count)
                .map(|id| CatalogItem {
                    rating_key: id.to_string(),
                    title: Some(format!("Library {id}")),
                    added_at: Some(NOW - 1_000_000 + id as i64),
                    year: Some(2000),
                    tmdb_id: Some(id),
                    genres: vec![GenreTag::Name("Drama".to_string())],
                    ..CatalogItem::default()
                })
                .collect(),
        )
    }

    fn enrichment_config(with_key: bool) -> EnrichmentConfig {
        EnrichmentConfig {
            api_key: with_key.then(|| "key".to_string()),
            min_request_interval_ms: 0,
            max_attempts: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 1,
            ..EnrichmentConfig::default()
        }
    }

    fn provider_route() -> ScriptedTransport {
        ScriptedTransport::routed(|request| {
            let id = request
                .url
                .split("/movie/")
                .nth(1)
                .and_then(|rest| rest.split('?').next())
                .unwrap_or("0")
                .to_string();
            if id == "3" {
                return Err(TransportError::Network("connection reset".to_string()));
            }
            Ok(json_response(
                200,
                &format!(r#"{{"id": {id}, "title": "Provider {id}"}}"#),
            ))
        })
    }

    fn builder(transport: Arc<ScriptedTransport>, with_key: bool) -> PoolBuilder {
        let client = EnrichmentClient::new(
            &enrichment_config(with_key),
            transport,
            Arc::new(NoTokenStore),
        );
        PoolBuilder::new(
            Arc::new(HeroStore::session_only()),
            Arc::new(client),
            NormalizeSettings {
                region: "US".to_string(),
                image_base_url: "https://img.test".to_string(),
            },
        )
    }

    fn request(kind: HeroKind, items: Arc<Vec<CatalogItem>>, now_ms: i64) -> PoolRequest {
        PoolRequest {
            seed: Some(11),
            now_ms,
            ..PoolRequest::new(kind, items)
        }
    }

    #[test]
    fn test_build_enriches_in_selection_order_and_drops_failures() {
        let transport = Arc::new(provider_route());
        let builder = builder(transport.clone(), true);
        let policy = policy(4);

        let pool = builder
            .build_pool(&policy, &request(HeroKind::Movies, catalog(6), NOW))
            .expect("pool should build");

        let ids: Vec<&str> = pool.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["6", "5", "4"]);
        assert_eq!(pool.items[0].title, "Provider 6");
        assert_eq!(pool.items[0].cta.target, CtaTarget::Provider);
        assert_eq!(pool.source, PoolSource::Built);
        assert_eq!(pool.meta.selected_count, 4);
        assert_eq!(pool.meta.failed_count, 1);

        let failures = builder
            .store()
            .get_hero_failures(HeroKind::Movies, NOW, policy.failure_ttl_ms)
            .expect("failures readable");
        assert!(failures.contains("3"));
        let history = builder
            .store()
            .get_hero_history(HeroKind::Movies, NOW, policy.history_window_ms)
            .expect("history readable");
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_cached_and_grace_pools_make_no_network_calls() {
        let transport = Arc::new(provider_route());
        let builder = builder(transport.clone(), true);
        let policy = policy(2);
        let items = catalog(6);

        let built = builder
            .build_pool(&policy, &request(HeroKind::Movies, items.clone(), NOW))
            .expect("pool should build");
        let calls_after_build = transport.request_count();
        assert!(calls_after_build > 0);

        let cached = builder
            .build_pool(&policy, &request(HeroKind::Movies, items.clone(), NOW + 1))
            .expect("cached pool");
        assert_eq!(cached.source, PoolSource::Cache);
        assert_eq!(cached.items, built.items);

        let in_grace = built.expires_at + policy.cache_grace_ms - 1;
        let stale = builder
            .build_pool(&policy, &request(HeroKind::Movies, items.clone(), in_grace))
            .expect("grace pool");
        assert_eq!(stale.source, PoolSource::Grace);
        assert_eq!(transport.request_count(), calls_after_build);

        let past_grace = built.expires_at + policy.cache_grace_ms;
        let rebuilt = builder
            .build_pool(&policy, &request(HeroKind::Movies, items, past_grace))
            .expect("rebuilt pool");
        assert_eq!(rebuilt.source, PoolSource::Built);
        assert!(transport.request_count() > calls_after_build);
    }

    #[test]
    fn test_policy_change_invalidates_cached_pool() {
        let transport = Arc::new(provider_route());
        let builder = builder(transport.clone(), true);
        let items = catalog(6);
        builder
            .build_pool(&policy(2), &request(HeroKind::Movies, items.clone(), NOW))
            .expect("pool should build");
        let bigger = builder
            .build_pool(&policy(3), &request(HeroKind::Movies, items, NOW + 1))
            .expect("pool should rebuild");
        assert_eq!(bigger.source, PoolSource::Built);
    }

    #[test]
    fn test_missing_credential_normalizes_from_catalog_without_blacklisting() {
        let transport = Arc::new(ScriptedTransport::new());
        let builder = builder(transport.clone(), false);
        let policy = policy(3);

        let pool = builder
            .build_pool(&policy, &request(HeroKind::Shows, catalog(5), NOW))
            .expect("pool should build");
        assert_eq!(pool.items.len(), 3);
        assert_eq!(pool.items[0].title, "Library 5");
        assert!(pool.items.iter().all(|item| item.enrichment.is_none()));
        assert_eq!(transport.request_count(), 0);
        let failures = builder
            .store()
            .get_hero_failures(HeroKind::Shows, NOW, policy.failure_ttl_ms)
            .expect("failures readable");
        assert!(failures.is_empty());
    }

    #[test]
    fn test_abort_mid_build_stops_and_skips_cache() {
        let template = PoolRequest::new(HeroKind::Movies, catalog(6));
        let abort = template.abort.clone();
        let transport = Arc::new(ScriptedTransport::routed(move |request| {
            if request.url.contains("/movie/5") {
                abort.abort();
                return Err(TransportError::Aborted);
            }
            Ok(json_response(200, r#"{"id": 6, "title": "Provider 6"}"#))
        }));
        let builder = builder(transport, true);
        let policy = policy(4);
        let request = PoolRequest {
            seed: Some(1),
            now_ms: NOW,
            ..template
        };

        let pool = builder
            .build_pool(&policy, &request)
            .expect("partial pool should be returned");
        assert_eq!(pool.items.len(), 1);
        assert!(pool.meta.aborted);
        let failures = builder
            .store()
            .get_hero_failures(HeroKind::Movies, NOW, policy.failure_ttl_ms)
            .expect("failures readable");
        assert!(failures.is_empty());
        assert!(builder
            .resolve_display_pool(&policy, HeroKind::Movies, NOW)
            .is_none());
    }

    #[test]
    fn test_abort_before_start_and_empty_catalog_are_errors() {
        let builder = builder(Arc::new(ScriptedTransport::new()), true);
        let policy = policy(2);
        let aborted = request(HeroKind::Movies, catalog(3), NOW);
        aborted.abort.abort();
        assert_eq!(
            builder.build_pool(&policy, &aborted),
            Err(BuildError::Aborted(HeroKind::Movies))
        );
        assert_eq!(
            builder.build_pool(&policy, &request(HeroKind::Movies, Arc::new(Vec::new()), NOW)),
            Err(BuildError::NoCandidates(HeroKind::Movies))
        );
    }

    #[test]
    fn test_failed_rebuild_keeps_last_good_pool() {
        let down = Arc::new(AtomicBool::new(false));
        let outage = down.clone();
        let transport = Arc::new(ScriptedTransport::routed(move |request| {
            if outage.load(Ordering::SeqCst) {
                return Err(TransportError::Network("provider down".to_string()));
            }
            let id = request
                .url
                .split("/movie/")
                .nth(1)
                .and_then(|rest| rest.split('?').next())
                .unwrap_or("0")
                .to_string();
            Ok(json_response(
                200,
                &format!(r#"{{"id": {id}, "title": "Provider {id}"}}"#),
            ))
        }));
        let builder = builder(transport, true);
        let policy = policy(2);
        let items = catalog(4);

        let good = builder
            .build_pool(&policy, &request(HeroKind::Movies, items.clone(), NOW))
            .expect("pool should build");
        assert_eq!(good.items.len(), 2);

        down.store(true, Ordering::SeqCst);
        let forced = PoolRequest {
            force: true,
            ..request(HeroKind::Movies, items, NOW + 1)
        };
        assert_eq!(
            builder.build_pool(&policy, &forced),
            Err(BuildError::NoUsableItems(HeroKind::Movies))
        );

        let failures = builder
            .store()
            .get_hero_failures(HeroKind::Movies, NOW + 1, policy.failure_ttl_ms)
            .expect("failures readable");
        assert_eq!(failures.len(), 2);
        let shown = builder
            .resolve_display_pool(&policy, HeroKind::Movies, NOW + 2)
            .expect("last good pool is still cached");
        assert_eq!(shown.source, PoolSource::Cache);
        assert_eq!(shown.items, good.items);
    }

    #[test]
    fn test_rate_limited_item_is_kept_without_blacklisting() {
        let transport = Arc::new(ScriptedTransport::routed(|_| {
            Ok(HttpResponse {
                retry_after_ms: Some(600_000),
                ..json_response(429, "{}")
            })
        }));
        let config = EnrichmentConfig {
            strike_threshold: 0,
            rate_limit_base_ms: 1_000,
            rate_limit_max_ms: 3_600_000,
            ..enrichment_config(true)
        };
        let client = EnrichmentClient::new(&config, transport.clone(), Arc::new(NoTokenStore));
        let builder = PoolBuilder::new(
            Arc::new(HeroStore::session_only()),
            Arc::new(client),
            NormalizeSettings {
                region: "US".to_string(),
                image_base_url: "https://img.test".to_string(),
            },
        );
        let policy = policy(2);

        let pool = builder
            .build_pool(&policy, &request(HeroKind::Movies, catalog(4), NOW))
            .expect("catalog-only pool should build");
        assert_eq!(pool.items.len(), 2);
        assert_eq!(pool.items[0].title, "Library 4");
        assert!(pool.items.iter().all(|item| item.enrichment.is_none()));
        assert!(pool.meta.rate_limited);
        assert_eq!(pool.meta.failed_count, 0);
        // The second pick fails fast on the open breaker without a request.
        assert_eq!(transport.request_count(), 1);

        let failures = builder
            .store()
            .get_hero_failures(HeroKind::Movies, NOW, policy.failure_ttl_ms)
            .expect("failures readable");
        assert!(failures.is_empty());
    }

    #[test]
    fn test_failed_builds_close_progress_stream() {
        let (bus, mut receiver) = broadcast::channel::<HeroMessage>(64);
        let builder = builder(Arc::new(ScriptedTransport::new()), true).with_progress(bus);
        let policy = policy(2);

        let empty = request(HeroKind::Movies, Arc::new(Vec::new()), NOW);
        assert!(builder.build_pool(&policy, &empty).is_err());
        let aborted = request(HeroKind::Shows, catalog(3), NOW);
        aborted.abort.abort();
        assert!(builder.build_pool(&policy, &aborted).is_err());

        let mut stages = Vec::new();
        while let Ok(HeroMessage::Notification(RotationNotification::Progress(event))) =
            receiver.try_recv()
        {
            stages.push((event.kind, event.stage));
        }
        assert_eq!(
            stages,
            vec![
                (HeroKind::Movies, ProgressStage::Start),
                (HeroKind::Movies, ProgressStage::Done),
                (HeroKind::Shows, ProgressStage::Start),
                (HeroKind::Shows, ProgressStage::Done),
            ]
        );
    }

    #[test]
    fn test_progress_events_bracket_the_build() {
        let (bus, mut receiver) = broadcast::channel::<HeroMessage>(64);
        let builder = builder(Arc::new(ScriptedTransport::new()), false).with_progress(bus);
        builder
            .build_pool(&policy(2), &request(HeroKind::Movies, catalog(4), NOW))
            .expect("pool should build");

        let mut stages = Vec::new();
        while let Ok(HeroMessage::Notification(RotationNotification::Progress(event))) =
            receiver.try_recv()
        {
            stages.push((event.stage, event.id));
        }
        assert_eq!(stages.first().map(|stage| stage.0), Some(ProgressStage::Start));
        assert_eq!(stages.last().map(|stage| stage.0), Some(ProgressStage::Done));
        let normalizing: Vec<Option<String>> = stages
            .into_iter()
            .filter(|(stage, _)| *stage == ProgressStage::Normalizing)
            .map(|(_, id)| id)
            .collect();
        assert_eq!(normalizing, vec![Some("4".to_string()), Some("3".to_string())]);
    }

    #[test]
    fn test_current_hero_rotates_with_interval() {
        let builder = builder(Arc::new(ScriptedTransport::new()), false);
        let pool = builder
            .build_pool(&policy(3), &request(HeroKind::Movies, catalog(3), NOW))
            .expect("pool should build");
        assert_eq!(current_hero(&pool, 0, 1_000), Some(0));
        assert_eq!(current_hero(&pool, 1_999, 1_000), Some(1));
        assert_eq!(current_hero(&pool, 5_000, 1_000), Some(2));
        assert_eq!(current_hero(&pool, 5_000, 0), Some(0));
        assert_eq!(
            pool.current_item(3_000, 1_000).map(|item| item.id.as_str()),
            Some("3")
        );
    }

    #[test]
    fn test_display_pool_falls_back_when_too_small() {
        let builder = builder(Arc::new(ScriptedTransport::new()), false);
        let mut policy = policy(4);
        policy.min_pool_size = 3;
        policy.fallback_kind = Some(HeroKind::Movies);
        builder
            .build_pool(&policy, &request(HeroKind::Movies, catalog(5), NOW))
            .expect("movies pool");
        builder
            .build_pool(&policy, &request(HeroKind::Shows, catalog(2), NOW))
            .expect("shows pool");

        let shown = builder
            .resolve_display_pool(&policy, HeroKind::Shows, NOW + 1)
            .expect("fallback pool");
        assert_eq!(shown.kind, HeroKind::Movies);

        policy.fallback_kind = None;
        let own = builder
            .resolve_display_pool(&policy, HeroKind::Shows, NOW + 1)
            .expect("undersized own pool");
        assert_eq!(own.kind, HeroKind::Shows);
        assert_eq!(own.items.len(), 2);
    }
}
