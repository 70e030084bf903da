//! Blocking client for a TMDB-shaped metadata API.
//!
//! Requests are serialized per client, spaced by a `governor` limiter, held
//! back while the rate-limit breaker is active, and retried with capped
//! exponential backoff on network errors, 5xx and 429.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::sync::broadcast::Receiver;

use crate::config::EnrichmentConfig;
use crate::enrichment::credentials::{Credential, CredentialResolver, TokenStore};
use crate::enrichment::detail::{FindResponse, ProviderDetail, SearchResponse};
use crate::enrichment::rate_limit::{Admission, BreakerSettings, RateLimitBreaker};
use crate::enrichment::response_cache::{CacheKey, ResponseCache};
use crate::enrichment::transport::{
    sleep_unless_aborted, AbortSignal, HttpRequest, HttpTransport, TransportError,
};
use crate::enrichment::EnrichmentError;
use crate::protocol::{CatalogItem, MediaType, RateLimitState};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const THROTTLE_POLL: Duration = Duration::from_millis(10);

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub abort: AbortSignal,
    /// Takes precedence over every configured credential.
    pub credential: Option<Credential>,
    /// Skips the response cache lookup (the result is still cached).
    pub bypass_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailFetch {
    pub detail: ProviderDetail,
    pub from_cache: bool,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct RetrySettings {
    max_attempts: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl RetrySettings {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

pub struct EnrichmentClient {
    enabled: bool,
    base_url: String,
    retry: RetrySettings,
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialResolver,
    limiter: Option<DirectLimiter>,
    request_gate: Mutex<()>,
    breaker: Mutex<RateLimitBreaker>,
    cache: Mutex<ResponseCache>,
}

impl EnrichmentClient {
    pub fn new(
        config: &EnrichmentConfig,
        transport: Arc<dyn HttpTransport>,
        token_store: Arc<dyn TokenStore>,
    ) -> Self {
        let limiter = Quota::with_period(Duration::from_millis(config.min_request_interval_ms))
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        let cache_ttl_ms = config
            .response_cache_ttl_minutes
            .saturating_mul(60_000)
            .min(i64::MAX as u64) as i64;
        Self {
            enabled: config.enabled,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetrySettings {
                max_attempts: config.max_attempts.max(1),
                backoff_base_ms: config.backoff_base_ms,
                backoff_max_ms: config.backoff_max_ms,
            },
            transport,
            credentials: CredentialResolver::new(config, token_store),
            limiter,
            request_gate: Mutex::new(()),
            breaker: Mutex::new(RateLimitBreaker::new(BreakerSettings::from_config(config))),
            cache: Mutex::new(ResponseCache::new(
                cache_ttl_ms,
                config.response_cache_max_entries,
            )),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock_breaker(&self) -> Result<MutexGuard<'_, RateLimitBreaker>, EnrichmentError> {
        self.breaker
            .lock()
            .map_err(|_| EnrichmentError::Network("rate-limit state lock poisoned".to_string()))
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, ResponseCache>, EnrichmentError> {
        self.cache
            .lock()
            .map_err(|_| EnrichmentError::Network("response cache lock poisoned".to_string()))
    }

    pub fn subscribe_rate_limit(&self) -> Option<Receiver<RateLimitState>> {
        self.lock_breaker().ok().map(|breaker| breaker.subscribe())
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        self.lock_breaker()
            .map(|mut breaker| {
                breaker.refresh(crate::now_unix_ms());
                breaker.snapshot()
            })
            .unwrap_or_default()
    }

    /// Empties the response cache. Returns the number of dropped entries.
    pub fn clear_cache(&self) -> usize {
        match self.lock_cache() {
            Ok(mut cache) => cache.clear(),
            Err(error) => {
                warn!("Enrichment: could not clear response cache: {}", error);
                0
            }
        }
    }

    fn request_url(&self, path: &str, params: &[(&str, &str)]) -> String {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        for (index, (key, value)) in params.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(urlencoding::encode(value).as_ref());
        }
        url
    }

    fn wait_for_admission(&self, abort: &AbortSignal) -> Result<(), EnrichmentError> {
        loop {
            if abort.is_aborted() {
                return Err(EnrichmentError::Aborted);
            }
            let now = crate::now_unix_ms();
            let admission = self.lock_breaker()?.admission(now);
            match admission {
                Admission::Proceed => return Ok(()),
                Admission::FailFast { until } => {
                    return Err(EnrichmentError::RateLimited {
                        retry_after_ms: until.saturating_sub(now).max(0),
                    });
                }
                Admission::Wait { delay_ms } => {
                    debug!(
                        "Enrichment: waiting {} ms for provider rate-limit window",
                        delay_ms
                    );
                    let delay = Duration::from_millis(delay_ms.max(1) as u64);
                    if !sleep_unless_aborted(delay, abort) {
                        return Err(EnrichmentError::Aborted);
                    }
                }
            }
        }
    }

    fn wait_for_throttle_slot(&self, abort: &AbortSignal) -> Result<(), EnrichmentError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        while limiter.check().is_err() {
            if !sleep_unless_aborted(THROTTLE_POLL, abort) {
                return Err(EnrichmentError::Aborted);
            }
        }
        Ok(())
    }

    /// One throttled, retried GET. Returns the response body on 2xx.
    fn get_body(
        &self,
        path: &str,
        params: &[(&str, &str)],
        options: &FetchOptions,
    ) -> Result<String, EnrichmentError> {
        if !self.enabled {
            return Err(EnrichmentError::Disabled(
                "enrichment switched off".to_string(),
            ));
        }
        let abort = &options.abort;
        if abort.is_aborted() {
            return Err(EnrichmentError::Aborted);
        }
        let Some((credential, source)) =
            self.credentials
                .resolve(options.credential.as_ref(), self.transport.as_ref(), abort)
        else {
            return Err(EnrichmentError::Disabled(
                "no provider credential configured".to_string(),
            ));
        };

        let _gate = self
            .request_gate
            .lock()
            .map_err(|_| EnrichmentError::Network("request gate lock poisoned".to_string()))?;

        let mut last_error = EnrichmentError::Network("no attempt made".to_string());
        for attempt in 1..=self.retry.max_attempts {
            self.wait_for_admission(abort)?;
            self.wait_for_throttle_slot(abort)?;

            let mut request = HttpRequest {
                url: self.request_url(path, params),
                headers: Vec::new(),
            };
            credential.apply(&mut request.url, &mut request.headers);
            debug!(
                "Enrichment[{}]: attempt {} via {:?} credential",
                path, attempt, source
            );

            let waits_out_window = match self.transport.get(&request, abort) {
                Err(TransportError::Aborted) => return Err(EnrichmentError::Aborted),
                Err(TransportError::Network(message)) => {
                    last_error = EnrichmentError::Network(message);
                    false
                }
                Ok(response) => {
                    let now = crate::now_unix_ms();
                    match response.status {
                        200..=299 => {
                            self.lock_breaker()?.record_status(now, response.status);
                            return Ok(response.body);
                        }
                        429 => {
                            let delay_ms = self.lock_breaker()?.record_rate_limited(
                                now,
                                response.status,
                                response.retry_after_ms,
                            );
                            info!(
                                "Enrichment[{}]: provider rate limit hit, backing off {} ms",
                                path, delay_ms
                            );
                            last_error = EnrichmentError::RateLimited {
                                retry_after_ms: delay_ms,
                            };
                            true
                        }
                        404 => {
                            self.lock_breaker()?.record_status(now, response.status);
                            return Err(EnrichmentError::NotFound);
                        }
                        401 | 403 => {
                            self.lock_breaker()?.record_status(now, response.status);
                            warn!(
                                "Enrichment[{}]: provider rejected {:?} credential (HTTP {})",
                                path, source, response.status
                            );
                            return Err(EnrichmentError::Disabled(format!(
                                "credential rejected with HTTP {}",
                                response.status
                            )));
                        }
                        500..=599 => {
                            self.lock_breaker()?.record_status(now, response.status);
                            last_error = EnrichmentError::Http {
                                status: response.status,
                            };
                            false
                        }
                        status => {
                            self.lock_breaker()?.record_status(now, status);
                            return Err(EnrichmentError::Http { status });
                        }
                    }
                }
            };

            if attempt < self.retry.max_attempts && !waits_out_window {
                let backoff = self.retry.backoff_delay(attempt);
                info!(
                    "Enrichment[{}]: attempt {} failed ({}), retrying in {:?}",
                    path, attempt, last_error, backoff
                );
                if !sleep_unless_aborted(backoff, abort) {
                    return Err(EnrichmentError::Aborted);
                }
            }
        }
        Err(last_error)
    }

    /// Detail record with images, certifications and external ids appended.
    pub fn fetch_details(
        &self,
        media_type: MediaType,
        provider_id: u64,
        language: &str,
        options: &FetchOptions,
    ) -> Result<DetailFetch, EnrichmentError> {
        let key = CacheKey::new(media_type, provider_id, language);
        if !options.bypass_cache {
            if let Some((detail, fetched_at)) = self.lock_cache()?.get(&key, crate::now_unix_ms())
            {
                debug!(
                    "Enrichment[{}/{}]: served from response cache",
                    media_type.as_path(),
                    provider_id
                );
                return Ok(DetailFetch {
                    detail,
                    from_cache: true,
                    fetched_at,
                });
            }
        }

        let appended = match media_type {
            MediaType::Movie => "images,release_dates,external_ids",
            MediaType::Tv => "images,content_ratings,external_ids",
        };
        let image_languages = format!(
            "{},null",
            language.split('-').next().unwrap_or(language)
        );
        let path = format!("{}/{}", media_type.as_path(), provider_id);
        let body = self.get_body(
            &path,
            &[
                ("language", language),
                ("append_to_response", appended),
                ("include_image_language", &image_languages),
            ],
            options,
        )?;
        let detail: ProviderDetail = serde_json::from_str(&body)
            .map_err(|error| EnrichmentError::Parse(error.to_string()))?;
        let fetched_at = crate::now_unix_ms();
        self.lock_cache()?.insert(key, detail.clone(), fetched_at);
        Ok(DetailFetch {
            detail,
            from_cache: false,
            fetched_at,
        })
    }

    fn find_by_external_id(
        &self,
        media_type: MediaType,
        external_id: &str,
        external_source: &str,
        options: &FetchOptions,
    ) -> Result<u64, EnrichmentError> {
        let path = format!("find/{}", urlencoding::encode(external_id));
        let body = self.get_body(&path, &[("external_source", external_source)], options)?;
        let found: FindResponse = serde_json::from_str(&body)
            .map_err(|error| EnrichmentError::Parse(error.to_string()))?;
        let results = match media_type {
            MediaType::Movie => found.movie_results,
            MediaType::Tv => found.tv_results,
        };
        results
            .first()
            .map(|result| result.id)
            .ok_or(EnrichmentError::NotFound)
    }

    fn search_by_title(
        &self,
        media_type: MediaType,
        title: &str,
        year: Option<i32>,
        language: &str,
        options: &FetchOptions,
    ) -> Result<u64, EnrichmentError> {
        let year_text = year.map(|year| year.to_string());
        let mut params = vec![
            ("query", title),
            ("language", language),
            ("include_adult", "false"),
        ];
        if let Some(year_text) = year_text.as_deref() {
            params.push(match media_type {
                MediaType::Movie => ("year", year_text),
                MediaType::Tv => ("first_air_date_year", year_text),
            });
        }
        let body = self.get_body(
            &format!("search/{}", media_type.as_path()),
            &params,
            options,
        )?;
        let found: SearchResponse = serde_json::from_str(&body)
            .map_err(|error| EnrichmentError::Parse(error.to_string()))?;
        found
            .results
            .first()
            .map(|result| result.id)
            .ok_or(EnrichmentError::NotFound)
    }

    /// Direct id, then `/find` by imdb and tvdb id, then a title search.
    /// The first success wins. Rate-limit, abort and disabled errors stop
    /// the chain; otherwise the most informative error is returned.
    pub fn fetch_details_for_item(
        &self,
        item: &CatalogItem,
        media_type: MediaType,
        language: &str,
        options: &FetchOptions,
    ) -> Result<DetailFetch, EnrichmentError> {
        let mut worst: Option<EnrichmentError> = None;
        let mut note = |error: EnrichmentError| -> Result<(), EnrichmentError> {
            if error.stops_lookup_chain() {
                return Err(error);
            }
            if matches!(worst, None | Some(EnrichmentError::NotFound)) {
                worst = Some(error);
            }
            Ok(())
        };

        if let Some(provider_id) = item.tmdb_id.filter(|id| *id > 0) {
            match self.fetch_details(media_type, provider_id, language, options) {
                Ok(fetch) => return Ok(fetch),
                Err(error) => note(error)?,
            }
        }

        let external_ids = [
            item.imdb_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| (id.to_string(), "imdb_id")),
            item.tvdb_id
                .filter(|id| *id > 0)
                .map(|id| (id.to_string(), "tvdb_id")),
        ];
        for (external_id, source) in external_ids.into_iter().flatten() {
            let resolved = self
                .find_by_external_id(media_type, &external_id, source, options)
                .and_then(|provider_id| {
                    self.fetch_details(media_type, provider_id, language, options)
                });
            match resolved {
                Ok(fetch) => return Ok(fetch),
                Err(error) => note(error)?,
            }
        }

        let title = item
            .title
            .as_deref()
            .or(item.original_title.as_deref())
            .map(str::trim)
            .filter(|title| !title.is_empty());
        if let Some(title) = title {
            let resolved = self
                .search_by_title(media_type, title, item.year, language, options)
                .and_then(|provider_id| {
                    self.fetch_details(media_type, provider_id, language, options)
                });
            match resolved {
                Ok(fetch) => return Ok(fetch),
                Err(error) => note(error)?,
            }
        }

        Err(worst.unwrap_or(EnrichmentError::NotFound))
    }
}
