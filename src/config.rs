//! Persistent engine configuration model and defaults.
//!
//! The `[policy]` section is deliberately loosely typed: values are only
//! checked by `policy::validate_policy`, which substitutes defaults and
//! reports issues instead of failing the load.

/// Root configuration persisted to `spotlight.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Selection, caching and text policy.
    pub policy: RawPolicy,
    #[serde(default)]
    /// Metadata provider client settings.
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    /// Where persisted pools and rotation records live.
    pub storage: StorageConfig,
}

/// Unvalidated rotation policy as supplied by the user or a caller.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawPolicy {
    #[serde(default)]
    pub pool_size: RawPoolSizes,
    #[serde(default)]
    pub quotas: RawSlotQuotas,
    #[serde(default)]
    pub diversity: RawDiversityWeights,
    #[serde(default = "default_rotation_interval_minutes")]
    pub rotation_interval_minutes: i64,
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: i64,
    #[serde(default = "default_tagline_max_chars")]
    pub tagline_max_chars: i64,
    #[serde(default = "default_overview_max_chars")]
    pub overview_max_chars: i64,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: f64,
    #[serde(default = "default_cache_grace_minutes")]
    pub cache_grace_minutes: f64,
    /// Catalog kind to show when the requested kind has too few items.
    #[serde(default)]
    pub fallback_kind: Option<String>,
    #[serde(default = "default_history_window_days")]
    pub history_window_days: f64,
    #[serde(default = "default_failure_ttl_minutes")]
    pub failure_ttl_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawPoolSizes {
    #[serde(default = "default_pool_size")]
    pub movies: i64,
    #[serde(default = "default_pool_size")]
    pub shows: i64,
}

/// Fractions of the pool size per slot. They need not sum to 1.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawSlotQuotas {
    #[serde(default = "default_quota_new")]
    pub new: f64,
    #[serde(default = "default_quota_top_rated")]
    pub top_rated: f64,
    #[serde(default = "default_quota_old_but_gold")]
    pub old_but_gold: f64,
    #[serde(default = "default_quota_random")]
    pub random: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawDiversityWeights {
    #[serde(default = "default_genre_weight")]
    pub genre: f64,
    #[serde(default = "default_year_weight")]
    pub year: f64,
}

/// Metadata provider client preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
    /// Region used for certifications.
    #[serde(default = "default_region")]
    pub region: String,
    /// Caller-supplied settings credential (API key form).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Caller-supplied settings credential (v4 read access token form).
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Account name of the persisted user token in the system keyring.
    #[serde(default = "default_keyring_account")]
    pub keyring_account: String,
    /// JSON document with shared credentials, fetched once per process.
    #[serde(default)]
    pub remote_config_url: Option<String>,
    #[serde(default)]
    pub fallback_api_key: Option<String>,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_rate_limit_base_ms")]
    pub rate_limit_base_ms: u64,
    #[serde(default = "default_rate_limit_max_ms")]
    pub rate_limit_max_ms: u64,
    #[serde(default = "default_strike_cap")]
    pub strike_cap: u32,
    #[serde(default = "default_strike_threshold")]
    pub strike_threshold: u32,
    #[serde(default = "default_strike_decay_ms")]
    pub strike_decay_ms: u64,
    #[serde(default = "default_response_cache_ttl_minutes")]
    pub response_cache_ttl_minutes: u64,
    #[serde(default = "default_response_cache_max_entries")]
    pub response_cache_max_entries: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Persistence locations.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Overrides the platform data directory.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// When false only the session area is used.
    #[serde(default = "default_true")]
    pub durable: bool,
}

impl Default for RawPolicy {
    fn default() -> Self {
        Self {
            pool_size: RawPoolSizes::default(),
            quotas: RawSlotQuotas::default(),
            diversity: RawDiversityWeights::default(),
            rotation_interval_minutes: default_rotation_interval_minutes(),
            min_pool_size: default_min_pool_size(),
            tagline_max_chars: default_tagline_max_chars(),
            overview_max_chars: default_overview_max_chars(),
            language: default_language(),
            cache_ttl_hours: default_cache_ttl_hours(),
            cache_grace_minutes: default_cache_grace_minutes(),
            fallback_kind: None,
            history_window_days: default_history_window_days(),
            failure_ttl_minutes: default_failure_ttl_minutes(),
        }
    }
}

impl Default for RawPoolSizes {
    fn default() -> Self {
        Self {
            movies: default_pool_size(),
            shows: default_pool_size(),
        }
    }
}

impl Default for RawSlotQuotas {
    fn default() -> Self {
        Self {
            new: default_quota_new(),
            top_rated: default_quota_top_rated(),
            old_but_gold: default_quota_old_but_gold(),
            random: default_quota_random(),
        }
    }
}

impl Default for RawDiversityWeights {
    fn default() -> Self {
        Self {
            genre: default_genre_weight(),
            year: default_year_weight(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_provider_base_url(),
            image_base_url: default_image_base_url(),
            region: default_region(),
            api_key: None,
            bearer_token: None,
            keyring_account: default_keyring_account(),
            remote_config_url: None,
            fallback_api_key: None,
            min_request_interval_ms: default_min_request_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_base_ms: default_rate_limit_base_ms(),
            rate_limit_max_ms: default_rate_limit_max_ms(),
            strike_cap: default_strike_cap(),
            strike_threshold: default_strike_threshold(),
            strike_decay_ms: default_strike_decay_ms(),
            response_cache_ttl_minutes: default_response_cache_ttl_minutes(),
            response_cache_max_entries: default_response_cache_max_entries(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: default_database_file(),
            durable: true,
        }
    }
}

fn default_true() -> bool {
    true
}

pub fn default_pool_size() -> i64 {
    10
}

pub fn default_quota_new() -> f64 {
    0.3
}

pub fn default_quota_top_rated() -> f64 {
    0.3
}

pub fn default_quota_old_but_gold() -> f64 {
    0.2
}

pub fn default_quota_random() -> f64 {
    0.2
}

pub fn default_genre_weight() -> f64 {
    0.6
}

pub fn default_year_weight() -> f64 {
    0.4
}

pub fn default_rotation_interval_minutes() -> i64 {
    15
}

pub fn default_min_pool_size() -> i64 {
    3
}

pub fn default_tagline_max_chars() -> i64 {
    140
}

pub fn default_overview_max_chars() -> i64 {
    360
}

pub fn default_language() -> String {
    "en-US".to_string()
}

pub fn default_cache_ttl_hours() -> f64 {
    24.0
}

pub fn default_cache_grace_minutes() -> f64 {
    30.0
}

pub fn default_history_window_days() -> f64 {
    14.0
}

pub fn default_failure_ttl_minutes() -> f64 {
    30.0
}

fn default_provider_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_image_base_url() -> String {
    "https://image.tmdb.org/t/p/original".to_string()
}

fn default_region() -> String {
    "US".to_string()
}

fn default_keyring_account() -> String {
    "default".to_string()
}

fn default_min_request_interval_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_rate_limit_base_ms() -> u64 {
    2_000
}

fn default_rate_limit_max_ms() -> u64 {
    120_000
}

fn default_strike_cap() -> u32 {
    5
}

fn default_strike_threshold() -> u32 {
    4
}

fn default_strike_decay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_response_cache_ttl_minutes() -> u64 {
    6 * 60
}

fn default_response_cache_max_entries() -> usize {
    256
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_database_file() -> String {
    "spotlight.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Config, RawPolicy};

    #[test]
    fn test_partial_policy_section_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [policy]
            min_pool_size = 5

            [policy.quotas]
            new = 0.5
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.policy.min_pool_size, 5);
        assert_eq!(config.policy.quotas.new, 0.5);
        assert_eq!(config.policy.quotas.top_rated, 0.3);
        assert_eq!(config.policy.pool_size.movies, 10);
        assert_eq!(config.policy.language, "en-US");
        assert!(config.enrichment.enabled);
        assert!(config.storage.durable);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default();
        let encoded = toml::to_string(&config).expect("config should encode");
        let decoded: Config = toml::from_str(&encoded).expect("config should decode");
        assert_eq!(decoded, config);
        assert_eq!(decoded.policy, RawPolicy::default());
    }
}
