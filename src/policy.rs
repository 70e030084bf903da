//! Policy validation and slot planning.
//!
//! Validation never fails: every out-of-range value is replaced by its default
//! and reported as a `ConfigIssue` for whoever displays configuration problems.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::{self, RawPolicy};
use crate::protocol::{HeroKind, SlotName};

const MAX_POOL_SIZE: i64 = 50;
const MIN_TEXT_LIMIT: i64 = 16;
const MAX_TEXT_LIMIT: i64 = 2_000;
const MAX_CACHE_TTL_HOURS: f64 = 24.0 * 30.0;
const MAX_GRACE_MINUTES: f64 = 24.0 * 60.0;
const MAX_HISTORY_WINDOW_DAYS: f64 = 365.0;
const QUOTA_EPSILON: f64 = 1e-9;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// One substituted configuration value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
    pub substituted: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (using {})",
            self.field, self.message, self.substituted
        )
    }
}

/// Validated slot quotas, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SlotQuotas {
    pub new: f64,
    pub top_rated: f64,
    pub old_but_gold: f64,
    pub random: f64,
}

impl SlotQuotas {
    pub fn get(&self, slot: SlotName) -> f64 {
        match slot {
            SlotName::New => self.new,
            SlotName::TopRated => self.top_rated,
            SlotName::OldButGold => self.old_but_gold,
            SlotName::Random => self.random,
        }
    }
}

/// Validated diversity weights, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DiversityWeights {
    pub genre: f64,
    pub year: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TextLimits {
    pub tagline_max_chars: usize,
    pub overview_max_chars: usize,
}

/// Rotation policy after validation.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Policy {
    pub movies_pool_size: usize,
    pub shows_pool_size: usize,
    pub quotas: SlotQuotas,
    pub diversity: DiversityWeights,
    pub rotation_interval_ms: i64,
    pub min_pool_size: usize,
    pub text_limits: TextLimits,
    pub language: String,
    pub cache_ttl_ms: i64,
    pub cache_grace_ms: i64,
    pub fallback_kind: Option<HeroKind>,
    pub history_window_ms: i64,
    pub failure_ttl_ms: i64,
}

impl Default for Policy {
    fn default() -> Self {
        validate_policy(&RawPolicy::default()).0
    }
}

impl Policy {
    pub fn pool_size(&self, kind: HeroKind) -> usize {
        match kind {
            HeroKind::Movies => self.movies_pool_size,
            HeroKind::Shows => self.shows_pool_size,
        }
    }

    /// Memory exclusions last as long as a pool can be served.
    pub fn memory_window_ms(&self) -> i64 {
        self.cache_ttl_ms.saturating_add(self.cache_grace_ms)
    }

    /// Signature of every policy field that shapes pool contents for `kind`.
    pub fn signature(&self, kind: HeroKind) -> String {
        let shape = serde_json::json!({
            "kind": kind.as_str(),
            "poolSize": self.pool_size(kind),
            "quotas": [
                self.quotas.new,
                self.quotas.top_rated,
                self.quotas.old_but_gold,
                self.quotas.random,
            ],
            "diversity": [self.diversity.genre, self.diversity.year],
            "text": [
                self.text_limits.tagline_max_chars,
                self.text_limits.overview_max_chars,
            ],
            "language": self.language,
        });
        format!("{:x}", md5::compute(shape.to_string().as_bytes()))
    }
}

struct IssueCollector {
    issues: Vec<ConfigIssue>,
}

impl IssueCollector {
    fn push(&mut self, field: &str, message: impl Into<String>, substituted: impl fmt::Display) {
        self.issues.push(ConfigIssue {
            field: field.to_string(),
            message: message.into(),
            substituted: substituted.to_string(),
        });
    }

    fn unit_fraction(&mut self, field: &str, value: f64, default: f64) -> f64 {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            return value;
        }
        self.push(field, format!("{value} is not within 0..=1"), default);
        default
    }

    fn bounded_int(&mut self, field: &str, value: i64, min: i64, max: i64, default: i64) -> i64 {
        if (min..=max).contains(&value) {
            return value;
        }
        self.push(field, format!("{value} is not within {min}..={max}"), default);
        default
    }

    fn bounded_float(
        &mut self,
        field: &str,
        value: f64,
        min_exclusive: Option<f64>,
        min_inclusive: Option<f64>,
        max: f64,
        default: f64,
    ) -> f64 {
        let above_min = match (min_exclusive, min_inclusive) {
            (Some(min), _) => value > min,
            (None, Some(min)) => value >= min,
            (None, None) => true,
        };
        if value.is_finite() && above_min && value <= max {
            return value;
        }
        self.push(field, format!("{value} is out of range"), default);
        default
    }
}

fn language_looks_valid(language: &str) -> bool {
    let trimmed = language.trim();
    (2..=10).contains(&trimmed.len())
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        && trimmed.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic())
}

/// Validates a raw policy, substituting defaults for every invalid field.
pub fn validate_policy(raw: &RawPolicy) -> (Policy, Vec<ConfigIssue>) {
    let mut collector = IssueCollector { issues: Vec::new() };
    let pool_default = config::default_pool_size();

    let movies_pool_size = collector.bounded_int(
        "pool_size.movies",
        raw.pool_size.movies,
        0,
        MAX_POOL_SIZE,
        pool_default,
    ) as usize;
    let shows_pool_size = collector.bounded_int(
        "pool_size.shows",
        raw.pool_size.shows,
        0,
        MAX_POOL_SIZE,
        pool_default,
    ) as usize;

    let quotas = SlotQuotas {
        new: collector.unit_fraction("quotas.new", raw.quotas.new, config::default_quota_new()),
        top_rated: collector.unit_fraction(
            "quotas.top_rated",
            raw.quotas.top_rated,
            config::default_quota_top_rated(),
        ),
        old_but_gold: collector.unit_fraction(
            "quotas.old_but_gold",
            raw.quotas.old_but_gold,
            config::default_quota_old_but_gold(),
        ),
        random: collector.unit_fraction(
            "quotas.random",
            raw.quotas.random,
            config::default_quota_random(),
        ),
    };

    let diversity = DiversityWeights {
        genre: collector.unit_fraction(
            "diversity.genre",
            raw.diversity.genre,
            config::default_genre_weight(),
        ),
        year: collector.unit_fraction(
            "diversity.year",
            raw.diversity.year,
            config::default_year_weight(),
        ),
    };

    let rotation_interval_minutes = collector.bounded_int(
        "rotation_interval_minutes",
        raw.rotation_interval_minutes,
        1,
        7 * 24 * 60,
        config::default_rotation_interval_minutes(),
    );
    let min_pool_size = collector.bounded_int(
        "min_pool_size",
        raw.min_pool_size,
        0,
        MAX_POOL_SIZE,
        config::default_min_pool_size(),
    ) as usize;

    let text_limits = TextLimits {
        tagline_max_chars: collector.bounded_int(
            "tagline_max_chars",
            raw.tagline_max_chars,
            MIN_TEXT_LIMIT,
            MAX_TEXT_LIMIT,
            config::default_tagline_max_chars(),
        ) as usize,
        overview_max_chars: collector.bounded_int(
            "overview_max_chars",
            raw.overview_max_chars,
            MIN_TEXT_LIMIT,
            MAX_TEXT_LIMIT,
            config::default_overview_max_chars(),
        ) as usize,
    };

    let language = if language_looks_valid(&raw.language) {
        raw.language.trim().to_string()
    } else {
        let fallback = config::default_language();
        collector.push(
            "language",
            format!("'{}' is not a language tag", raw.language),
            &fallback,
        );
        fallback
    };

    let cache_ttl_hours = collector.bounded_float(
        "cache_ttl_hours",
        raw.cache_ttl_hours,
        Some(0.0),
        None,
        MAX_CACHE_TTL_HOURS,
        config::default_cache_ttl_hours(),
    );
    let cache_grace_minutes = collector.bounded_float(
        "cache_grace_minutes",
        raw.cache_grace_minutes,
        None,
        Some(0.0),
        MAX_GRACE_MINUTES,
        config::default_cache_grace_minutes(),
    );
    let history_window_days = collector.bounded_float(
        "history_window_days",
        raw.history_window_days,
        None,
        Some(0.0),
        MAX_HISTORY_WINDOW_DAYS,
        config::default_history_window_days(),
    );
    let failure_ttl_minutes = collector.bounded_float(
        "failure_ttl_minutes",
        raw.failure_ttl_minutes,
        Some(0.0),
        None,
        MAX_GRACE_MINUTES,
        config::default_failure_ttl_minutes(),
    );

    let fallback_kind = match raw.fallback_kind.as_deref() {
        None => None,
        Some(value) if value.trim().is_empty() => None,
        Some(value) => match value.parse::<HeroKind>() {
            Ok(kind) => Some(kind),
            Err(error) => {
                collector.push("fallback_kind", error, "none");
                None
            }
        },
    };

    let policy = Policy {
        movies_pool_size,
        shows_pool_size,
        quotas,
        diversity,
        rotation_interval_ms: rotation_interval_minutes.saturating_mul(MINUTE_MS),
        min_pool_size,
        text_limits,
        language,
        cache_ttl_ms: (cache_ttl_hours * HOUR_MS as f64).round() as i64,
        cache_grace_ms: (cache_grace_minutes * MINUTE_MS as f64).round() as i64,
        fallback_kind,
        history_window_ms: (history_window_days * DAY_MS as f64).round() as i64,
        failure_ttl_ms: (failure_ttl_minutes * MINUTE_MS as f64).round() as i64,
    };
    (policy, collector.issues)
}

/// Slot name → item count. Always sums to the requested pool size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPlan {
    counts: BTreeMap<SlotName, usize>,
}

impl SlotPlan {
    pub fn get(&self, slot: SlotName) -> usize {
        self.counts.get(&slot).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<SlotName, usize> {
        &self.counts
    }
}

/// Turns fractional quotas into integer slot counts summing to `pool_size`.
///
/// Quotas summing above 1 are scaled down proportionally. The leftover after
/// flooring goes round-robin, in slot priority order, to slots with a positive
/// quota (or to every slot when all quotas are zero).
pub fn plan_slots(pool_size: usize, quotas: &SlotQuotas) -> SlotPlan {
    let mut counts: BTreeMap<SlotName, usize> =
        SlotName::PRIORITY.iter().map(|slot| (*slot, 0)).collect();
    if pool_size == 0 {
        return SlotPlan { counts };
    }

    let raw: Vec<(SlotName, f64)> = SlotName::PRIORITY
        .iter()
        .map(|slot| {
            let quota = quotas.get(*slot);
            let quota = if quota.is_finite() {
                quota.clamp(0.0, 1.0)
            } else {
                0.0
            };
            (*slot, quota)
        })
        .collect();
    let quota_sum: f64 = raw.iter().map(|(_, quota)| quota).sum();
    let scale = if quota_sum > 1.0 { 1.0 / quota_sum } else { 1.0 };

    for (slot, quota) in &raw {
        let exact = pool_size as f64 * quota * scale;
        counts.insert(*slot, (exact + QUOTA_EPSILON).floor() as usize);
    }

    let mut assigned: usize = counts.values().sum();
    while assigned > pool_size {
        if let Some(slot) = SlotName::PRIORITY
            .iter()
            .rev()
            .find(|slot| counts.get(slot).copied().unwrap_or(0) > 0)
        {
            if let Some(count) = counts.get_mut(slot) {
                *count -= 1;
            }
        }
        assigned -= 1;
    }

    let mut receivers: Vec<SlotName> = raw
        .iter()
        .filter(|(_, quota)| *quota > 0.0)
        .map(|(slot, _)| *slot)
        .collect();
    if receivers.is_empty() {
        receivers = SlotName::PRIORITY.to_vec();
    }
    let mut cursor = 0usize;
    while assigned < pool_size {
        let slot = receivers[cursor % receivers.len()];
        if let Some(count) = counts.get_mut(&slot) {
            *count += 1;
        }
        assigned += 1;
        cursor += 1;
    }

    SlotPlan { counts }
}
