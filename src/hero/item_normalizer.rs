//! Maps a raw catalog row plus an optional provider payload to a hero item.

use chrono::{Datelike, NaiveDate};
use log::debug;

use crate::config::EnrichmentConfig;
use crate::enrichment::DetailFetch;
use crate::hero::candidate::release_year;
use crate::policy::TextLimits;
use crate::protocol::{
    Backdrop, CallToAction, CatalogItem, CtaTarget, EnrichmentProvenance, EnrichmentSource,
    HeroKind, NormalizedHeroItem, SlotName,
};

pub const MIN_BACKDROP_WIDTH: u32 = 1280;
pub const MAX_BACKDROPS: usize = 5;
const ELLIPSIS: char = '…';

/// Provider presentation settings the normalizer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeSettings {
    pub region: String,
    pub image_base_url: String,
}

impl NormalizeSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            region: config.region.clone(),
            image_base_url: config.image_base_url.clone(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Collapses whitespace and clamps to `max_chars`, cutting at a word
/// boundary when one exists in the second half and appending an ellipsis.
pub fn clamp_text(value: &str, max_chars: usize) -> Option<String> {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() || max_chars == 0 {
        return None;
    }
    if compact.chars().count() <= max_chars {
        return Some(compact);
    }
    let budget = max_chars.saturating_sub(1);
    let head: String = compact.chars().take(budget).collect();
    let ends_on_word = compact.chars().nth(budget).is_some_and(char::is_whitespace);
    let cut = match head.rfind(' ') {
        _ if ends_on_word => head.as_str(),
        Some(position) if head[..position].chars().count() >= budget / 2 => &head[..position],
        _ => head.as_str(),
    };
    let trimmed = cut.trim_end_matches(|ch: char| ch.is_whitespace() || ",;:-".contains(ch));
    Some(format!("{trimmed}{ELLIPSIS}"))
}

fn year_from_date(date: &str) -> Option<i32> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map(|parsed| parsed.year())
        .ok()
}

fn round_rating(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn backdrops(fetch: Option<&DetailFetch>, image_base_url: &str) -> Vec<Backdrop> {
    let Some(fetch) = fetch else {
        return Vec::new();
    };
    let base = image_base_url.trim_end_matches('/');
    let mut images: Vec<_> = fetch
        .detail
        .backdrops()
        .iter()
        .filter(|image| image.width >= MIN_BACKDROP_WIDTH && !image.file_path.is_empty())
        .collect();
    images.sort_by(|left, right| {
        right
            .vote_average
            .partial_cmp(&left.vote_average)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    images
        .into_iter()
        .take(MAX_BACKDROPS)
        .map(|image| Backdrop {
            url: format!("{base}/{}", image.file_path.trim_start_matches('/')),
            width: image.width,
            height: image.height,
        })
        .collect()
}

fn call_to_action(raw: &CatalogItem, fetch: Option<&DetailFetch>) -> CallToAction {
    if let Some(provider_id) = fetch.map(|fetch| fetch.detail.id).or(raw.tmdb_id) {
        return CallToAction {
            target: CtaTarget::Provider,
            id: provider_id.to_string(),
        };
    }
    let external = non_empty(raw.imdb_id.as_deref())
        .map(str::to_string)
        .or_else(|| raw.tvdb_id.map(|id| id.to_string()));
    match external {
        Some(id) => CallToAction {
            target: CtaTarget::External,
            id,
        },
        None => CallToAction {
            target: CtaTarget::Library,
            id: raw.rating_key.trim().to_string(),
        },
    }
}

/// Returns `None` when no title can be found in either source.
pub fn normalize_hero_item(
    raw: &CatalogItem,
    kind: HeroKind,
    slot: SlotName,
    fetch: Option<&DetailFetch>,
    limits: &TextLimits,
    settings: &NormalizeSettings,
) -> Option<NormalizedHeroItem> {
    let detail = fetch.map(|fetch| &fetch.detail);
    let Some(title) = detail
        .and_then(|detail| detail.display_title())
        .or_else(|| non_empty(raw.title.as_deref()))
        .or_else(|| non_empty(raw.original_title.as_deref()))
    else {
        debug!(
            "Hero[{}]: item {} has no title, skipping",
            kind, raw.rating_key
        );
        return None;
    };

    let tagline = non_empty(detail.and_then(|detail| detail.tagline.as_deref()))
        .or_else(|| non_empty(raw.tagline.as_deref()))
        .and_then(|text| clamp_text(text, limits.tagline_max_chars));
    let overview = non_empty(detail.and_then(|detail| detail.overview.as_deref()))
        .or_else(|| non_empty(raw.summary.as_deref()))
        .and_then(|text| clamp_text(text, limits.overview_max_chars));
    let year = detail
        .and_then(|detail| detail.first_date())
        .and_then(year_from_date)
        .or_else(|| release_year(raw));
    let runtime_minutes = detail
        .and_then(|detail| detail.runtime_minutes())
        .or_else(|| {
            raw.duration
                .filter(|ms| *ms > 0)
                .map(|ms| ((ms as f64) / 60_000.0).round() as u32)
                .filter(|minutes| *minutes > 0)
        });
    let rating = detail
        .and_then(|detail| detail.vote_average)
        .filter(|rating| rating.is_finite() && *rating > 0.0)
        .or(raw.rating)
        .or(raw.audience_rating)
        .filter(|rating| rating.is_finite())
        .map(|rating| round_rating(rating.clamp(0.0, 10.0)));
    let vote_count = detail
        .and_then(|detail| detail.vote_count)
        .or(raw.vote_count);
    let mut genres = detail.map(|detail| detail.genre_names()).unwrap_or_default();
    if genres.is_empty() {
        genres = raw
            .genres
            .iter()
            .map(|genre| genre.name().trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
    }
    let certification = detail
        .and_then(|detail| detail.certification(&settings.region))
        .or_else(|| non_empty(raw.content_rating.as_deref()).map(str::to_string));
    let (season_count, episode_count) = match kind {
        HeroKind::Movies => (None, None),
        HeroKind::Shows => (
            detail
                .and_then(|detail| detail.number_of_seasons)
                .or(raw.child_count),
            detail
                .and_then(|detail| detail.number_of_episodes)
                .or(raw.leaf_count),
        ),
    };

    Some(NormalizedHeroItem {
        id: raw.rating_key.trim().to_string(),
        kind,
        slot,
        title: title.to_string(),
        tagline,
        overview,
        year,
        runtime_minutes,
        rating,
        vote_count,
        genres,
        certification,
        backdrops: backdrops(fetch, &settings.image_base_url),
        season_count,
        episode_count,
        cta: call_to_action(raw, fetch),
        enrichment: fetch.map(|fetch| EnrichmentProvenance {
            id: fetch.detail.id,
            fetched_at: fetch.fetched_at,
            source: if fetch.from_cache {
                EnrichmentSource::Cache
            } else {
                EnrichmentSource::Network
            },
        }),
    })
}
