//! Event-bus protocol and shared payloads for the hero rotation runtime.
//!
//! This module defines the catalog input rows, the normalized hero output,
//! progress notifications, and every message exchanged over the broadcast bus
//! between the rotation manager and its callers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::RawPolicy;
use crate::hero::pool_builder::HeroPool;
use crate::policy::ConfigIssue;

/// Catalog family a pool is built for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HeroKind {
    Movies,
    Shows,
}

impl HeroKind {
    pub const ALL: [HeroKind; 2] = [HeroKind::Movies, HeroKind::Shows];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movies => "movies",
            Self::Shows => "shows",
        }
    }

    /// Provider media type used for lookups of this kind.
    pub fn media_type(self) -> MediaType {
        match self {
            Self::Movies => MediaType::Movie,
            Self::Shows => MediaType::Tv,
        }
    }
}

impl fmt::Display for HeroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeroKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "movies" | "movie" => Ok(Self::Movies),
            "shows" | "show" | "series" | "tv" => Ok(Self::Shows),
            other => Err(format!("unknown catalog kind '{other}'")),
        }
    }
}

/// Provider-side media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_path(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
        }
    }
}

/// Named selection bucket. Declaration order is the fill priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SlotName {
    New,
    TopRated,
    OldButGold,
    Random,
}

impl SlotName {
    pub const PRIORITY: [SlotName; 4] = [
        SlotName::New,
        SlotName::TopRated,
        SlotName::OldButGold,
        SlotName::Random,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::TopRated => "topRated",
            Self::OldButGold => "oldButGold",
            Self::Random => "random",
        }
    }
}

/// Genre tags arrive either as plain strings or as `{ "tag": "Drama" }` objects.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum GenreTag {
    Name(String),
    Tagged { tag: String },
}

impl GenreTag {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Tagged { tag } => tag,
        }
    }
}

/// One raw row of the media-server catalog export.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    #[serde(alias = "id")]
    pub rating_key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Unix seconds or milliseconds, depending on the exporter.
    #[serde(default)]
    pub added_at: Option<i64>,
    /// `YYYY-MM-DD`.
    #[serde(default)]
    pub originally_available_at: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub audience_rating: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub genres: Vec<GenreTag>,
    /// Runtime in milliseconds.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(default)]
    pub content_rating: Option<String>,
    #[serde(default)]
    pub tmdb_id: Option<u64>,
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub tvdb_id: Option<u64>,
    #[serde(default)]
    pub child_count: Option<u32>,
    #[serde(default)]
    pub leaf_count: Option<u32>,
}

/// Backdrop image that passed the width filter.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Backdrop {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// What the call-to-action id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CtaTarget {
    Provider,
    External,
    Library,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CallToAction {
    pub target: CtaTarget,
    pub id: String,
}

/// Where an enrichment payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentSource {
    Network,
    Cache,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentProvenance {
    pub id: u64,
    pub fetched_at: i64,
    pub source: EnrichmentSource,
}

/// Compact public record for one featured item.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedHeroItem {
    pub id: String,
    pub kind: HeroKind,
    pub slot: SlotName,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification: Option<String>,
    #[serde(default)]
    pub backdrops: Vec<Backdrop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_count: Option<u32>,
    pub cta: CallToAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentProvenance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Start,
    Normalizing,
    Cache,
    Done,
}

/// Build progress notification for reporting collaborators.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub kind: HeroKind,
    pub index: usize,
    pub total: usize,
    pub slot: Option<SlotName>,
    pub id: Option<String>,
}

/// Snapshot of the provider rate-limit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitState {
    pub active: bool,
    /// Unix ms at which the penalty window ends.
    pub until: i64,
    pub retry_after_ms: i64,
    pub last_status: Option<u16>,
    pub last_hit_at: Option<i64>,
    pub strikes: u32,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum HeroMessage {
    Request(RotationRequest),
    Notification(RotationNotification),
}

/// Commands accepted by the rotation manager.
#[derive(Debug, Clone)]
pub enum RotationRequest {
    BuildPool {
        request_id: String,
        kind: HeroKind,
        items: Arc<Vec<CatalogItem>>,
        force: bool,
    },
    PolicyChanged(RawPolicy),
    InvalidatePool(HeroKind),
    ClearHeroMemory(HeroKind),
    ClearHeroFailures(HeroKind),
    ClearEnrichmentCache,
    Shutdown,
}

/// Results and status published by the rotation manager.
#[derive(Debug, Clone)]
pub enum RotationNotification {
    Progress(ProgressEvent),
    PoolReady {
        request_id: String,
        pool: Arc<HeroPool>,
    },
    PoolFailed {
        request_id: String,
        kind: HeroKind,
        reason: String,
    },
    ConfigIssues(Vec<ConfigIssue>),
    RateLimitChanged(RateLimitState),
    EnrichmentCacheCleared {
        cleared_entries: usize,
    },
}

/// Slot name → count, serialized with the public slot names.
pub type SlotCounts = BTreeMap<SlotName, usize>;
