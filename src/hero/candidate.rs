//! Prepared selection views of raw catalog rows.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate};

use crate::protocol::CatalogItem;

/// Items added within this window count as new.
pub const NEW_WINDOW_MS: i64 = 45 * 24 * 60 * 60 * 1000;
/// Items released at least this many years ago count as old.
pub const OLD_AGE_YEARS: i32 = 15;
pub const MAX_CANDIDATE_GENRES: usize = 3;

/// `addedAt` values above this are already milliseconds.
const MILLISECOND_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    /// Position of the row in the raw catalog list.
    pub source_index: usize,
    pub added_at_ms: Option<i64>,
    pub year: Option<i32>,
    pub rating: Option<f64>,
    pub vote_count: u64,
    /// Lowercase, deduplicated, at most three.
    pub genres: Vec<String>,
    pub is_new: bool,
    pub is_old: bool,
}

pub fn added_at_ms(raw: i64) -> Option<i64> {
    if raw <= 0 {
        return None;
    }
    if raw > MILLISECOND_THRESHOLD {
        Some(raw)
    } else {
        Some(raw.saturating_mul(1000))
    }
}

/// Year from `year`, falling back to the leading part of `originallyAvailableAt`.
pub fn release_year(item: &CatalogItem) -> Option<i32> {
    if let Some(year) = item.year.filter(|year| *year > 0) {
        return Some(year);
    }
    let date = item.originally_available_at.as_deref()?.trim();
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|parsed| parsed.year())
        .ok()
        .or_else(|| date.get(..4).and_then(|prefix| prefix.parse::<i32>().ok()))
        .filter(|year| *year > 0)
}

fn current_year(now_ms: i64) -> i32 {
    DateTime::from_timestamp_millis(now_ms)
        .map(|now| now.year())
        .unwrap_or(1970)
}

fn candidate_rating(item: &CatalogItem) -> Option<f64> {
    item.rating
        .or(item.audience_rating)
        .filter(|rating| rating.is_finite())
        .map(|rating| rating.clamp(0.0, 10.0))
}

fn candidate_genres(item: &CatalogItem) -> Vec<String> {
    let mut genres: Vec<String> = Vec::new();
    for genre in &item.genres {
        let normalized = genre.name().trim().to_lowercase();
        if normalized.is_empty() || genres.contains(&normalized) {
            continue;
        }
        genres.push(normalized);
        if genres.len() == MAX_CANDIDATE_GENRES {
            break;
        }
    }
    genres
}

/// One candidate per distinct non-empty id, in catalog order.
pub fn prepare_candidates(items: &[CatalogItem], now_ms: i64) -> Vec<Candidate> {
    let this_year = current_year(now_ms);
    let mut seen = HashSet::new();
    items
        .iter()
        .enumerate()
        .filter_map(|(source_index, item)| {
            let id = item.rating_key.trim();
            if id.is_empty() || !seen.insert(id.to_string()) {
                return None;
            }
            let added_at_ms = item.added_at.and_then(added_at_ms);
            let year = release_year(item);
            Some(Candidate {
                id: id.to_string(),
                source_index,
                added_at_ms,
                year,
                rating: candidate_rating(item),
                vote_count: item.vote_count.unwrap_or(0),
                genres: candidate_genres(item),
                is_new: added_at_ms
                    .is_some_and(|added| now_ms.saturating_sub(added) <= NEW_WINDOW_MS),
                is_old: year.is_some_and(|year| this_year - year >= OLD_AGE_YEARS),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{added_at_ms, prepare_candidates, release_year, NEW_WINDOW_MS};
    use crate::protocol::{CatalogItem, GenreTag};

    // 2024-06-01T00:00:00Z
    const NOW_MS: i64 = 1_717_200_000_000;

    fn item(id: &str) -> CatalogItem {
        CatalogItem {
            rating_key: id.to_string(),
            ..CatalogItem::default()
        }
    }

    #[test]
    fn test_added_at_accepts_seconds_and_milliseconds() {
        assert_eq!(added_at_ms(1_700_000_000), Some(1_700_000_000_000));
        assert_eq!(added_at_ms(1_700_000_000_000), Some(1_700_000_000_000));
        assert_eq!(added_at_ms(0), None);
    }

    #[test]
    fn test_release_year_falls_back_to_available_date() {
        let mut row = item("1");
        row.originally_available_at = Some("1995-12-15".to_string());
        assert_eq!(release_year(&row), Some(1995));
        row.year = Some(1996);
        assert_eq!(release_year(&row), Some(1996));
        row.year = None;
        row.originally_available_at = Some("2001".to_string());
        assert_eq!(release_year(&row), Some(2001));
    }

    #[test]
    fn test_new_and_old_flags() {
        let mut fresh = item("fresh");
        fresh.added_at = Some(NOW_MS - NEW_WINDOW_MS + 1);
        fresh.year = Some(2024);
        let mut classic = item("classic");
        classic.added_at = Some((NOW_MS - NEW_WINDOW_MS - 1) / 1000);
        classic.year = Some(2009);
        let mut borderline = item("borderline");
        borderline.year = Some(2010);

        let candidates = prepare_candidates(&[fresh, classic, borderline], NOW_MS);
        assert!(candidates[0].is_new && !candidates[0].is_old);
        assert!(!candidates[1].is_new && candidates[1].is_old);
        assert!(!candidates[2].is_new && !candidates[2].is_old);
    }

    #[test]
    fn test_genres_are_lowercased_deduplicated_and_capped() {
        let mut row = item("1");
        row.genres = vec![
            GenreTag::Name("Drama".to_string()),
            GenreTag::Tagged {
                tag: "drama".to_string(),
            },
            GenreTag::Name(" ".to_string()),
            GenreTag::Name("Crime".to_string()),
            GenreTag::Name("Thriller".to_string()),
            GenreTag::Name("Action".to_string()),
        ];
        let candidates = prepare_candidates(&[row], NOW_MS);
        assert_eq!(candidates[0].genres, vec!["drama", "crime", "thriller"]);
    }

    #[test]
    fn test_duplicate_and_blank_ids_are_skipped() {
        let mut rated = item("a");
        rated.audience_rating = Some(12.0);
        let candidates = prepare_candidates(&[rated, item(" "), item("a"), item("b")], NOW_MS);
        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(candidates[0].rating, Some(10.0));
        assert_eq!(candidates[1].source_index, 3);
    }
}
