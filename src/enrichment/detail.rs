//! Provider payload shapes. Only the fields the normalizer consumes are modeled.

use serde::{Deserialize, Serialize};

/// Detail record for one movie or show, with appended images, ratings and ids.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProviderDetail {
    pub id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub first_air_date: Option<String>,
    #[serde(default)]
    pub runtime: Option<u32>,
    #[serde(default)]
    pub episode_run_time: Option<Vec<u32>>,
    #[serde(default)]
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub genres: Option<Vec<ProviderGenre>>,
    #[serde(default)]
    pub number_of_seasons: Option<u32>,
    #[serde(default)]
    pub number_of_episodes: Option<u32>,
    #[serde(default)]
    pub images: Option<ProviderImages>,
    /// Movie certifications, appended with `release_dates`.
    #[serde(default)]
    pub release_dates: Option<RegionList<RegionReleaseDates>>,
    /// Show certifications, appended with `content_ratings`.
    #[serde(default)]
    pub content_ratings: Option<RegionList<RegionContentRating>>,
    #[serde(default)]
    pub external_ids: Option<ExternalIds>,
}

impl ProviderDetail {
    pub fn display_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or(self.name.as_deref())
            .map(str::trim)
            .filter(|title| !title.is_empty())
    }

    pub fn first_date(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .or(self.first_air_date.as_deref())
            .filter(|date| !date.is_empty())
    }

    /// Movie runtime, or the first listed episode runtime for shows.
    pub fn runtime_minutes(&self) -> Option<u32> {
        self.runtime.filter(|minutes| *minutes > 0).or_else(|| {
            self.episode_run_time
                .as_ref()
                .and_then(|runtimes| runtimes.iter().copied().find(|minutes| *minutes > 0))
        })
    }

    pub fn genre_names(&self) -> Vec<String> {
        self.genres
            .iter()
            .flatten()
            .map(|genre| genre.name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Non-empty certification for `region`, movies first then shows.
    pub fn certification(&self, region: &str) -> Option<String> {
        let from_release_dates = self.release_dates.as_ref().and_then(|list| {
            list.results
                .iter()
                .filter(|entry| entry.iso_3166_1.eq_ignore_ascii_case(region))
                .flat_map(|entry| entry.release_dates.iter())
                .map(|date| date.certification.trim())
                .find(|certification| !certification.is_empty())
                .map(str::to_string)
        });
        from_release_dates.or_else(|| {
            self.content_ratings.as_ref().and_then(|list| {
                list.results
                    .iter()
                    .filter(|entry| entry.iso_3166_1.eq_ignore_ascii_case(region))
                    .map(|entry| entry.rating.trim())
                    .find(|rating| !rating.is_empty())
                    .map(str::to_string)
            })
        })
    }

    pub fn backdrops(&self) -> &[ProviderImage] {
        self.images
            .as_ref()
            .and_then(|images| images.backdrops.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderGenre {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProviderImages {
    #[serde(default)]
    pub backdrops: Option<Vec<ProviderImage>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderImage {
    pub file_path: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub vote_average: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegionList<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegionReleaseDates {
    pub iso_3166_1: String,
    #[serde(default)]
    pub release_dates: Vec<ReleaseDate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReleaseDate {
    #[serde(default)]
    pub certification: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegionContentRating {
    pub iso_3166_1: String,
    #[serde(default)]
    pub rating: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ExternalIds {
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub tvdb_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct IdOnly {
    pub id: u64,
}

/// `/find/{external_id}` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct FindResponse {
    #[serde(default)]
    pub movie_results: Vec<IdOnly>,
    #[serde(default)]
    pub tv_results: Vec<IdOnly>,
}

/// `/search/{type}` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct SearchResponse {
    #[serde(default)]
    pub results: Vec<IdOnly>,
}

#[cfg(test)]
mod tests {
    use super::ProviderDetail;

    #[test]
    fn test_detail_parses_appended_sections() {
        let detail: ProviderDetail = serde_json::from_str(
            r#"{
                "id": 949,
                "title": "Heat",
                "runtime": 170,
                "genres": [{"id": 80, "name": "Crime"}, {"id": 18, "name": " Drama "}],
                "images": {"backdrops": [{"file_path": "/a.jpg", "width": 1920, "height": 1080, "vote_average": 5.4}]},
                "release_dates": {"results": [
                    {"iso_3166_1": "DE", "release_dates": [{"certification": "16"}]},
                    {"iso_3166_1": "US", "release_dates": [{"certification": ""}, {"certification": "R"}]}
                ]},
                "external_ids": {"imdb_id": "tt0113277", "tvdb_id": null}
            }"#,
        )
        .expect("detail should parse");

        assert_eq!(detail.display_title(), Some("Heat"));
        assert_eq!(detail.runtime_minutes(), Some(170));
        assert_eq!(detail.genre_names(), vec!["Crime", "Drama"]);
        assert_eq!(detail.certification("us").as_deref(), Some("R"));
        assert_eq!(detail.backdrops().len(), 1);
    }

    #[test]
    fn test_show_detail_uses_name_and_episode_runtime() {
        let detail: ProviderDetail = serde_json::from_str(
            r#"{
                "id": 1396,
                "name": "Breaking Bad",
                "episode_run_time": [0, 47],
                "genres": null,
                "content_ratings": {"results": [{"iso_3166_1": "US", "rating": "TV-MA"}]}
            }"#,
        )
        .expect("detail should parse");

        assert_eq!(detail.display_title(), Some("Breaking Bad"));
        assert_eq!(detail.runtime_minutes(), Some(47));
        assert!(detail.genre_names().is_empty());
        assert_eq!(detail.certification("US").as_deref(), Some("TV-MA"));
    }
}
