use crate::model::{release_epoch, GameRecord, OwnedGame};
use crate::sources::{
    get_json_with_backoff, FetchError, FetchResult, IdentitySource, OwnershipSource, RateGate,
};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const WEB_API_BASE: &str = "https://api.steampowered.com";
const STORE_API_BASE: &str = "https://store.steampowered.com";

/// Inter-request delay for the storefront appdetails endpoint. Empirical;
/// the endpoint throttles hard at roughly 200 requests per 5 minutes.
const STORE_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Deserialize)]
struct OwnedGamesResp {
    response: Option<OwnedGamesBody>,
}

#[derive(Debug, Default, Deserialize)]
struct OwnedGamesBody {
    #[serde(default)]
    games: Option<Vec<OwnedGameEntry>>,
}

#[derive(Debug, Deserialize)]
struct OwnedGameEntry {
    appid: i64,
    #[serde(default)]
    playtime_forever: i64,
    #[serde(default)]
    rtime_last_played: Option<i64>,
}

/// Steam Web API client for the per-account owned-games list.
pub struct SteamWebClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl SteamWebClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("backlog-sync/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: WEB_API_BASE.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch the owned-games list for one account. An account with no
    /// (visible) games is an empty list, not an error; a response without
    /// the expected envelope is malformed.
    pub async fn owned_games(
        &self,
        steam_id: &str,
        primary_account: bool,
    ) -> FetchResult<Vec<OwnedGame>> {
        let url = format!("{}/IPlayerService/GetOwnedGames/v1/", self.base_url);
        let body = get_json_with_backoff(
            &self.http,
            &url,
            &[
                ("key", self.api_key.as_str()),
                ("steamid", steam_id),
                ("include_played_free_games", "1"),
                ("format", "json"),
            ],
        )
        .await?;
        let parsed: OwnedGamesResp = serde_json::from_value(body)
            .map_err(|e| FetchError::Malformed(format!("owned games payload: {e}")))?;
        let Some(resp) = parsed.response else {
            return Err(FetchError::Malformed("missing response envelope".into()));
        };
        let entries = resp.games.unwrap_or_default();
        debug!(steam_id, count = entries.len(), "owned games fetched");
        let owned = entries
            .into_iter()
            .map(|e| OwnedGame {
                appid: e.appid,
                owner_steam_id: steam_id.to_string(),
                hours_played: (e.playtime_forever as f64 / 60.0 * 10.0).round() / 10.0,
                last_played_at: e.rtime_last_played.filter(|t| *t > 0),
                primary_account,
            })
            .collect();
        Ok(owned)
    }
}

#[async_trait]
impl OwnershipSource for SteamWebClient {
    async fn owned_games(
        &mut self,
        steam_id: &str,
        primary_account: bool,
    ) -> FetchResult<Vec<OwnedGame>> {
        SteamWebClient::owned_games(self, steam_id, primary_account).await
    }
}

#[derive(Debug, Deserialize)]
struct AppDetailsWrapper {
    success: bool,
    data: Option<AppData>,
}

#[derive(Debug, Default, Deserialize)]
struct AppData {
    name: Option<String>,
    #[serde(default)]
    detailed_description: Option<String>,
    #[serde(default)]
    about_the_game: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    header_image: Option<String>,
    #[serde(default)]
    screenshots: Option<Vec<Screenshot>>,
    #[serde(default)]
    movies: Option<Vec<Movie>>,
    #[serde(default)]
    developers: Option<Vec<String>>,
    #[serde(default)]
    publishers: Option<Vec<String>>,
    #[serde(default)]
    categories: Option<Vec<DescEntry>>,
    #[serde(default)]
    genres: Option<Vec<DescEntry>>,
    #[serde(default)]
    metacritic: Option<Metacritic>,
    #[serde(default)]
    release_date: Option<ReleaseDate>,
}

#[derive(Debug, Deserialize)]
struct Screenshot {
    #[serde(default)]
    path_full: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Movie {
    #[serde(default)]
    mp4: Option<MovieFormats>,
    #[serde(default)]
    webm: Option<MovieFormats>,
}

#[derive(Debug, Deserialize)]
struct MovieFormats {
    #[serde(default)]
    max: Option<String>,
    #[serde(rename = "480", default)]
    sd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescEntry {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metacritic {
    score: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDate {
    #[serde(default)]
    date: Option<String>,
}

/// Storefront appdetails client: the identity/catalog layer source.
pub struct SteamStoreClient {
    http: Client,
    base_url: String,
    gate: RateGate,
}

impl SteamStoreClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent("backlog-sync/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: STORE_API_BASE.to_string(),
            gate: RateGate::new(STORE_DELAY),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch the identity layer for one app. A structured `success: false`
    /// means the app is gone from the storefront (delisted) and maps to
    /// `NotFound`; HTTP 429 surfaces as `RateLimited` once the shared
    /// backoff ladder is exhausted.
    pub async fn app_details(&mut self, appid: i64, language: &str) -> FetchResult<GameRecord> {
        self.gate.wait().await;
        let url = format!("{}/api/appdetails", self.base_url);
        let id = appid.to_string();
        let body = get_json_with_backoff(
            &self.http,
            &url,
            &[("appids", id.as_str()), ("l", language)],
        )
        .await?;
        let entry = body
            .get(&id)
            .cloned()
            .ok_or_else(|| FetchError::Malformed(format!("no entry for appid {appid}")))?;
        let wrapper: AppDetailsWrapper = serde_json::from_value(entry)
            .map_err(|e| FetchError::Malformed(format!("appdetails payload: {e}")))?;
        if !wrapper.success {
            return Err(FetchError::NotFound);
        }
        let data = wrapper.data.unwrap_or_default();
        Ok(record_from_app_data(appid, data))
    }
}

#[async_trait]
impl IdentitySource for SteamStoreClient {
    async fn app_details(&mut self, appid: i64, language: &str) -> FetchResult<GameRecord> {
        SteamStoreClient::app_details(self, appid, language).await
    }
}

fn record_from_app_data(appid: i64, data: AppData) -> GameRecord {
    let release_date = data.release_date.and_then(|r| r.date).filter(|d| !d.is_empty());
    GameRecord {
        appid,
        name: data.name.unwrap_or_else(|| appid.to_string()),
        detailed_description: data.detailed_description,
        about_the_game: data.about_the_game,
        short_description: data.short_description,
        header_image: data.header_image,
        screenshots: data
            .screenshots
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| s.path_full)
            .collect(),
        movies: data
            .movies
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let mp4 = m.mp4.and_then(|f| f.max.or(f.sd));
                mp4.or_else(|| m.webm.and_then(|f| f.max.or(f.sd)))
            })
            .collect(),
        developers: data.developers.unwrap_or_default(),
        publishers: data.publishers.unwrap_or_default(),
        categories: data
            .categories
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.description)
            .collect(),
        genres: data
            .genres
            .unwrap_or_default()
            .into_iter()
            .filter_map(|g| g.description)
            .collect(),
        metacritic_score: data.metacritic.and_then(|m| m.score),
        release_epoch: release_date.as_deref().and_then(release_epoch),
        release_date,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_record_from_full_payload() {
        let data: AppData = serde_json::from_value(json!({
            "name": "Half-Life 2",
            "short_description": "Gordon returns.",
            "header_image": "https://cdn.example/hl2/header.jpg",
            "screenshots": [{"id": 0, "path_full": "https://cdn.example/hl2/ss1.jpg"}],
            "movies": [{"mp4": {"480": "sd.mp4", "max": "max.mp4"}}],
            "developers": ["Valve"],
            "publishers": ["Valve"],
            "categories": [{"id": 2, "description": "Single-player"}],
            "genres": [{"id": "1", "description": "Action"}],
            "metacritic": {"score": 96},
            "release_date": {"coming_soon": false, "date": "16 Nov, 2004"}
        }))
        .unwrap();
        let rec = record_from_app_data(220, data);
        assert_eq!(rec.name, "Half-Life 2");
        assert_eq!(rec.movies, vec!["max.mp4"]);
        assert_eq!(rec.genres, vec!["Action"]);
        assert_eq!(rec.metacritic_score, Some(96));
        assert!(rec.release_epoch.is_some());
        assert!(rec.stats_updated_at.is_none());
    }

    #[test]
    fn sparse_payload_still_yields_a_record() {
        let rec = record_from_app_data(999, AppData::default());
        assert_eq!(rec.name, "999");
        assert!(rec.screenshots.is_empty());
        assert_eq!(rec.release_epoch, None);
    }

    #[test]
    fn success_false_is_delisting() {
        let wrapper: AppDetailsWrapper =
            serde_json::from_value(json!({"success": false})).unwrap();
        assert!(!wrapper.success);
        assert!(wrapper.data.is_none());
    }
}
