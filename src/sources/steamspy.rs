use crate::model::TagWeight;
use crate::sources::{get_json_with_backoff, FetchResult, RateGate, StatsSource};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const STEAMSPY_BASE: &str = "https://steamspy.com";

/// SteamSpy asks for at most one request per second against the
/// appdetails endpoint.
const SPY_DELAY: Duration = Duration::from_millis(1000);

/// Aggregate community statistics for one app, as far as the source
/// actually has them.
#[derive(Debug, Clone, PartialEq)]
pub struct AppStats {
    pub positive: i64,
    pub negative: i64,
    pub average_forever: i64,
    pub median_forever: i64,
    pub average_recent: i64,
    pub median_recent: i64,
    pub tags: Vec<TagWeight>,
}

/// Community statistics client (the statistics layer source).
pub struct SteamSpyClient {
    http: Client,
    base_url: String,
    gate: RateGate,
}

impl SteamSpyClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent("backlog-sync/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: STEAMSPY_BASE.to_string(),
            gate: RateGate::new(SPY_DELAY),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch statistics for one app. SteamSpy answers unknown apps with a
    /// husk payload rather than an error status, so a missing `name` (or
    /// missing review counts) is soft no-data, not a failure.
    pub async fn app_stats(&mut self, appid: i64) -> FetchResult<Option<AppStats>> {
        self.gate.wait().await;
        let url = format!("{}/api.php", self.base_url);
        let id = appid.to_string();
        let body = get_json_with_backoff(
            &self.http,
            &url,
            &[("request", "appdetails"), ("appid", id.as_str())],
        )
        .await?;
        Ok(parse_stats(&body))
    }
}

#[async_trait]
impl StatsSource for SteamSpyClient {
    async fn app_stats(&mut self, appid: i64) -> FetchResult<Option<AppStats>> {
        SteamSpyClient::app_stats(self, appid).await
    }
}

fn parse_stats(body: &Value) -> Option<AppStats> {
    let name = body.get("name").and_then(|v| v.as_str());
    if name.map(|n| n.trim().is_empty()).unwrap_or(true) {
        return None;
    }
    let positive = body.get("positive").and_then(Value::as_i64)?;
    let negative = body.get("negative").and_then(Value::as_i64)?;
    let int = |key: &str| body.get(key).and_then(Value::as_i64).unwrap_or(0);
    Some(AppStats {
        positive,
        negative,
        average_forever: int("average_forever"),
        median_forever: int("median_forever"),
        average_recent: int("average_2weeks"),
        median_recent: int("median_2weeks"),
        tags: parse_tags(body.get("tags")),
    })
}

// Tags arrive as a name->weight object for known apps but as an empty
// array `[]` for apps SteamSpy has never tagged. Both shapes must parse.
fn parse_tags(tags: Option<&Value>) -> Vec<TagWeight> {
    let Some(Value::Object(map)) = tags else {
        return Vec::new();
    };
    let mut out: Vec<TagWeight> = map
        .iter()
        .filter_map(|(name, score)| {
            score.as_i64().map(|score| TagWeight {
                name: name.clone(),
                score,
            })
        })
        .collect();
    out.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.name.cmp(&b.name)));
    out
}
