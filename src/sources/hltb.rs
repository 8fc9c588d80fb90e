use crate::model::seconds_to_hours;
use crate::sources::{EstimateSource, FetchError, FetchResult, RateGate};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const HLTB_BASE: &str = "https://howlongtobeat.com";

/// Base inter-request delay; grows linearly with consecutive failures.
const HLTB_DELAY: Duration = Duration::from_millis(2000);

/// Force a token recapture after this many consecutive failures.
const REAUTH_AFTER: u32 = 3;

/// Give up on the estimate layer for the rest of the run at this many
/// consecutive failures.
const FAILURE_CEILING: u32 = 8;

#[derive(Debug, Error)]
pub enum AuthCaptureError {
    #[error("token capture timed out")]
    Timeout,
    #[error("token capture failed: {0}")]
    Failed(String),
}

/// Obtains the session token the estimate site requires. The pipeline
/// never learns how the token is produced; the upstream tool drove a real
/// browser for this, which here lives behind [`CommandTokenProvider`].
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn capture(&self) -> Result<String, AuthCaptureError>;
}

/// Token handed in directly (env var or config).
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn capture(&self) -> Result<String, AuthCaptureError> {
        Ok(self.token.clone())
    }
}

/// Runs an external helper command and reads the captured token from its
/// stdout, under a fixed ceiling. The helper is where any browser
/// automation lives.
pub struct CommandTokenProvider {
    command: String,
    ceiling: Duration,
}

impl CommandTokenProvider {
    pub fn new(command: impl Into<String>, ceiling: Duration) -> Self {
        Self {
            command: command.into(),
            ceiling,
        }
    }
}

#[async_trait]
impl AuthTokenProvider for CommandTokenProvider {
    async fn capture(&self) -> Result<String, AuthCaptureError> {
        let fut = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output();
        let output = tokio::time::timeout(self.ceiling, fut)
            .await
            .map_err(|_| AuthCaptureError::Timeout)?
            .map_err(|e| AuthCaptureError::Failed(e.to_string()))?;
        if !output.status.success() {
            return Err(AuthCaptureError::Failed(format!(
                "helper exited with {}",
                output.status
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AuthCaptureError::Failed("helper produced no token".into()));
        }
        Ok(token)
    }
}

/// One matched row from the estimate site, durations already reduced to
/// whole hours.
#[derive(Debug, Clone, PartialEq)]
pub struct GameEstimate {
    pub matched_name: String,
    pub hours_main: Option<i64>,
    pub hours_main_extra: Option<i64>,
    pub hours_completionist: Option<i64>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResp {
    #[serde(default)]
    data: Vec<SearchRow>,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    #[serde(default)]
    game_id: Option<i64>,
    game_name: String,
    #[serde(default)]
    comp_main: i64,
    #[serde(default)]
    comp_plus: i64,
    #[serde(default)]
    comp_100: i64,
}

/// Time-to-beat search client (the estimate layer source).
///
/// Tracks consecutive failures: the inter-request delay escalates
/// linearly with them, the session token is recaptured every
/// `REAUTH_AFTER` of them, and `is_exhausted` flips once the hard
/// ceiling is reached so the pipeline can abort the layer.
pub struct HltbClient {
    http: Client,
    base_url: String,
    gate: RateGate,
    tokens: Box<dyn AuthTokenProvider>,
    token: Option<String>,
    consecutive_failures: u32,
}

impl HltbClient {
    pub fn new(tokens: Box<dyn AuthTokenProvider>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("backlog-sync/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: HLTB_BASE.to_string(),
            gate: RateGate::new(HLTB_DELAY),
            tokens,
            token: None,
            consecutive_failures: 0,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// True once the consecutive-failure ceiling has been hit; the caller
    /// should abandon the estimate layer for this run (everything already
    /// gathered stays valid).
    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures >= FAILURE_CEILING
    }

    /// Search the estimate site for `name` and return the top match, or
    /// `None` when the site has never heard of it (soft no-data).
    pub async fn search(&mut self, name: &str) -> FetchResult<Option<GameEstimate>> {
        if self.is_exhausted() {
            return Err(FetchError::Transient("estimate source exhausted".into()));
        }
        let token = match self.token.clone() {
            Some(token) => token,
            None => match self.tokens.capture().await {
                Ok(token) => {
                    info!("estimate source session token captured");
                    self.token = Some(token.clone());
                    token
                }
                Err(err) => {
                    self.note_failure();
                    return Err(FetchError::Transient(err.to_string()));
                }
            },
        };

        self.gate.wait().await;
        if self.consecutive_failures > 0 {
            // Linear escalation on top of the base gate.
            tokio::time::sleep(HLTB_DELAY * self.consecutive_failures).await;
        }

        let url = format!("{}/api/search/{}", self.base_url, token);
        let terms: Vec<&str> = name.split_whitespace().collect();
        let body = json!({
            "searchType": "games",
            "searchTerms": terms,
            "searchPage": 1,
            "size": 10,
        });
        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.note_failure();
                return Err(FetchError::Transient(err.to_string()));
            }
        };
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            // Session token expired; recapture on the next call.
            warn!(%status, "estimate source rejected the session token");
            self.token = None;
            self.note_failure();
            return Err(FetchError::Transient("session token rejected".into()));
        }
        if !status.is_success() {
            self.note_failure();
            return Err(FetchError::Transient(format!("http status {status}")));
        }
        let parsed: SearchResp = match resp.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                self.note_failure();
                return Err(FetchError::Malformed(err.to_string()));
            }
        };
        self.consecutive_failures = 0;
        Ok(parsed.data.into_iter().next().map(row_to_estimate))
    }

    fn note_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures % REAUTH_AFTER == 0 {
            self.token = None;
        }
        if self.is_exhausted() {
            warn!(
                failures = self.consecutive_failures,
                "estimate source failure ceiling reached; layer will be abandoned"
            );
        }
    }
}

#[async_trait]
impl EstimateSource for HltbClient {
    async fn estimate_for(&mut self, name: &str) -> FetchResult<Option<GameEstimate>> {
        self.search(name).await
    }

    fn is_exhausted(&self) -> bool {
        HltbClient::is_exhausted(self)
    }
}

fn row_to_estimate(row: SearchRow) -> GameEstimate {
    let hours = |secs: i64| {
        if secs > 0 {
            Some(seconds_to_hours(secs))
        } else {
            None
        }
    };
    GameEstimate {
        hours_main: hours(row.comp_main),
        hours_main_extra: hours(row.comp_plus),
        hours_completionist: hours(row.comp_100),
        url: row
            .game_id
            .map(|id| format!("https://howlongtobeat.com/game/{id}")),
        matched_name: row.game_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::from_value;

    #[test]
    fn rows_reduce_to_whole_hours() {
        let row: SearchRow = from_value(json!({
            "game_id": 10270,
            "game_name": "The Witness",
            "comp_main": 7199,
            "comp_plus": 63000,
            "comp_100": 0
        }))
        .unwrap();
        let est = row_to_estimate(row);
        assert_eq!(est.hours_main, Some(2));
        assert_eq!(est.hours_main_extra, Some(18)); // 17.5 rounds to even
        assert_eq!(est.hours_completionist, None);
        assert_eq!(est.url.as_deref(), Some("https://howlongtobeat.com/game/10270"));
    }

    #[tokio::test]
    async fn command_provider_reads_stdout() {
        let provider =
            CommandTokenProvider::new("echo '  tok-123  '", Duration::from_secs(5));
        assert_eq!(provider.capture().await.unwrap(), "tok-123");
    }

    #[tokio::test]
    async fn command_provider_times_out() {
        let provider = CommandTokenProvider::new("sleep 10", Duration::from_millis(50));
        assert!(matches!(
            provider.capture().await,
            Err(AuthCaptureError::Timeout)
        ));
    }

    #[tokio::test]
    async fn command_provider_rejects_empty_output() {
        let provider = CommandTokenProvider::new("true", Duration::from_secs(5));
        assert!(matches!(
            provider.capture().await,
            Err(AuthCaptureError::Failed(_))
        ));
    }
}
