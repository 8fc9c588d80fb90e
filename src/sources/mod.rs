//! Catalog source adapters and the failure taxonomy they share.
//!
//! Every adapter classifies its failures into [`FetchError`] so the
//! pipeline can decide per item: rate-limited and transient failures are
//! skipped and retried on a later run, not-found is affirmative delisting
//! (denylisted), malformed payloads fail closed instead of panicking.

pub mod hltb;
pub mod steam;
pub mod steamspy;

use crate::model::{GameRecord, OwnedGame};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by source")]
    RateLimited,
    #[error("item not found or delisted at source")]
    NotFound,
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Per-account owned-games list source.
#[async_trait]
pub trait OwnershipSource: Send {
    async fn owned_games(
        &mut self,
        steam_id: &str,
        primary_account: bool,
    ) -> FetchResult<Vec<OwnedGame>>;
}

/// Identity/catalog layer source, keyed by appid.
#[async_trait]
pub trait IdentitySource: Send {
    async fn app_details(&mut self, appid: i64, language: &str) -> FetchResult<GameRecord>;
}

/// Statistics layer source. `Ok(None)` is soft no-data.
#[async_trait]
pub trait StatsSource: Send {
    async fn app_stats(&mut self, appid: i64) -> FetchResult<Option<steamspy::AppStats>>;
}

/// Estimate layer source, queried by title. `Ok(None)` is soft no-data;
/// `is_exhausted` tells the pipeline to abandon the layer for this run.
#[async_trait]
pub trait EstimateSource: Send {
    async fn estimate_for(&mut self, name: &str) -> FetchResult<Option<hltb::GameEstimate>>;

    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Fixed inter-request delay, applied before each request rather than
/// adaptively. The empirical per-source delays keep us under undocumented
/// limits; wall-clock speed is deliberately sacrificed for that.
pub struct RateGate {
    delay: Duration,
    last: Option<Instant>,
}

impl RateGate {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    /// Sleep out whatever remains of the inter-request window.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

/// GET a JSON document with a short 429 backoff ladder. `Retry-After` is
/// honored when it asks for more than the ladder step. Exhausting the
/// ladder surfaces as `RateLimited`; everything else maps onto the
/// taxonomy above.
pub async fn get_json_with_backoff(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> FetchResult<Value> {
    let delays = [5u64, 10, 15, 20];
    let mut attempt: usize = 0;
    loop {
        let mut req = client.get(url).header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(&query);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            if attempt >= delays.len() {
                return Err(FetchError::RateLimited);
            }
            let mut sleep_secs = delays[attempt];
            if let Some(retry_after) = resp
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
            {
                if retry_after > sleep_secs {
                    sleep_secs = retry_after;
                }
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
            continue;
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("http status {}", status)));
        }
        return resp
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()));
    }
}

/// Progress log cadence: every item for small batches, every 10th for
/// hundreds, every 100th for thousands.
pub fn progress_interval(total: usize) -> usize {
    let mut interval = 1usize;
    let mut scale = total / 10;
    while scale >= 10 {
        interval *= 10;
        scale /= 10;
    }
    interval.max(1)
}
