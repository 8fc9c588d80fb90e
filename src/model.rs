use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Ownership row for one app on one account, rebuilt fresh every run.
///
/// `primary_account` marks the account whose personal fields (hours,
/// last-played) win when several tracked accounts own the same app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnedGame {
    pub appid: i64,
    pub owner_steam_id: String,
    pub hours_played: f64,
    #[serde(default)]
    pub last_played_at: Option<i64>,
    #[serde(default)]
    pub primary_account: bool,
}

/// Weighted community tag from the statistics source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagWeight {
    pub name: String,
    pub score: i64,
}

/// The durable cached unit, keyed by `appid`.
///
/// Fields accumulate in layers: identity/catalog first, then statistics,
/// then time-to-beat estimates. A `None` layer timestamp means that layer
/// has never run for this app, not that it failed. The `owned` field is
/// per-run only and is stripped before every cache write.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GameRecord {
    pub appid: i64,

    // identity / catalog layer
    pub name: String,
    #[serde(default)]
    pub detailed_description: Option<String>,
    #[serde(default)]
    pub about_the_game: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub header_image: Option<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub movies: Vec<String>,
    #[serde(default)]
    pub developers: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub metacritic_score: Option<i64>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub release_epoch: Option<i64>,

    // statistics layer
    #[serde(default)]
    pub reviews_total: Option<i64>,
    #[serde(default)]
    pub reviews_positive: Option<i64>,
    #[serde(default)]
    pub reviews_negative: Option<i64>,
    #[serde(default)]
    pub review_category: Option<String>,
    #[serde(default)]
    pub playtime_avg_forever: Option<i64>,
    #[serde(default)]
    pub playtime_median_forever: Option<i64>,
    #[serde(default)]
    pub playtime_avg_recent: Option<i64>,
    #[serde(default)]
    pub playtime_median_recent: Option<i64>,
    #[serde(default)]
    pub tags: Vec<TagWeight>,
    #[serde(default)]
    pub stats_updated_at: Option<i64>,

    // estimate layer
    #[serde(default)]
    pub hltb_name: Option<String>,
    #[serde(default)]
    pub hours_main: Option<i64>,
    #[serde(default)]
    pub hours_main_extra: Option<i64>,
    #[serde(default)]
    pub hours_completionist: Option<i64>,
    #[serde(default)]
    pub hltb_url: Option<String>,
    #[serde(default)]
    pub estimate_updated_at: Option<i64>,

    // per-run layer, never persisted
    #[serde(skip)]
    pub owned: Option<OwnedGame>,
}

impl GameRecord {
    /// True when the record came from (or went through) the primary account.
    pub fn from_primary(&self) -> bool {
        self.owned.as_ref().map(|o| o.primary_account).unwrap_or(false)
    }

    /// Drop the per-run ownership view before a cache write.
    pub fn strip_transient(&mut self) {
        self.owned = None;
    }
}

/// Convert a duration in seconds to whole hours, rounding half to even.
pub fn seconds_to_hours(seconds: i64) -> i64 {
    (seconds as f64 / 3600.0).round_ties_even() as i64
}

/// Qualitative review category from positive/negative counts.
///
/// Below 10 total reviews there is no category at all. The negative side
/// mirrors the positive one at the 50 and 500 count thresholds.
pub fn review_category(positive: i64, negative: i64) -> Option<&'static str> {
    let total = positive + negative;
    if total < 10 {
        return None;
    }
    let ratio = positive as f64 / total as f64;
    let label = if ratio >= 0.95 && total >= 500 {
        "Overwhelmingly Positive"
    } else if ratio >= 0.80 {
        if total >= 50 {
            "Very Positive"
        } else {
            "Positive"
        }
    } else if ratio >= 0.70 {
        "Mostly Positive"
    } else if ratio >= 0.40 {
        "Mixed"
    } else if ratio >= 0.20 {
        "Mostly Negative"
    } else if total >= 500 {
        "Overwhelmingly Negative"
    } else if total >= 50 {
        "Very Negative"
    } else {
        "Negative"
    };
    Some(label)
}

/// Parse a storefront release-date string into epoch seconds (UTC midnight).
/// The storefront emits either "12 Nov, 2019" or "Nov 12, 2019" depending on
/// the request locale; unparsable strings (e.g. "Coming soon") yield None.
pub fn release_epoch(date: &str) -> Option<i64> {
    let trimmed = date.trim();
    if trimmed.is_empty() {
        return None;
    }
    for fmt in ["%d %b, %Y", "%b %d, %Y", "%Y-%m-%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
        }
    }
    None
}
