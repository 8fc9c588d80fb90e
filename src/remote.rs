//! Remote collection sink: build an appid -> internal-id index by paging
//! the store, then create-or-update every reconciled record. Any single
//! write failure aborts the whole batch; one failure usually means auth
//! or schema drift and would repeat for every remaining record.

use crate::model::GameRecord;
use crate::sources::progress_interval;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const PAGE_SIZE: usize = 100;

/// Safety bound against a store that keeps handing back full pages.
const MAX_PAGES: usize = 1000;

/// One row of the remote collection, as much of it as the sink needs.
/// The internal id is the store's own opaque key; the appid lives in a
/// plain field and is never assumed equal to it.
#[derive(Debug, Clone)]
pub struct RemoteRow {
    pub internal_id: String,
    pub appid: Option<i64>,
}

/// Minimal capability surface of the remote record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<RemoteRow>>;
    async fn create(&self, fields: &Value) -> Result<()>;
    async fn update(&self, internal_id: &str, fields: &Value) -> Result<()>;
}

/// Upsert the full record set. Fatal on the first write failure.
pub async fn upsert_all(store: &dyn RecordStore, records: &[GameRecord]) -> Result<()> {
    let index = build_index(store).await?;
    info!(
        remote_rows = index.len(),
        records = records.len(),
        "remote upsert starting"
    );
    let interval = progress_interval(records.len());
    let mut created = 0usize;
    let mut updated = 0usize;
    for (idx, rec) in records.iter().enumerate() {
        if idx % interval == 0 && idx > 0 {
            info!(done = idx, total = records.len(), "remote upsert progress");
        }
        let fields = project_fields(rec);
        match index.get(&rec.appid) {
            Some(internal_id) => {
                store
                    .update(internal_id, &fields)
                    .await
                    .with_context(|| format!("updating remote record for appid {}", rec.appid))?;
                updated += 1;
            }
            None => {
                store
                    .create(&fields)
                    .await
                    .with_context(|| format!("creating remote record for appid {}", rec.appid))?;
                created += 1;
            }
        }
    }
    info!(created, updated, "remote upsert complete");
    Ok(())
}

async fn build_index(store: &dyn RecordStore) -> Result<HashMap<i64, String>> {
    let mut index: HashMap<i64, String> = HashMap::new();
    let mut offset = 0usize;
    for page_no in 0.. {
        if page_no >= MAX_PAGES {
            warn!(
                pages = MAX_PAGES,
                "remote store page cap reached; index may be incomplete"
            );
            break;
        }
        let rows = store
            .page(offset, PAGE_SIZE)
            .await
            .with_context(|| format!("paging remote store at offset {offset}"))?;
        let row_count = rows.len();
        for row in rows {
            if let Some(appid) = row.appid {
                index.insert(appid, row.internal_id);
            }
        }
        if row_count < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }
    Ok(index)
}

/// Fixed projection into the remote schema. Source values always
/// overwrite remote values; the per-run ownership fields ride along only
/// when they came from the primary account.
fn project_fields(rec: &GameRecord) -> Value {
    let mut fields = json!({
        "appid": rec.appid,
        "name": rec.name,
        "short_description": rec.short_description,
        "header_image": rec.header_image,
        "screenshots": rec.screenshots,
        "movies": rec.movies,
        "developers": rec.developers,
        "publishers": rec.publishers,
        "categories": rec.categories,
        "genres": rec.genres,
        "metacritic_score": rec.metacritic_score,
        "release_date": rec.release_date,
        "release_epoch": rec.release_epoch,
        "reviews_total": rec.reviews_total,
        "reviews_positive": rec.reviews_positive,
        "reviews_negative": rec.reviews_negative,
        "review_category": rec.review_category,
        "playtime_avg_forever": rec.playtime_avg_forever,
        "playtime_median_forever": rec.playtime_median_forever,
        "tags": rec.tags.iter().map(|t| json!({"name": t.name, "score": t.score})).collect::<Vec<_>>(),
        "hltb_name": rec.hltb_name,
        "hours_main": rec.hours_main,
        "hours_main_extra": rec.hours_main_extra,
        "hours_completionist": rec.hours_completionist,
        "hltb_url": rec.hltb_url,
    });
    if let Some(owned) = rec.owned.as_ref().filter(|o| o.primary_account) {
        fields["hours_played"] = json!(owned.hours_played);
        fields["last_played_at"] = json!(owned.last_played_at);
    }
    fields
}

#[derive(Debug, Deserialize)]
struct PageResp {
    #[serde(default)]
    records: Vec<PageRecord>,
}

#[derive(Debug, Deserialize)]
struct PageRecord {
    id: String,
    #[serde(default)]
    fields: Value,
}

/// HTTP implementation against the remote collection API.
pub struct HttpRecordStore {
    http: Client,
    base_url: String,
    token: String,
    collection: String,
}

impl HttpRecordStore {
    pub fn new(base_url: &str, token: &str, collection: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent("backlog-sync/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            collection: collection.to_string(),
        })
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<RemoteRow>> {
        let url = format!(
            "{}/collections/{}/records",
            self.base_url, self.collection
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .send()
            .await?
            .error_for_status()?;
        let page: PageResp = resp.json().await?;
        Ok(page
            .records
            .into_iter()
            .map(|r| RemoteRow {
                appid: r.fields.get("appid").and_then(Value::as_i64),
                internal_id: r.id,
            })
            .collect())
    }

    async fn create(&self, fields: &Value) -> Result<()> {
        let url = format!(
            "{}/collections/{}/records",
            self.base_url, self.collection
        );
        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update(&self, internal_id: &str, fields: &Value) -> Result<()> {
        let url = format!("{}/records/{}", self.base_url, internal_id);
        self.http
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnedGame;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        rows: Vec<RemoteRow>,
        ops: Mutex<Vec<String>>,
        fail_on_op: Option<usize>,
    }

    impl FakeStore {
        fn note(&self, op: String) -> Result<()> {
            let mut ops = self.ops.lock().unwrap();
            ops.push(op);
            if self.fail_on_op == Some(ops.len()) {
                return Err(anyhow!("simulated write failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordStore for FakeStore {
        async fn page(&self, offset: usize, limit: usize) -> Result<Vec<RemoteRow>> {
            Ok(self
                .rows
                .iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn create(&self, fields: &Value) -> Result<()> {
            self.note(format!("create:{}", fields["appid"]))
        }

        async fn update(&self, internal_id: &str, fields: &Value) -> Result<()> {
            self.note(format!("update:{}:{}", internal_id, fields["appid"]))
        }
    }

    fn rec(appid: i64, name: &str) -> GameRecord {
        GameRecord {
            appid,
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn existing_appid_updates_by_internal_id() {
        let store = FakeStore {
            rows: vec![RemoteRow {
                internal_id: "rec_abc".into(),
                appid: Some(10),
            }],
            ..Default::default()
        };
        upsert_all(&store, &[rec(10, "Ten"), rec(20, "Twenty")])
            .await
            .unwrap();
        let ops = store.ops.lock().unwrap();
        assert_eq!(*ops, vec!["update:rec_abc:10", "create:20"]);
    }

    #[tokio::test]
    async fn write_failure_aborts_the_remaining_batch() {
        let store = FakeStore {
            fail_on_op: Some(3),
            ..Default::default()
        };
        let records: Vec<GameRecord> =
            (1..=5).map(|i| rec(i, &format!("Game {i}"))).collect();
        let err = upsert_all(&store, &records).await.unwrap_err();
        assert!(err.to_string().contains("appid 3"));
        // Records 4 and 5 were never attempted.
        assert_eq!(store.ops.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn index_pages_past_the_first_page() {
        let rows: Vec<RemoteRow> = (0..150)
            .map(|i| RemoteRow {
                internal_id: format!("rec_{i}"),
                appid: Some(i),
            })
            .collect();
        let store = FakeStore {
            rows,
            ..Default::default()
        };
        upsert_all(&store, &[rec(149, "Last")]).await.unwrap();
        assert_eq!(*store.ops.lock().unwrap(), vec!["update:rec_149:149"]);
    }

    #[test]
    fn ownership_fields_ride_along_only_for_the_primary_account() {
        let mut r = rec(10, "Ten");
        r.owned = Some(OwnedGame {
            appid: 10,
            owner_steam_id: "x".into(),
            hours_played: 4.5,
            last_played_at: Some(1_700_000_000),
            primary_account: false,
        });
        assert!(project_fields(&r).get("hours_played").is_none());

        r.owned.as_mut().unwrap().primary_account = true;
        let fields = project_fields(&r);
        assert_eq!(fields["hours_played"], json!(4.5));
        assert_eq!(fields["last_played_at"], json!(1_700_000_000));
    }
}
