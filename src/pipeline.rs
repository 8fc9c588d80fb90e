//! The reconciliation pipeline: per account, per owned app, cache lookup,
//! denylist short-circuit, rate-limited adapter calls, and incremental
//! cache persistence at every layer boundary so an interrupted run loses
//! as little as possible.
//!
//! Everything is sequential on purpose: the sources are rate-limited by
//! undocumented rules, and wall-clock speed is the thing we trade away.

use crate::cache::CacheStore;
use crate::matching::NameMatcher;
use crate::model::{review_category, GameRecord, OwnedGame};
use crate::sources::{
    progress_interval, EstimateSource, FetchError, IdentitySource, OwnershipSource, StatsSource,
};
use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{info, warn};

/// One account to sync. The primary account's personal fields win when
/// several accounts own the same app.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub steam_id: String,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub use_cache: bool,
    pub language: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            language: "english".to_string(),
        }
    }
}

pub struct Pipeline<'a> {
    ownership: &'a mut dyn OwnershipSource,
    identity: &'a mut dyn IdentitySource,
    stats: &'a mut dyn StatsSource,
    estimates: &'a mut dyn EstimateSource,
    matcher: &'a dyn NameMatcher,
    cache: &'a CacheStore,
    opts: SyncOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ownership: &'a mut dyn OwnershipSource,
        identity: &'a mut dyn IdentitySource,
        stats: &'a mut dyn StatsSource,
        estimates: &'a mut dyn EstimateSource,
        matcher: &'a dyn NameMatcher,
        cache: &'a CacheStore,
        opts: SyncOptions,
    ) -> Self {
        Self {
            ownership,
            identity,
            stats,
            estimates,
            matcher,
            cache,
            opts,
        }
    }

    /// Run the full reconciliation for all accounts and return the merged,
    /// appid-sorted record set ready for the remote sink.
    pub async fn run(&mut self, accounts: &[AccountSpec]) -> Result<Vec<GameRecord>> {
        let mut per_account: Vec<Vec<GameRecord>> = Vec::with_capacity(accounts.len());
        for account in accounts {
            info!(steam_id = %account.steam_id, primary = account.primary, "account sync start");
            let owned = self.owned_list(account).await;
            let mut records = self.identity_pass(account, &owned).await;
            // Crash-safety boundary: everything gathered so far hits disk
            // before the enrichment layers start.
            self.cache.save_records(&records);

            self.stats_pass(&mut records).await;
            self.cache.save_records(&records);

            self.estimate_pass(&mut records).await;
            self.cache.save_records(&records);

            info!(
                steam_id = %account.steam_id,
                records = records.len(),
                "account sync complete"
            );
            per_account.push(records);
        }
        Ok(merge_accounts(per_account))
    }

    /// Owned list for one account: reuse a cached non-empty list when the
    /// cache is enabled, otherwise fetch fresh and cache it. A failed
    /// ownership fetch skips the account rather than aborting the run.
    async fn owned_list(&mut self, account: &AccountSpec) -> Vec<OwnedGame> {
        if self.opts.use_cache {
            let cached = self.cache.load_owned(&account.steam_id);
            if !cached.is_empty() {
                info!(steam_id = %account.steam_id, count = cached.len(), "owned list from cache");
                // Primacy is a per-run property, not a cached one.
                return cached
                    .into_iter()
                    .map(|mut o| {
                        o.primary_account = account.primary;
                        o
                    })
                    .collect();
            }
        }
        match self
            .ownership
            .owned_games(&account.steam_id, account.primary)
            .await
        {
            Ok(list) => {
                info!(steam_id = %account.steam_id, count = list.len(), "owned list fetched");
                self.cache.save_owned(&account.steam_id, &list);
                list
            }
            Err(err) => {
                warn!(steam_id = %account.steam_id, error = %err, "owned list unavailable; skipping account");
                Vec::new()
            }
        }
    }

    /// Identity layer. For each owned app in list order: skip ids already
    /// seen this run, reuse cached records, short-circuit denylisted ids,
    /// then fetch. An affirmative delisting goes on the denylist; any other
    /// failure is logged and skipped without aborting the loop.
    async fn identity_pass(
        &mut self,
        account: &AccountSpec,
        owned: &[OwnedGame],
    ) -> Vec<GameRecord> {
        let cached: HashMap<i64, GameRecord> = if self.opts.use_cache {
            self.cache
                .load_records()
                .into_iter()
                .map(|r| (r.appid, r))
                .collect()
        } else {
            HashMap::new()
        };
        let denylist = self.cache.load_denylist();
        let mut newly_denied: BTreeSet<i64> = BTreeSet::new();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut out: Vec<GameRecord> = Vec::with_capacity(owned.len());
        let mut failed: Vec<i64> = Vec::new();
        let mut denied: Vec<i64> = Vec::new();
        let interval = progress_interval(owned.len());

        for (idx, own) in owned.iter().enumerate() {
            if idx % interval == 0 && idx > 0 {
                info!(
                    steam_id = %account.steam_id,
                    done = idx,
                    total = owned.len(),
                    "identity layer progress"
                );
            }
            // Duplicate ownership rows exist in the wild; first one wins.
            if !seen.insert(own.appid) {
                continue;
            }
            if let Some(rec) = cached.get(&own.appid) {
                let mut rec = rec.clone();
                rec.owned = Some(own.clone());
                out.push(rec);
                continue;
            }
            if denylist.contains(&own.appid) {
                denied.push(own.appid);
                continue;
            }
            match self.identity.app_details(own.appid, &self.opts.language).await {
                Ok(mut rec) => {
                    rec.owned = Some(own.clone());
                    out.push(rec);
                }
                Err(FetchError::NotFound) => {
                    info!(appid = own.appid, "app delisted at source; denylisting");
                    newly_denied.insert(own.appid);
                    failed.push(own.appid);
                }
                Err(err) => {
                    warn!(appid = own.appid, error = %err, "identity fetch failed");
                    failed.push(own.appid);
                }
            }
        }

        if !newly_denied.is_empty() {
            self.cache.save_denylist(&newly_denied);
        }
        layer_summary("identity", out.len(), &failed, &denied);
        out
    }

    /// Statistics layer. Records whose stats timestamp is already present
    /// are skipped when cache use is on; soft no-data still stamps the
    /// timestamp (the layer ran), transient failures do not.
    async fn stats_pass(&mut self, records: &mut [GameRecord]) {
        let mut failed: Vec<i64> = Vec::new();
        let total = records.len();
        let interval = progress_interval(total);
        let mut updated = 0usize;
        for (idx, rec) in records.iter_mut().enumerate() {
            if idx % interval == 0 && idx > 0 {
                info!(done = idx, total, "statistics layer progress");
            }
            if self.opts.use_cache && rec.stats_updated_at.is_some() {
                continue;
            }
            match self.stats.app_stats(rec.appid).await {
                Ok(Some(stats)) => {
                    rec.reviews_positive = Some(stats.positive);
                    rec.reviews_negative = Some(stats.negative);
                    rec.reviews_total = Some(stats.positive + stats.negative);
                    rec.review_category =
                        review_category(stats.positive, stats.negative).map(String::from);
                    rec.playtime_avg_forever = Some(stats.average_forever);
                    rec.playtime_median_forever = Some(stats.median_forever);
                    rec.playtime_avg_recent = Some(stats.average_recent);
                    rec.playtime_median_recent = Some(stats.median_recent);
                    rec.tags = stats.tags;
                    rec.stats_updated_at = Some(Utc::now().timestamp());
                    updated += 1;
                }
                Ok(None) => {
                    rec.stats_updated_at = Some(Utc::now().timestamp());
                }
                Err(err) => {
                    warn!(appid = rec.appid, error = %err, "statistics fetch failed");
                    failed.push(rec.appid);
                }
            }
        }
        info!(updated, "statistics layer done");
        layer_summary("statistics", total - failed.len(), &failed, &[]);
    }

    /// Estimate layer. Same skip rule as statistics; additionally bails out
    /// of the whole layer once the source reports itself exhausted,
    /// keeping everything already gathered. Suspicious name matches are
    /// appended to the mismatch ledger for human review.
    async fn estimate_pass(&mut self, records: &mut [GameRecord]) {
        let mut failed: Vec<i64> = Vec::new();
        let total = records.len();
        let interval = progress_interval(total);
        for (idx, rec) in records.iter_mut().enumerate() {
            if idx % interval == 0 && idx > 0 {
                info!(done = idx, total, "estimate layer progress");
            }
            if self.opts.use_cache && rec.estimate_updated_at.is_some() {
                continue;
            }
            match self.estimates.estimate_for(&rec.name).await {
                Ok(Some(est)) => {
                    if !self.matcher.matches(&rec.name, &est.matched_name) {
                        self.cache
                            .record_mismatch(rec.appid, &rec.name, &est.matched_name);
                    }
                    rec.hltb_name = Some(est.matched_name);
                    rec.hours_main = est.hours_main;
                    rec.hours_main_extra = est.hours_main_extra;
                    rec.hours_completionist = est.hours_completionist;
                    rec.hltb_url = est.url;
                    rec.estimate_updated_at = Some(Utc::now().timestamp());
                }
                Ok(None) => {
                    rec.estimate_updated_at = Some(Utc::now().timestamp());
                }
                Err(err) => {
                    warn!(appid = rec.appid, error = %err, "estimate fetch failed");
                    failed.push(rec.appid);
                    if self.estimates.is_exhausted() {
                        warn!(
                            remaining = total - idx - 1,
                            "estimate source exhausted; abandoning layer for this run"
                        );
                        break;
                    }
                }
            }
        }
        layer_summary("estimate", total - failed.len(), &failed, &[]);
    }
}

fn layer_summary(layer: &str, ok: usize, failed: &[i64], denied: &[i64]) {
    if failed.is_empty() && denied.is_empty() {
        info!(layer, ok, "layer complete");
        return;
    }
    info!(
        layer,
        ok,
        failed = failed.len(),
        denylisted = denied.len(),
        failed_ids = %failed.iter().join(","),
        denylisted_ids = %denied.iter().join(","),
        "layer complete with skips"
    );
}

/// Cross-account merge: insertion-ordered by account, keyed by appid. A
/// record seen through the primary account wins outright; otherwise the
/// later account's record overwrites. Output sorted by appid.
fn merge_accounts(per_account: Vec<Vec<GameRecord>>) -> Vec<GameRecord> {
    let mut merged: IndexMap<i64, GameRecord> = IndexMap::new();
    for records in per_account {
        for rec in records {
            if let Some(existing) = merged.get(&rec.appid) {
                if existing.from_primary() && !rec.from_primary() {
                    continue;
                }
            }
            merged.insert(rec.appid, rec);
        }
    }
    let mut out: Vec<GameRecord> = merged.into_values().collect();
    out.sort_unstable_by_key(|r| r.appid);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::DefaultMatcher;
    use crate::sources::hltb::GameEstimate;
    use crate::sources::steamspy::AppStats;
    use crate::sources::FetchResult;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeOwnership {
        lists: HashMap<String, Vec<OwnedGame>>,
        calls: usize,
    }

    #[async_trait]
    impl OwnershipSource for FakeOwnership {
        async fn owned_games(
            &mut self,
            steam_id: &str,
            primary_account: bool,
        ) -> FetchResult<Vec<OwnedGame>> {
            self.calls += 1;
            let mut list = self.lists.get(steam_id).cloned().unwrap_or_default();
            for o in &mut list {
                o.primary_account = primary_account;
            }
            Ok(list)
        }
    }

    struct FakeIdentity {
        known: HashMap<i64, &'static str>,
        delisted: BTreeSet<i64>,
        calls: Vec<i64>,
    }

    #[async_trait]
    impl IdentitySource for FakeIdentity {
        async fn app_details(&mut self, appid: i64, _language: &str) -> FetchResult<GameRecord> {
            self.calls.push(appid);
            if self.delisted.contains(&appid) {
                return Err(FetchError::NotFound);
            }
            match self.known.get(&appid) {
                Some(name) => Ok(GameRecord {
                    appid,
                    name: (*name).to_string(),
                    ..Default::default()
                }),
                None => Err(FetchError::Transient("boom".into())),
            }
        }
    }

    struct FakeStats {
        data: HashMap<i64, AppStats>,
        calls: Vec<i64>,
    }

    #[async_trait]
    impl StatsSource for FakeStats {
        async fn app_stats(&mut self, appid: i64) -> FetchResult<Option<AppStats>> {
            self.calls.push(appid);
            Ok(self.data.get(&appid).cloned())
        }
    }

    #[derive(Default)]
    struct FakeEstimates {
        data: HashMap<String, GameEstimate>,
        calls: usize,
        fail_all: bool,
        exhausted: bool,
    }

    #[async_trait]
    impl EstimateSource for FakeEstimates {
        async fn estimate_for(&mut self, name: &str) -> FetchResult<Option<GameEstimate>> {
            self.calls += 1;
            if self.fail_all {
                self.exhausted = true;
                return Err(FetchError::Transient("down".into()));
            }
            Ok(self.data.get(name).cloned())
        }

        fn is_exhausted(&self) -> bool {
            self.exhausted
        }
    }

    fn owned(appid: i64, steam_id: &str, hours: f64) -> OwnedGame {
        OwnedGame {
            appid,
            owner_steam_id: steam_id.to_string(),
            hours_played: hours,
            last_played_at: Some(1_700_000_000),
            primary_account: false,
        }
    }

    fn harness_parts(
        lists: HashMap<String, Vec<OwnedGame>>,
        known: HashMap<i64, &'static str>,
    ) -> (FakeOwnership, FakeIdentity, FakeStats, FakeEstimates) {
        (
            FakeOwnership { lists, calls: 0 },
            FakeIdentity {
                known,
                delisted: BTreeSet::new(),
                calls: Vec::new(),
            },
            FakeStats {
                data: HashMap::new(),
                calls: Vec::new(),
            },
            FakeEstimates::default(),
        )
    }

    async fn run(
        ownership: &mut FakeOwnership,
        identity: &mut FakeIdentity,
        stats: &mut FakeStats,
        estimates: &mut FakeEstimates,
        cache: &CacheStore,
        accounts: &[AccountSpec],
    ) -> Vec<GameRecord> {
        let matcher = DefaultMatcher::default();
        let mut pipeline = Pipeline::new(
            ownership,
            identity,
            stats,
            estimates,
            &matcher,
            cache,
            SyncOptions::default(),
        );
        pipeline.run(accounts).await.unwrap()
    }

    fn account(steam_id: &str, primary: bool) -> AccountSpec {
        AccountSpec {
            steam_id: steam_id.to_string(),
            primary,
        }
    }

    #[tokio::test]
    async fn duplicate_ownership_rows_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([(
            "a".to_string(),
            vec![owned(10, "a", 1.0), owned(10, "a", 99.0)],
        )]);
        let (mut own, mut ident, mut stats, mut est) =
            harness_parts(lists, HashMap::from([(10, "Ten")]));
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(ident.calls, vec![10]);
        // First occurrence won.
        assert_eq!(out[0].owned.as_ref().unwrap().hours_played, 1.0);
    }

    #[tokio::test]
    async fn denylisted_ids_never_reach_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        cache.save_denylist(&BTreeSet::from([10]));
        let lists = HashMap::from([("a".to_string(), vec![owned(10, "a", 1.0)])]);
        let (mut own, mut ident, mut stats, mut est) =
            harness_parts(lists, HashMap::from([(10, "Ten")]));
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        assert!(out.is_empty());
        assert!(ident.calls.is_empty());
    }

    #[tokio::test]
    async fn delisting_lands_on_the_denylist_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([("a".to_string(), vec![owned(10, "a", 1.0)])]);
        let (mut own, mut ident, mut stats, mut est) = harness_parts(lists.clone(), HashMap::new());
        ident.delisted.insert(10);
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        assert!(out.is_empty());
        assert_eq!(cache.load_denylist(), BTreeSet::from([10]));

        // Second run: the id is short-circuited before any adapter call.
        let (mut own2, mut ident2, mut stats2, mut est2) = harness_parts(lists, HashMap::new());
        run(&mut own2, &mut ident2, &mut stats2, &mut est2, &cache, &[account("a", true)]).await;
        assert!(ident2.calls.is_empty());
    }

    #[tokio::test]
    async fn second_cached_run_is_idempotent_and_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([("a".to_string(), vec![owned(10, "a", 2.0)])]);
        let known = HashMap::from([(10, "Ten")]);
        let (mut own, mut ident, mut stats, mut est) = harness_parts(lists.clone(), known.clone());
        stats.data.insert(
            10,
            AppStats {
                positive: 90,
                negative: 10,
                average_forever: 100,
                median_forever: 50,
                average_recent: 10,
                median_recent: 5,
                tags: vec![],
            },
        );
        let first = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;

        let (mut own2, mut ident2, mut stats2, mut est2) = harness_parts(lists, known);
        let second =
            run(&mut own2, &mut ident2, &mut stats2, &mut est2, &cache, &[account("a", true)]).await;

        assert_eq!(own2.calls, 0, "owned list should come from cache");
        assert!(ident2.calls.is_empty(), "identity layer should be cached");
        assert!(stats2.calls.is_empty(), "stats layer should be cached");
        assert_eq!(est2.calls, 0, "estimate layer should be cached");
        assert_eq!(first, second);
        assert_eq!(second[0].review_category.as_deref(), Some("Very Positive"));
    }

    #[tokio::test]
    async fn primary_account_wins_in_either_order() {
        for primary_first in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let cache = CacheStore::new(dir.path());
            let lists = HashMap::from([
                ("p".to_string(), vec![owned(10, "p", 50.0)]),
                ("q".to_string(), vec![owned(10, "q", 3.0)]),
            ]);
            let (mut own, mut ident, mut stats, mut est) =
                harness_parts(lists, HashMap::from([(10, "Ten")]));
            let accounts = if primary_first {
                vec![account("p", true), account("q", false)]
            } else {
                vec![account("q", false), account("p", true)]
            };
            let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &accounts).await;
            assert_eq!(out.len(), 1);
            let o = out[0].owned.as_ref().unwrap();
            assert_eq!(o.owner_steam_id, "p", "primary_first={primary_first}");
            assert_eq!(o.hours_played, 50.0);
        }
    }

    #[tokio::test]
    async fn later_non_primary_account_overwrites_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([
            ("a".to_string(), vec![owned(10, "a", 1.0)]),
            ("b".to_string(), vec![owned(10, "b", 2.0)]),
        ]);
        let (mut own, mut ident, mut stats, mut est) =
            harness_parts(lists, HashMap::from([(10, "Ten")]));
        let out = run(
            &mut own,
            &mut ident,
            &mut stats,
            &mut est,
            &cache,
            &[account("a", false), account("b", false)],
        )
        .await;
        assert_eq!(out[0].owned.as_ref().unwrap().owner_steam_id, "b");
    }

    #[tokio::test]
    async fn exhausted_estimate_source_aborts_only_that_layer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([(
            "a".to_string(),
            vec![owned(10, "a", 1.0), owned(20, "a", 1.0), owned(30, "a", 1.0)],
        )]);
        let (mut own, mut ident, mut stats, mut est) = harness_parts(
            lists,
            HashMap::from([(10, "Ten"), (20, "Twenty"), (30, "Thirty")]),
        );
        est.fail_all = true;
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        // Layer bailed after the first failure flipped the exhausted flag.
        assert_eq!(est.calls, 1);
        // Identity results survive the abandoned estimate layer.
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.estimate_updated_at.is_none()));
    }

    #[tokio::test]
    async fn transient_identity_failure_skips_item_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([(
            "a".to_string(),
            vec![owned(10, "a", 1.0), owned(20, "a", 1.0)],
        )]);
        // 20 is known, 10 always fails transiently.
        let (mut own, mut ident, mut stats, mut est) =
            harness_parts(lists, HashMap::from([(20, "Twenty")]));
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].appid, 20);
        // Transient failures must not denylist.
        assert!(cache.load_denylist().is_empty());
    }

    #[tokio::test]
    async fn suspicious_estimate_match_lands_in_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let lists = HashMap::from([("a".to_string(), vec![owned(10, "a", 1.0)])]);
        let (mut own, mut ident, mut stats, mut est) =
            harness_parts(lists, HashMap::from([(10, "Portal")]));
        est.data.insert(
            "Portal".to_string(),
            GameEstimate {
                matched_name: "Hortal 9".to_string(),
                hours_main: Some(3),
                hours_main_extra: None,
                hours_completionist: None,
                url: None,
            },
        );
        let out = run(&mut own, &mut ident, &mut stats, &mut est, &cache, &[account("a", true)]).await;
        assert_eq!(out[0].hltb_name.as_deref(), Some("Hortal 9"));
        let ledger = cache.load_mismatches();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].appid, 10);
    }
}
