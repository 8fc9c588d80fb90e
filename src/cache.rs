use crate::model::{GameRecord, OwnedGame};
use indexmap::IndexMap;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

const RECORDS_FILE: &str = "games.json";
const DENYLIST_FILE: &str = "denylist.json";
const MISMATCH_FILE: &str = "name_mismatches.txt";

/// Human verdict on a suspected name mismatch, edited by hand in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchVerdict {
    Yes,
    No,
    Unconfirmed,
}

impl fmt::Display for MismatchVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MismatchVerdict::Yes => "yes",
            MismatchVerdict::No => "no",
            MismatchVerdict::Unconfirmed => "unconfirmed",
        };
        f.write_str(s)
    }
}

impl FromStr for MismatchVerdict {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(MismatchVerdict::Yes),
            "no" => Ok(MismatchVerdict::No),
            "unconfirmed" => Ok(MismatchVerdict::Unconfirmed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MismatchEntry {
    pub appid: i64,
    pub cached_name: String,
    pub source_name: String,
    pub verdict: MismatchVerdict,
}

impl MismatchEntry {
    fn to_line(&self) -> String {
        format!(
            "({}) Is {} really {}? [{}]",
            self.appid, self.cached_name, self.source_name, self.verdict
        )
    }
}

/// On-disk JSON cache for records, per-account owned lists, the denylist,
/// and the hand-editable name-mismatch ledger.
///
/// Loads never fail: a missing or unparsable file is an empty collection.
/// Saves merge fresh data over what is already on disk, then overwrite the
/// whole file; write failures are logged and swallowed so a cache problem
/// can never abort a run whose in-memory result is still usable.
///
/// Files assume a single writer. Concurrent runs against the same cache
/// directory are undefined behavior.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn owned_file(steam_id: &str) -> String {
        format!("owned_{}.json", steam_id)
    }

    fn load_json<T: DeserializeOwned>(&self, file: &str) -> Vec<T> {
        let path = self.path(file);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(err) => {
                warn!(path=%path.display(), error=%err, "cache: unreadable file treated as empty");
                Vec::new()
            }
        }
    }

    fn write_json<T: Serialize>(&self, file: &str, items: &[T]) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir=%self.dir.display(), error=%err, "cache: cannot create cache dir; skipping write");
            return;
        }
        let path = self.path(file);
        let body = match serde_json::to_string_pretty(items) {
            Ok(body) => body,
            Err(err) => {
                warn!(path=%path.display(), error=%err, "cache: serialize failed; skipping write");
                return;
            }
        };
        if let Err(err) = fs::write(&path, body) {
            warn!(path=%path.display(), error=%err, "cache: write failed; in-memory results unaffected");
        }
    }

    pub fn load_records(&self) -> Vec<GameRecord> {
        self.load_json(RECORDS_FILE)
    }

    /// Merge `fresh` over the records already on disk and rewrite the file.
    /// Fresh records win on shared appids; records present only on disk
    /// survive unchanged. The transient ownership view is stripped and the
    /// output sorted by appid for reproducible diffs.
    pub fn save_records(&self, fresh: &[GameRecord]) {
        let mut merged: IndexMap<i64, GameRecord> = IndexMap::new();
        for rec in self.load_records() {
            merged.insert(rec.appid, rec);
        }
        for rec in fresh {
            merged.insert(rec.appid, rec.clone());
        }
        let mut out: Vec<GameRecord> = merged.into_values().collect();
        for rec in &mut out {
            rec.strip_transient();
        }
        out.sort_unstable_by_key(|r| r.appid);
        debug!(count = out.len(), "cache: writing record set");
        self.write_json(RECORDS_FILE, &out);
    }

    pub fn load_denylist(&self) -> BTreeSet<i64> {
        self.load_json::<i64>(DENYLIST_FILE).into_iter().collect()
    }

    /// Union `fresh` into the persisted denylist. Entries are never removed
    /// here; retrying a delisted app requires editing the file by hand.
    pub fn save_denylist(&self, fresh: &BTreeSet<i64>) {
        let mut all = self.load_denylist();
        all.extend(fresh.iter().copied());
        let out: Vec<i64> = all.into_iter().collect();
        self.write_json(DENYLIST_FILE, &out);
    }

    pub fn load_owned(&self, steam_id: &str) -> Vec<OwnedGame> {
        self.load_json(&Self::owned_file(steam_id))
    }

    /// Owned lists are rebuilt per run, so this is a plain overwrite.
    pub fn save_owned(&self, steam_id: &str, games: &[OwnedGame]) {
        self.write_json(&Self::owned_file(steam_id), games);
    }

    pub fn load_mismatches(&self) -> Vec<MismatchEntry> {
        let path = self.path(MISMATCH_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        parse_mismatch_lines(&raw)
    }

    /// Append an unconfirmed suspicion for `appid` unless the ledger already
    /// carries a line for it; hand-edited verdicts are never clobbered.
    pub fn record_mismatch(&self, appid: i64, cached_name: &str, source_name: &str) {
        let mut entries = self.load_mismatches();
        if entries.iter().any(|e| e.appid == appid) {
            return;
        }
        entries.push(MismatchEntry {
            appid,
            cached_name: cached_name.to_string(),
            source_name: source_name.to_string(),
            verdict: MismatchVerdict::Unconfirmed,
        });
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir=%self.dir.display(), error=%err, "cache: cannot create cache dir; skipping write");
            return;
        }
        let body: String = entries.iter().map(|e| e.to_line() + "\n").collect();
        let path = self.path(MISMATCH_FILE);
        if let Err(err) = fs::write(&path, body) {
            warn!(path=%path.display(), error=%err, "cache: mismatch ledger write failed");
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_mismatch_lines(raw: &str) -> Vec<MismatchEntry> {
    // Non-greedy on the first name so titles containing " really " survive.
    let re = Regex::new(r"^\((\d+)\) Is (.*?) really (.*)\? \[(yes|no|unconfirmed)\]$")
        .expect("mismatch ledger regex");
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(caps) = re.captures(line) else {
            warn!(line, "cache: skipping malformed mismatch ledger line");
            continue;
        };
        let Ok(appid) = caps[1].parse::<i64>() else {
            continue;
        };
        out.push(MismatchEntry {
            appid,
            cached_name: caps[2].to_string(),
            source_name: caps[3].to_string(),
            verdict: caps[4].parse().unwrap_or(MismatchVerdict::Unconfirmed),
        });
    }
    out
}
