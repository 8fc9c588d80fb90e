use anyhow::{bail, Result};
use backlog_sync::cache::CacheStore;
use backlog_sync::matching::DefaultMatcher;
use backlog_sync::pipeline::{AccountSpec, Pipeline, SyncOptions};
use backlog_sync::remote::{upsert_all, HttpRecordStore};
use backlog_sync::sources::hltb::{
    AuthTokenProvider, CommandTokenProvider, HltbClient, StaticTokenProvider,
};
use backlog_sync::sources::steam::{SteamStoreClient, SteamWebClient};
use backlog_sync::sources::steamspy::SteamSpyClient;
use backlog_sync::tracing::init_tracing;
use backlog_sync::util::env::{env_opt, env_parse, env_req, init_env};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bls", version, about = "Backlog library sync")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Reconcile owned games from all sources and upsert the remote collection
    Sync {
        /// Steam ids to sync; the first one is the primary account
        #[arg(required = true)]
        steam_ids: Vec<String>,
        /// Bypass all cached data and refetch everything
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Storefront language
        #[arg(long, default_value = "english")]
        language: String,
        /// Reconcile only; skip the remote upsert
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Cache directory
        #[arg(long, default_value = ".backlog-cache")]
        cache_dir: String,
    },
    /// Print a summary of the cached record set
    ShowCache {
        /// Cache directory
        #[arg(long, default_value = ".backlog-cache")]
        cache_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    let cli = Cli::parse();
    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    init_tracing(default_filter)?;

    match cli.command {
        Commands::Sync {
            steam_ids,
            no_cache,
            language,
            dry_run,
            cache_dir,
        } => run_sync(steam_ids, no_cache, language, dry_run, cache_dir).await,
        Commands::ShowCache { cache_dir } => show_cache(cache_dir),
    }
}

fn token_provider() -> Result<Box<dyn AuthTokenProvider>> {
    if let Some(token) = env_opt("HLTB_SESSION_TOKEN") {
        return Ok(Box::new(StaticTokenProvider::new(token)));
    }
    if let Some(cmd) = env_opt("HLTB_CAPTURE_CMD") {
        let ceiling = env_parse("HLTB_CAPTURE_TIMEOUT_SECS", 60u64);
        return Ok(Box::new(CommandTokenProvider::new(
            cmd,
            Duration::from_secs(ceiling),
        )));
    }
    bail!("set HLTB_SESSION_TOKEN or HLTB_CAPTURE_CMD for the estimate source")
}

async fn run_sync(
    steam_ids: Vec<String>,
    no_cache: bool,
    language: String,
    dry_run: bool,
    cache_dir: String,
) -> Result<()> {
    let api_key = env_req("STEAM_API_KEY")?;
    let cache = CacheStore::new(&cache_dir);

    let mut ownership = SteamWebClient::new(api_key)?;
    let mut identity = SteamStoreClient::new()?;
    let mut stats = SteamSpyClient::new()?;
    let mut estimates = HltbClient::new(token_provider()?)?;
    let matcher = DefaultMatcher::default();

    let accounts: Vec<AccountSpec> = steam_ids
        .iter()
        .enumerate()
        .map(|(idx, steam_id)| AccountSpec {
            steam_id: steam_id.clone(),
            primary: idx == 0,
        })
        .collect();

    let opts = SyncOptions {
        use_cache: !no_cache,
        language,
    };
    let mut pipeline = Pipeline::new(
        &mut ownership,
        &mut identity,
        &mut stats,
        &mut estimates,
        &matcher,
        &cache,
        opts,
    );
    let records = pipeline.run(&accounts).await?;
    info!(records = records.len(), "reconciliation complete");

    if dry_run {
        info!("dry run; skipping remote upsert");
        return Ok(());
    }

    let store = HttpRecordStore::new(
        &env_req("REMOTE_API_URL")?,
        &env_req("REMOTE_API_TOKEN")?,
        &env_req("REMOTE_COLLECTION_ID")?,
    )?;
    upsert_all(&store, &records).await
}

fn show_cache(cache_dir: String) -> Result<()> {
    let cache = CacheStore::new(&cache_dir);
    let records = cache.load_records();
    let with_stats = records.iter().filter(|r| r.stats_updated_at.is_some()).count();
    let with_estimates = records
        .iter()
        .filter(|r| r.estimate_updated_at.is_some())
        .count();
    println!("cache dir:       {}", cache.dir().display());
    println!("records:         {}", records.len());
    println!("  with stats:    {}", with_stats);
    println!("  with estimates: {}", with_estimates);
    println!("denylisted:      {}", cache.load_denylist().len());
    println!("name mismatches: {}", cache.load_mismatches().len());
    Ok(())
}
