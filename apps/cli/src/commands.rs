//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bookmarks_core::{
    BatchCoordinator, BatchProgress, BatchResult, BlessedTags, CacheStore, HtmlExtractor,
    LlmClient, OperationRunner, Operations, PageRenderer, RecordPipeline, load_records,
    save_outcomes,
};
use bookmarks_fetch::{HttpFetcher, RenderBridge};
use bookmarks_shared::{
    AppConfig, RecordOutcome, expand_home, init_config, load_config, load_config_from,
    validate_config,
};
use bookmarks_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Bookmarks: verify, summarize, and tag a bookmark export.
#[derive(Parser)]
#[command(
    name = "bookmarks",
    version,
    about = "Verify, summarize, and tag a Pinboard-style bookmark export.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.bookmarks/bookmarks.toml).
    #[arg(long, global = true, env = "BOOKMARKS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process a bookmark export and write the result.
    Run {
        /// Input JSON export.
        input: PathBuf,

        /// Output file; written atomically once every record is done.
        output: PathBuf,

        /// Record pipelines to run at once.
        #[arg(short, long)]
        concurrency: Option<u32>,

        /// Blessed tag list used by tag lint.
        #[arg(long)]
        blessed_tags: Option<String>,

        /// Cache database path.
        #[arg(long)]
        cache_db: Option<String>,

        /// Skip the headless-render liveness stage.
        #[arg(long)]
        no_render: bool,
    },

    /// Inspect or maintain the operation cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show recent batch runs.
    History {
        /// Number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Cache database path.
        #[arg(long)]
        cache_db: Option<String>,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Live and expired entries per operation.
    Stats {
        #[arg(long)]
        cache_db: Option<String>,
    },
    /// Delete expired entries.
    Purge {
        #[arg(long)]
        cache_db: Option<String>,
    },
    /// Delete entries regardless of expiry.
    Clear {
        /// Only entries of this operation (e.g. `llm.summarize`).
        #[arg(long)]
        operation: Option<String>,

        #[arg(long)]
        cache_db: Option<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bookmarks=info",
        1 => "bookmarks=debug",
        _ => "bookmarks=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            input,
            output,
            concurrency,
            blessed_tags,
            cache_db,
            no_render,
        } => {
            let mut config = config;
            if let Some(concurrency) = concurrency {
                config.defaults.concurrency = concurrency;
            }
            if let Some(path) = blessed_tags {
                config.defaults.blessed_tags = path;
            }
            if let Some(path) = cache_db {
                config.defaults.cache_db = path;
            }
            if no_render {
                config.render.command = None;
            }
            cmd_run(&config, &input, &output).await
        }
        Command::Cache { action } => match action {
            CacheAction::Stats { cache_db } => {
                cmd_cache_stats(&db_path(&config, cache_db.as_deref())).await
            }
            CacheAction::Purge { cache_db } => {
                cmd_cache_purge(&db_path(&config, cache_db.as_deref())).await
            }
            CacheAction::Clear {
                operation,
                cache_db,
            } => cmd_cache_clear(&db_path(&config, cache_db.as_deref()), operation.as_deref()).await,
        },
        Command::History { limit, cache_db } => {
            cmd_history(&db_path(&config, cache_db.as_deref()), limit).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

/// An explicit `--config` must exist; the default location may be absent.
fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    validate_config(&config)?;
    Ok(config)
}

fn db_path(config: &AppConfig, flag: Option<&str>) -> PathBuf {
    expand_home(flag.unwrap_or(&config.defaults.cache_db))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    validate_config(config)?;

    // Input problems surface before anything is opened or spawned.
    let records = load_records(input)?;

    let db = expand_home(&config.defaults.cache_db);
    let storage = Arc::new(Storage::open(&db).await?);
    let cache = Arc::new(CacheStore::new(Arc::clone(&storage)));
    let purged = cache.purge_expired().await?;
    if purged > 0 {
        info!(purged, "dropped expired cache entries");
    }

    let run_id = storage
        .insert_batch_run(&input.display().to_string())
        .await?;

    let renderer = match &config.render.command {
        Some(_) => Some(Arc::new(RenderBridge::spawn(&config.render).await?)),
        None => {
            info!("no render command configured, render stage disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    let runner = OperationRunner::new(cache).with_cancellation(cancel.clone());
    let pipeline = RecordPipeline::new(
        runner,
        Operations::from_config(config),
        Arc::new(HttpFetcher::new(&config.http)?),
        renderer
            .as_ref()
            .map(|bridge| Arc::clone(bridge) as Arc<dyn PageRenderer>),
        Arc::new(HtmlExtractor),
        Arc::new(LlmClient::new(&config.llm)?),
    )
    .with_blessed_tags(BlessedTags::load(&expand_home(
        &config.defaults.blessed_tags,
    ))?)
    .with_tags_config(config.tags.clone());

    let coordinator = BatchCoordinator::new(Arc::new(pipeline), config.defaults.concurrency as usize);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight operations");
                cancel.cancel();
            }
        });
    }

    let progress = CliProgress::new();
    let result = coordinator.run(records, &progress).await;

    if let Some(bridge) = &renderer {
        if let Err(e) = bridge.shutdown().await {
            warn!(error = %e, "render bridge shutdown failed");
        }
    }
    let result = result?;

    save_outcomes(output, &result.outcomes)?;
    let stats_json = serde_json::to_string(&result.stats)?;
    storage.finish_batch_run(&run_id, &stats_json).await?;

    print_summary(&result, output);

    if cancel.is_cancelled() {
        return Err(eyre!(
            "run cancelled: {} record(s) were not processed",
            result.stats.cancelled
        ));
    }
    Ok(())
}

fn print_summary(result: &BatchResult, output: &Path) {
    let stats = &result.stats;
    println!();
    println!("  Processed: {}", stats.processed);
    println!("  Failed:    {}", stats.failed - stats.cancelled);
    if stats.cancelled > 0 {
        println!("  Cancelled: {}", stats.cancelled);
    }
    println!("  Output:    {}", output.display());
    println!("  Time:      {:.1}s", stats.elapsed_ms as f64 / 1000.0);
    println!();

    for outcome in result.outcomes.iter().filter(|o| !o.is_processed()) {
        if let Some(reason) = &outcome.failure_reason {
            println!("  {} {}: {reason}", outcome.id, outcome.record.href);
        }
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl BatchProgress for CliProgress {
    fn started(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar
            .enable_steady_tick(std::time::Duration::from_millis(120));
    }

    fn record_finished(&self, done: usize, _total: usize, outcome: &RecordOutcome) {
        self.bar.set_position(done as u64);
        self.bar.set_message(outcome.record.href.clone());
    }

    fn finished(&self, _result: &BatchResult) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// cache / history
// ---------------------------------------------------------------------------

async fn cmd_cache_stats(db: &Path) -> Result<()> {
    let storage = Storage::open_readonly(db).await?;
    let stats = storage.cache_stats(chrono::Utc::now()).await?;

    if stats.is_empty() {
        println!("Cache is empty ({})", db.display());
        return Ok(());
    }

    println!("{:<20} {:>8} {:>8}", "OPERATION", "LIVE", "EXPIRED");
    for row in &stats {
        println!("{:<20} {:>8} {:>8}", row.operation, row.live, row.expired);
    }
    Ok(())
}

async fn cmd_cache_purge(db: &Path) -> Result<()> {
    let storage = Storage::open(db).await?;
    let removed = storage.purge_expired(chrono::Utc::now()).await?;
    println!("Removed {removed} expired entr{}", plural_y(removed));
    Ok(())
}

async fn cmd_cache_clear(db: &Path, operation: Option<&str>) -> Result<()> {
    let storage = Storage::open(db).await?;
    let removed = storage.clear_cache(operation).await?;
    match operation {
        Some(op) => println!("Removed {removed} {op} entr{}", plural_y(removed)),
        None => println!("Removed {removed} entr{}", plural_y(removed)),
    }
    Ok(())
}

fn plural_y(n: u64) -> &'static str {
    if n == 1 { "y" } else { "ies" }
}

async fn cmd_history(db: &Path, limit: u32) -> Result<()> {
    let storage = Storage::open_readonly(db).await?;
    let runs = storage.list_batch_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    for run in runs {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unfinished".into());
        let stats = run
            .stats
            .map(|s| s.to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  {}  {}  {}",
            run.id,
            run.started_at.to_rfc3339(),
            finished,
            run.input_path,
            stats
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
