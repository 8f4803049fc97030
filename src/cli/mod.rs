//! Command-line interface for zotsync.
//!
//! Provides commands for diffing and reconciling the vault against the
//! library, running the summarization pipeline, and inspecting state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::adapters::{
    LibrarySource, LocalLibrary, OpenAiSummarizer, PdftotextExtractor, ZoteroClient,
};
use crate::core::{
    append_history, read_history, BatchPipeline, Checkpoint, DoneRecord, HistoryEntry,
    RateLimitedCaller, ResponseCache, RetryPolicy, StageConfig, StatePaths,
};
use crate::domain::{
    ExecutionReport, OperationKind, OperationOutcome, ReconciliationPlan, RunSummary,
};
use crate::sync::{compute_plan, ApplyOptions, ReconciliationExecutor};
use crate::vault::VaultStore;

/// zotsync - Zotero to Markdown sync and summarization
#[derive(Parser, Debug)]
#[command(name = "zotsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show what a sync would change, without touching anything
    Diff(DiffArgs),

    /// Reconcile the vault folder layout against the library
    Apply(ApplyArgs),

    /// Process items through fetch, extract, summarize, and render
    Run(RunArgs),

    /// Reconcile the vault, then process the newly added items
    Sync(SyncArgs),

    /// List collections with item counts
    Collections {
        /// Library backend to read
        #[arg(long, value_enum, default_value = "auto")]
        source: SourceKind,
    },

    /// Show vault state, run state, and recent history
    Status {
        /// Number of history entries to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Restrict to one collection subtree (name or path prefix)
    #[arg(short, long)]
    collection: Option<String>,

    /// Library backend to read
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceKind,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Restrict to one collection subtree (name or path prefix)
    #[arg(short, long)]
    collection: Option<String>,

    /// Report operations without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Skip the pre-apply vault snapshot
    #[arg(long)]
    no_backup: bool,

    /// Library backend to read
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceKind,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Restrict to one collection subtree (name or path prefix)
    #[arg(short, long)]
    collection: Option<String>,

    /// Worker pool size (defaults from config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Stop after this many items
    #[arg(short, long)]
    limit: Option<usize>,

    /// Pick up from the last interrupted run
    #[arg(long)]
    resume: bool,

    /// Reprocess a key even if already done (repeatable)
    #[arg(long = "force", value_name = "KEY")]
    force: Vec<String>,

    /// Render notes without calling the summarization service
    #[arg(long)]
    skip_summaries: bool,

    /// Run every stage but write nothing
    #[arg(long)]
    dry_run: bool,

    /// Library backend to read
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceKind,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Restrict to one collection subtree (name or path prefix)
    #[arg(short, long)]
    collection: Option<String>,

    /// Report operations without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Skip the pre-apply vault snapshot
    #[arg(long)]
    no_backup: bool,

    /// Worker pool size (defaults from config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Stop after this many items
    #[arg(short, long)]
    limit: Option<usize>,

    /// Render notes without calling the summarization service
    #[arg(long)]
    skip_summaries: bool,

    /// Library backend to read
    #[arg(long, value_enum, default_value = "auto")]
    source: SourceKind,
}

/// Which library backend to read
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceKind {
    /// Local database when present, Web API otherwise
    Auto,

    /// Read the local Zotero sqlite database
    Local,

    /// Read the Zotero Web API
    Api,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Diff(args) => diff_vault(args).await,
            Commands::Apply(args) => apply_vault(args).await,
            Commands::Run(args) => run_items(args).await,
            Commands::Sync(args) => sync_vault(args).await,
            Commands::Collections { source } => list_collections(source).await,
            Commands::Status { limit } => show_status(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// One resolved library backend plus whatever PDF access it allows
struct Library {
    source: Arc<dyn LibrarySource>,
    client: Option<Arc<ZoteroClient>>,
    data_dir: Option<PathBuf>,
}

fn open_library(kind: SourceKind) -> Result<Library> {
    match kind {
        SourceKind::Local => open_local(),
        SourceKind::Api => open_api(),
        SourceKind::Auto => match open_local() {
            Ok(library) => Ok(library),
            Err(_) => open_api().context(
                "No local Zotero database found and the Web API is not configured. \
                 Set zotero.data_dir, or zotero.user_id and ZOTERO_API_KEY",
            ),
        },
    }
}

fn open_local() -> Result<Library> {
    let library = LocalLibrary::from_config()?;
    let data_dir = Some(library.data_dir().to_path_buf());
    // API credentials are optional here, used only to fetch PDFs that
    // are not in local storage
    let client = ZoteroClient::from_config().ok().map(Arc::new);
    Ok(Library {
        source: Arc::new(library),
        client,
        data_dir,
    })
}

fn open_api() -> Result<Library> {
    let client = Arc::new(ZoteroClient::from_config()?);
    let data_dir = crate::config::config()?.zotero.data_dir.clone();
    Ok(Library {
        source: client.clone(),
        client: Some(client),
        data_dir,
    })
}

/// Scan the vault, list the library, and compute the plan between them
async fn load_plan(
    library: &Library,
    collection: Option<&str>,
) -> Result<(ReconciliationPlan, usize)> {
    let store = VaultStore::new(crate::config::vault_dir()?);
    let scan = store.scan()?;
    let items = library.source.list_items(collection).await?;
    let item_count = items.len();

    let mut plan = compute_plan(&items, &scan.documents, collection);
    plan.duplicates = scan.duplicates;
    Ok((plan, item_count))
}

async fn diff_vault(args: DiffArgs) -> Result<()> {
    let library = open_library(args.source)?;
    let (plan, item_count) = load_plan(&library, args.collection.as_deref()).await?;

    println!("Library items: {}", item_count);
    print_plan(&plan);
    Ok(())
}

async fn apply_vault(args: ApplyArgs) -> Result<()> {
    let library = open_library(args.source)?;
    let (_, report) = reconcile(
        &library,
        args.collection.as_deref(),
        args.dry_run,
        args.no_backup,
    )
    .await?;

    if report.has_failures() {
        eprintln!("\n[{} operation(s) failed]", report.failure_count());
        std::process::exit(1);
    }
    Ok(())
}

/// Compute a plan and apply it, printing the report and recording it
async fn reconcile(
    library: &Library,
    collection: Option<&str>,
    dry_run: bool,
    no_backup: bool,
) -> Result<(ReconciliationPlan, ExecutionReport)> {
    let (plan, _) = load_plan(library, collection).await?;

    let store = VaultStore::new(crate::config::vault_dir()?);
    let executor = ReconciliationExecutor::new(store, crate::config::backups_dir()?);
    let options = ApplyOptions {
        dry_run,
        backup: !no_backup,
    };
    let report = executor.apply(&plan, &options).await?;
    print_report(&report);

    if !dry_run {
        record_history(HistoryEntry::reconciliation(report.clone()));
    }
    Ok((plan, report))
}

async fn run_items(args: RunArgs) -> Result<()> {
    let library = open_library(args.source)?;
    let config = stage_config(
        args.collection,
        args.workers,
        args.limit,
        args.resume,
        args.force,
        args.dry_run,
    )?;
    let summary = execute_run(&library, None, config, args.skip_summaries).await?;

    if summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

async fn sync_vault(args: SyncArgs) -> Result<()> {
    let library = open_library(args.source)?;
    let (plan, report) = reconcile(
        &library,
        args.collection.as_deref(),
        args.dry_run,
        args.no_backup,
    )
    .await?;

    if plan.added.is_empty() {
        println!("\nNo new items to process");
        if report.has_failures() {
            std::process::exit(1);
        }
        return Ok(());
    }
    println!("\nProcessing {} new item(s)", plan.added.len());

    // A done entry for an item the plan lists as added means its note
    // was archived since; force those keys through again
    let paths = StatePaths::from_config()?;
    let done = DoneRecord::load(&paths.done).await?;
    let force: Vec<String> = plan
        .added
        .iter()
        .filter(|key| done.contains(key))
        .cloned()
        .collect();

    let config = stage_config(
        args.collection,
        args.workers,
        args.limit,
        false,
        force,
        args.dry_run,
    )?;
    let summary = execute_run(
        &library,
        Some(plan.added.clone()),
        config,
        args.skip_summaries,
    )
    .await?;

    if report.has_failures() || summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

/// Fill a StageConfig from flags, falling back to resolved config
fn stage_config(
    collection: Option<String>,
    workers: Option<usize>,
    limit: Option<usize>,
    resume: bool,
    force: Vec<String>,
    dry_run: bool,
) -> Result<StageConfig> {
    let resolved = crate::config::config()?;
    Ok(StageConfig {
        collection,
        workers: workers.unwrap_or(resolved.pipeline.workers),
        limit,
        resume,
        force,
        dry_run,
        language: resolved.summarizer.language.clone(),
        model: resolved.summarizer.model.clone(),
        user_id: resolved.zotero.user_id.clone(),
    })
}

/// Build the batch pipeline and run it with ctrl-c draining
async fn execute_run(
    library: &Library,
    candidates: Option<Vec<String>>,
    config: StageConfig,
    skip_summaries: bool,
) -> Result<RunSummary> {
    let store = VaultStore::new(crate::config::vault_dir()?);
    let paths = StatePaths::from_config()?;
    let pdf_dir = crate::config::zotsync_home()?.join("pdfs");

    let mut pipeline = BatchPipeline::new(
        Arc::clone(&library.source),
        Arc::new(PdftotextExtractor::new()),
        store,
        paths,
        pdf_dir,
    );
    if let Some(data_dir) = &library.data_dir {
        pipeline = pipeline.with_data_dir(data_dir.clone());
    }
    if let Some(client) = &library.client {
        pipeline = pipeline.with_downloader(Arc::clone(client));
    }
    if !skip_summaries {
        let summarizer = OpenAiSummarizer::from_config()?;
        let cache = ResponseCache::from_config()?;
        pipeline = pipeline.with_caller(RateLimitedCaller::new(
            Arc::new(summarizer),
            cache,
            RetryPolicy::default(),
        ));
    }

    // First ctrl-c requests a graceful drain, second aborts
    let stop = pipeline.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after in-flight items finish (ctrl-c again to abort)");
            stop.trigger();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nAborted");
            std::process::exit(130);
        }
    });

    let summary = pipeline.run(candidates, &config).await?;
    ctrl_c.abort();

    print_run_summary(&summary);

    if !config.dry_run {
        record_history(HistoryEntry::pipeline_run(summary.clone()));
    }
    Ok(summary)
}

async fn list_collections(source: SourceKind) -> Result<()> {
    let library = open_library(source)?;
    let collections = library.source.list_collections().await?;

    if collections.is_empty() {
        println!("No collections found");
        return Ok(());
    }

    println!("{:<50} {:>7}", "COLLECTION", "ITEMS");
    println!("{}", "-".repeat(58));
    for (path, count) in collections {
        // Sorted paths put parents right before children, so indenting
        // by depth draws the tree
        let depth = path.matches('/').count();
        let name = path.rsplit('/').next().unwrap_or(path.as_str());
        println!("{:<50} {:>7}", format!("{}{}", "  ".repeat(depth), name), count);
    }
    Ok(())
}

async fn show_status(limit: usize) -> Result<()> {
    let resolved = crate::config::config()?;

    let store = VaultStore::new(resolved.vault.clone());
    println!("Vault: {}", resolved.vault.display());
    match store.scan() {
        Ok(scan) => {
            println!("  notes:      {}", scan.documents.len());
            if !scan.duplicates.is_empty() {
                println!("  duplicates: {}", scan.duplicates.len());
            }
        }
        Err(e) => println!("  (scan failed: {})", e),
    }

    let paths = StatePaths::from_config()?;
    let done = DoneRecord::load(&paths.done).await?;
    println!("Done record: {} item(s)", done.len());

    let cached = std::fs::read_dir(crate::config::summary_cache_dir()?)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "json"))
                .count()
        })
        .unwrap_or(0);
    println!("Summary cache: {} entries", cached);

    if let Some(checkpoint) = Checkpoint::load(&paths.checkpoint).await {
        println!(
            "Checkpoint: {} processed, {} pending, updated {} (continue with `zotsync run --resume`)",
            checkpoint.processed_keys.len(),
            checkpoint.pending_queue.len(),
            checkpoint.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    let history = read_history(&crate::config::history_path()?).await?;
    if history.is_empty() {
        println!("\nNo recorded runs");
        return Ok(());
    }

    println!("\nRecent runs:");
    for entry in history.iter().rev().take(limit) {
        match entry {
            HistoryEntry::Reconciliation { at, report } => {
                println!(
                    "  {}  apply  {} applied, {} failed, {} pending",
                    at.format("%Y-%m-%d %H:%M"),
                    report.applied_count(),
                    report.failure_count(),
                    report.pending.len()
                );
            }
            HistoryEntry::PipelineRun { at, summary } => {
                println!(
                    "  {}  run    {} ok, {} failed, {} skipped{}",
                    at.format("%Y-%m-%d %H:%M"),
                    summary.succeeded,
                    summary.failed.len(),
                    summary.skipped,
                    if summary.drained { ", interrupted" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let resolved = crate::config::config()?;

    println!("Home:    {}", resolved.home.display());
    println!("Vault:   {}", resolved.vault.display());
    println!("Backups: {}", resolved.backups.display());
    match &resolved.config_file {
        Some(path) => println!("Config:  {}", path.display()),
        None => println!("Config:  (defaults, no config file found)"),
    }

    println!("\nZotero:");
    println!(
        "  user id:  {}",
        resolved.zotero.user_id.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  api key:  {}",
        if resolved.zotero.api_key.is_some() {
            "set"
        } else {
            "(not set)"
        }
    );
    match &resolved.zotero.data_dir {
        Some(dir) => println!("  data dir: {}", dir.display()),
        None => println!("  data dir: (not found)"),
    }

    println!("\nSummarizer:");
    println!("  endpoint: {}", resolved.summarizer.endpoint);
    println!("  model:    {}", resolved.summarizer.model);
    println!("  language: {}", resolved.summarizer.language);
    println!("  api key:  ${}", resolved.summarizer.api_key_env);

    println!("\nPipeline:");
    println!("  workers:   {}", resolved.pipeline.workers);
    println!("  cache ttl: {} day(s)", resolved.pipeline.cache_ttl_days);
    Ok(())
}

fn print_plan(plan: &ReconciliationPlan) {
    if plan.is_empty() && plan.duplicates.is_empty() {
        println!("Vault is in sync");
        return;
    }

    if !plan.added.is_empty() {
        println!("\nNew items without notes ({}):", plan.added.len());
        for key in &plan.added {
            println!("  + {}", key);
        }
    }
    if !plan.moved.is_empty() {
        println!("\nNotes to move ({}):", plan.moved.len());
        for planned in &plan.moved {
            println!(
                "  ~ {}  {} -> {}",
                planned.key(),
                planned.document.folder.display(),
                planned.to.display()
            );
        }
    }
    if !plan.deleted.is_empty() {
        println!("\nNotes to archive ({}):", plan.deleted.len());
        for document in &plan.deleted {
            println!("  - {}  {}", document.key, document.relative_path().display());
        }
    }
    if !plan.duplicates.is_empty() {
        println!(
            "\nDuplicate notes, left untouched ({}):",
            plan.duplicates.len()
        );
        for document in &plan.duplicates {
            println!("  ! {}  {}", document.key, document.relative_path().display());
        }
    }
}

fn print_report(report: &ExecutionReport) {
    if report.dry_run {
        println!("Dry run, nothing was changed");
    }
    if let Some(backup) = &report.backup {
        println!("Backup: {}", backup.display());
    }

    for record in &report.operations {
        let kind = match record.kind {
            OperationKind::Move => "move",
            OperationKind::Archive => "archive",
        };
        match &record.outcome {
            OperationOutcome::Planned => println!(
                "  plan {} {}: {} -> {}",
                kind,
                record.key,
                record.from.display(),
                record.to.display()
            ),
            OperationOutcome::Applied => println!(
                "  {} {}: {} -> {}",
                kind,
                record.key,
                record.from.display(),
                record.to.display()
            ),
            OperationOutcome::AlreadyApplied => {
                println!("  {} {}: already in place", kind, record.key)
            }
            OperationOutcome::Failed { reason } => {
                eprintln!("  FAILED {} {}: {}", kind, record.key, reason)
            }
        }
    }

    if !report.removed_dirs.is_empty() {
        println!("Removed {} empty folder(s)", report.removed_dirs.len());
    }
    println!(
        "\n{} applied, {} failed, {} new item(s) pending",
        report.applied_count(),
        report.failure_count(),
        report.pending.len()
    );
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("Processed: {}", summary.processed());
    println!("  succeeded: {}", summary.succeeded);
    println!("  failed:    {}", summary.failed.len());
    println!("  skipped:   {}", summary.skipped);
    if summary.drained {
        println!("Run was interrupted; continue with `zotsync run --resume`");
    }

    if !summary.failed.is_empty() {
        println!("\nFailures:");
        for failure in &summary.failed {
            println!("  {}  {}: {}", failure.key, failure.stage, failure.reason);
        }
    }
}

/// History writes never fail a command
fn record_history(entry: HistoryEntry) {
    let appended = crate::config::history_path().and_then(|path| append_history(&path, &entry));
    if let Err(e) = appended {
        eprintln!("Warning: could not record history: {}", e);
    }
}
