//! Parallel batch pipeline.
//!
//! Each item moves through fetch, extract, summarize, and render on a
//! bounded worker pool. Progress is checkpointed so an interrupted run
//! resumes where it stopped, and completed keys land in the done record
//! so reruns skip them. Ctrl-C drains: queued items stay queued,
//! in-flight items finish, and the checkpoint records the rest.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ensure_attachment, Extractor, LibrarySource, SummarizeRequest, ZoteroClient};
use crate::domain::{note_file_name, ItemFailure, LibraryItem, RunSummary, Stage, Summary};
use crate::vault::{render_note, write_note, NoteContext, VaultStore};

use super::checkpoint::{Checkpoint, DoneRecord};
use super::throttle::RateLimitedCaller;

/// Completions between checkpoint writes
pub const CHECKPOINT_INTERVAL: usize = 10;

/// Per-run knobs, resolved by the CLI from flags and config
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Collection filter; None processes the whole library
    pub collection: Option<String>,

    /// Worker pool size
    pub workers: usize,

    /// Cap on items processed this run
    pub limit: Option<usize>,

    /// Pick up from an existing checkpoint
    pub resume: bool,

    /// Keys to strip from the done record before queueing
    pub force: Vec<String>,

    /// Run every stage but write nothing
    pub dry_run: bool,

    /// Summary language code
    pub language: String,

    /// Summarization model
    pub model: String,

    /// Library user id for web links in notes
    pub user_id: Option<String>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            collection: None,
            workers: 5,
            limit: None,
            resume: false,
            force: Vec::new(),
            dry_run: false,
            language: "ko".to_string(),
            model: "gpt-4o-mini".to_string(),
            user_id: None,
        }
    }
}

/// Where run state lives
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub checkpoint: PathBuf,
    pub done: PathBuf,
}

impl StatePaths {
    pub fn from_config() -> Result<Self> {
        Ok(Self {
            checkpoint: crate::config::checkpoint_path()?,
            done: crate::config::done_record_path()?,
        })
    }
}

/// Cooperative stop flag shared with the ctrl-c handler
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one worker reports back
struct ItemOutcome {
    key: String,
    result: Result<PathBuf, (Stage, String)>,
}

/// Reports a worker that unwound before sending its outcome, so the
/// coordinator never waits on a message that cannot arrive. The channel
/// has two slots per worker, so the unwind path cannot hit capacity.
struct CompletionGuard {
    key: Option<String>,
    tx: mpsc::Sender<ItemOutcome>,
}

impl CompletionGuard {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.tx.try_send(ItemOutcome {
                key,
                result: Err((Stage::Fetching, "worker panicked".to_string())),
            });
        }
    }
}

/// Everything a worker task needs, cloned per item
#[derive(Clone)]
struct WorkerContext {
    source: Arc<dyn LibrarySource>,
    extractor: Arc<dyn Extractor>,
    caller: Option<Arc<RateLimitedCaller>>,
    store: VaultStore,
    pdf_dir: PathBuf,
    data_dir: Option<PathBuf>,
    zotero: Option<Arc<ZoteroClient>>,
    language: String,
    model: String,
    user_id: Option<String>,
    dry_run: bool,
}

/// Batch pipeline over one library source
pub struct BatchPipeline {
    source: Arc<dyn LibrarySource>,
    extractor: Arc<dyn Extractor>,
    caller: Option<Arc<RateLimitedCaller>>,
    store: VaultStore,
    paths: StatePaths,
    pdf_dir: PathBuf,
    data_dir: Option<PathBuf>,
    zotero: Option<Arc<ZoteroClient>>,
    stop: StopSignal,
}

impl BatchPipeline {
    pub fn new(
        source: Arc<dyn LibrarySource>,
        extractor: Arc<dyn Extractor>,
        store: VaultStore,
        paths: StatePaths,
        pdf_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            extractor,
            caller: None,
            store,
            paths,
            pdf_dir,
            data_dir: None,
            zotero: None,
            stop: StopSignal::new(),
        }
    }

    /// Attach a summarization caller. Without one, every note gets the
    /// unavailable-summary placeholder.
    pub fn with_caller(mut self, caller: RateLimitedCaller) -> Self {
        self.caller = Some(Arc::new(caller));
        self
    }

    /// Local Zotero data directory for PDF lookup before any download
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = Some(data_dir);
        self
    }

    /// Client for downloading attachments missing from local storage
    pub fn with_downloader(mut self, client: Arc<ZoteroClient>) -> Self {
        self.zotero = Some(client);
        self
    }

    /// Handle for requesting a graceful stop
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Process candidates through all stages. None means the whole
    /// listing, in listing order.
    #[instrument(skip(self, candidate_keys, config), fields(workers = config.workers, dry_run = config.dry_run))]
    pub async fn run(
        &self,
        candidate_keys: Option<Vec<String>>,
        config: &StageConfig,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        let workers = config.workers.max(1);

        let mut done = DoneRecord::load(&self.paths.done).await?;
        if !config.force.is_empty() {
            info!(keys = config.force.len(), "Clearing forced keys from done record");
            done.remove(&config.force).await?;
        }

        let mut items = self
            .source
            .list_items(config.collection.as_deref())
            .await?;
        if let Some(filter) = config.collection.as_deref() {
            items.retain(|item| item.matches_filter(filter));
        }
        info!(items = items.len(), "Library listing loaded");

        let listing_order: Vec<String> = items.iter().map(|item| item.key.clone()).collect();
        let by_key: HashMap<String, LibraryItem> = items
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();

        let mut checkpoint = if config.resume {
            match Checkpoint::load(&self.paths.checkpoint).await {
                Some(cp) if cp.collection == config.collection => {
                    info!(processed = cp.processed_keys.len(), "Resuming from checkpoint");
                    cp
                }
                Some(cp) => {
                    warn!(
                        checkpoint_collection = ?cp.collection,
                        "Checkpoint is for a different collection, starting fresh"
                    );
                    Checkpoint::new(config.collection.clone())
                }
                None => Checkpoint::new(config.collection.clone()),
            }
        } else {
            Checkpoint::new(config.collection.clone())
        };

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut enqueued = HashSet::new();
        for key in candidate_keys.unwrap_or(listing_order) {
            if checkpoint.processed_keys.contains(&key) || done.contains(&key) {
                summary.skipped += 1;
                continue;
            }
            if enqueued.insert(key.clone()) {
                queue.push_back(key);
            }
        }
        if let Some(limit) = config.limit {
            if queue.len() > limit {
                summary.skipped += queue.len() - limit;
                queue.truncate(limit);
            }
        }
        info!(queued = queue.len(), skipped = summary.skipped, "Queue built");

        let worker_context = WorkerContext {
            source: Arc::clone(&self.source),
            extractor: Arc::clone(&self.extractor),
            caller: self.caller.clone(),
            store: self.store.clone(),
            pdf_dir: self.pdf_dir.clone(),
            data_dir: self.data_dir.clone(),
            zotero: self.zotero.clone(),
            language: config.language.clone(),
            model: config.model.clone(),
            user_id: config.user_id.clone(),
            dry_run: config.dry_run,
        };

        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::channel::<ItemOutcome>(workers * 2);
        let mut in_flight = 0usize;
        let mut since_checkpoint = 0usize;

        loop {
            // Submit until the pool is full or a stop was requested
            while in_flight < workers && !self.stop.is_triggered() {
                let Some(key) = queue.pop_front() else { break };

                let Some(item) = by_key.get(&key) else {
                    let outcome = ItemOutcome {
                        key,
                        result: Err((Stage::Fetching, "item not found in library".to_string())),
                    };
                    apply_outcome(&mut summary, &mut checkpoint, &mut done, outcome, config.dry_run)?;
                    checkpoint.save(&self.paths.checkpoint).await?;
                    since_checkpoint = 0;
                    continue;
                };

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("Worker pool semaphore closed")?;
                let context = worker_context.clone();
                let item = item.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut report = CompletionGuard {
                        key: Some(item.key.clone()),
                        tx: tx.clone(),
                    };
                    let outcome = process_item(context, item).await;
                    report.disarm();
                    let _ = tx.send(outcome).await;
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                // Queue is drained or a stop was requested before any spawn
                break;
            }

            let Some(outcome) = rx.recv().await else { break };
            in_flight -= 1;

            let had_failure = outcome.result.is_err();
            apply_outcome(&mut summary, &mut checkpoint, &mut done, outcome, config.dry_run)?;
            since_checkpoint += 1;
            if had_failure || since_checkpoint >= CHECKPOINT_INTERVAL {
                checkpoint.save(&self.paths.checkpoint).await?;
                since_checkpoint = 0;
            }
        }

        let drained = self.stop.is_triggered() && !queue.is_empty();
        summary.drained = drained;
        if drained {
            checkpoint.pending_queue = queue.into_iter().collect();
            checkpoint.save(&self.paths.checkpoint).await?;
            info!(
                processed = checkpoint.processed_keys.len(),
                pending = checkpoint.pending_queue.len(),
                "Run interrupted; checkpoint saved for resume"
            );
        } else {
            Checkpoint::clear(&self.paths.checkpoint).await?;
        }

        summary.finish();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            skipped = summary.skipped,
            drained = summary.drained,
            "Batch run finished"
        );
        Ok(summary)
    }
}

/// Fold one outcome into the run state
fn apply_outcome(
    summary: &mut RunSummary,
    checkpoint: &mut Checkpoint,
    done: &mut DoneRecord,
    outcome: ItemOutcome,
    dry_run: bool,
) -> Result<()> {
    match outcome.result {
        Ok(path) => {
            info!(key = %outcome.key, path = %path.display(), "Item complete");
            checkpoint.record(&outcome.key, true);
            summary.succeeded += 1;
            if !dry_run {
                done.mark_done(&outcome.key)?;
            }
        }
        Err((stage, reason)) => {
            warn!(key = %outcome.key, stage = %stage, %reason, "Item failed");
            checkpoint.record(&outcome.key, false);
            summary.failed.push(ItemFailure {
                key: outcome.key,
                stage,
                reason,
            });
        }
    }
    Ok(())
}

#[instrument(skip(context, item), fields(key = %item.key))]
async fn process_item(context: WorkerContext, item: LibraryItem) -> ItemOutcome {
    let key = item.key.clone();
    let result = run_stages(&context, &item).await;
    ItemOutcome { key, result }
}

/// One item through every stage. A missing or unusable PDF degrades to
/// the abstract; only summarization and rendering can fail the item.
async fn run_stages(
    context: &WorkerContext,
    item: &LibraryItem,
) -> Result<PathBuf, (Stage, String)> {
    // Fetching
    let pdf_path = locate_pdf(context, item).await;

    // Extracting
    let (text, degraded) = match &pdf_path {
        Some(path) => match context.extractor.extract(path).await {
            Ok(extraction) if extraction.usable() => (extraction.text, false),
            Ok(_) => {
                warn!(key = %item.key, "Extracted text failed plausibility checks, using abstract");
                abstract_fallback(item)
            }
            Err(e) => {
                warn!(key = %item.key, error = %e, "Extraction failed, using abstract");
                abstract_fallback(item)
            }
        },
        None => abstract_fallback(item),
    };

    // Summarizing
    let summary = if text.trim().is_empty() {
        debug!(key = %item.key, "No text to summarize");
        Summary::unavailable(&item.tags)
    } else {
        match &context.caller {
            Some(caller) => {
                let request =
                    SummarizeRequest::new(text, context.language.clone(), context.model.clone());
                match caller.call(&request).await {
                    Ok(summary) => summary,
                    Err(e) => return Err((Stage::Summarizing, e.to_string())),
                }
            }
            None => Summary::unavailable(&item.tags),
        }
    };

    // Rendering
    let note_context = NoteContext {
        pdf_link: pdf_path
            .as_ref()
            .map(|path| format!("file://{}", path.display())),
        user_id: context.user_id.clone(),
        degraded,
    };
    let content = render_note(item, &summary, &note_context);

    if context.dry_run {
        let destination = context.store.absolute(
            &item
                .primary_collection()
                .sanitized()
                .join(note_file_name(&item.title, &item.key)),
        );
        debug!(key = %item.key, path = %destination.display(), "Dry run, note not written");
        return Ok(destination);
    }

    write_note(&context.store, item, &content)
        .await
        .map_err(|e| (Stage::Rendering, e.to_string()))
}

fn abstract_fallback(item: &LibraryItem) -> (String, bool) {
    let text = item.abstract_text.clone();
    let degraded = !text.trim().is_empty();
    (text, degraded)
}

async fn locate_pdf(context: &WorkerContext, item: &LibraryItem) -> Option<PathBuf> {
    let attachment = match &item.attachment {
        Some(attachment) => Some(attachment.clone()),
        None => match context.source.attachment(&item.key).await {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(key = %item.key, error = %e, "Attachment lookup failed");
                None
            }
        },
    }?;

    match ensure_attachment(
        context.zotero.as_deref(),
        context.data_dir.as_deref(),
        &context.pdf_dir,
        &attachment,
    )
    .await
    {
        Ok(path) => path,
        Err(e) => {
            warn!(key = %item.key, error = %e, "Attachment fetch failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::adapters::Extraction;
    use crate::domain::AttachmentRef;

    struct FakeSource {
        items: Vec<LibraryItem>,
    }

    #[async_trait]
    impl LibrarySource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn list_items(&self, _collection_filter: Option<&str>) -> Result<Vec<LibraryItem>> {
            Ok(self.items.clone())
        }

        async fn list_collections(&self) -> Result<Vec<(String, usize)>> {
            Ok(Vec::new())
        }

        async fn attachment(&self, _item_key: &str) -> Result<Option<AttachmentRef>> {
            Ok(None)
        }
    }

    struct NoopExtractor;

    #[async_trait]
    impl Extractor for NoopExtractor {
        fn name(&self) -> &str {
            "noop"
        }

        async fn extract(&self, _pdf_path: &Path) -> Result<Extraction> {
            anyhow::bail!("no extraction in tests")
        }
    }

    struct Harness {
        _home: TempDir,
        vault: TempDir,
        pipeline: BatchPipeline,
        paths: StatePaths,
    }

    fn harness(items: Vec<LibraryItem>) -> Harness {
        let home = TempDir::new().unwrap();
        let vault = TempDir::new().unwrap();
        let paths = StatePaths {
            checkpoint: home.path().join("checkpoint.json"),
            done: home.path().join("done.txt"),
        };
        let pipeline = BatchPipeline::new(
            Arc::new(FakeSource { items }),
            Arc::new(NoopExtractor),
            VaultStore::new(vault.path()),
            paths.clone(),
            home.path().join("pdfs"),
        );
        Harness {
            _home: home,
            vault,
            pipeline,
            paths,
        }
    }

    fn item(key: &str, title: &str) -> LibraryItem {
        let mut item = LibraryItem::new(key, title);
        item.abstract_text = "An abstract long enough to describe the paper.".to_string();
        item
    }

    #[tokio::test]
    async fn test_run_writes_notes_and_records_completion() {
        let harness = harness(vec![item("AAAA1111", "First"), item("BBBB2222", "Second")]);

        let summary = harness
            .pipeline
            .run(None, &StageConfig::default())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(summary.failed.is_empty());
        assert!(!summary.drained);
        assert!(harness
            .vault
            .path()
            .join("Uncategorized/First_AAAA1111.md")
            .exists());

        let done = DoneRecord::load(&harness.paths.done).await.unwrap();
        assert!(done.contains("AAAA1111"));
        assert!(done.contains("BBBB2222"));

        assert!(Checkpoint::load(&harness.paths.checkpoint).await.is_none());
    }

    #[tokio::test]
    async fn test_done_keys_are_skipped() {
        let harness = harness(vec![item("AAAA1111", "First"), item("BBBB2222", "Second")]);
        let mut done = DoneRecord::load(&harness.paths.done).await.unwrap();
        done.mark_done("AAAA1111").unwrap();

        let summary = harness
            .pipeline
            .run(None, &StageConfig::default())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!harness
            .vault
            .path()
            .join("Uncategorized/First_AAAA1111.md")
            .exists());
    }

    #[tokio::test]
    async fn test_force_reprocesses_done_keys() {
        let harness = harness(vec![item("AAAA1111", "First")]);
        let mut done = DoneRecord::load(&harness.paths.done).await.unwrap();
        done.mark_done("AAAA1111").unwrap();

        let config = StageConfig {
            force: vec!["AAAA1111".to_string()],
            ..Default::default()
        };
        let summary = harness.pipeline.run(None, &config).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_limit_caps_the_queue() {
        let harness = harness(vec![
            item("AAAA1111", "First"),
            item("BBBB2222", "Second"),
            item("CCCC3333", "Third"),
        ]);

        let config = StageConfig {
            limit: Some(2),
            ..Default::default()
        };
        let summary = harness.pipeline.run(None, &config).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_unknown_candidate_fails_at_fetch() {
        let harness = harness(vec![item("AAAA1111", "First")]);

        let summary = harness
            .pipeline
            .run(
                Some(vec!["AAAA1111".to_string(), "ZZZZ9999".to_string()]),
                &StageConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].key, "ZZZZ9999");
        assert_eq!(summary.failed[0].stage, Stage::Fetching);
        assert_eq!(summary.failed[0].reason, "item not found in library");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let harness = harness(vec![item("AAAA1111", "First")]);

        let config = StageConfig {
            dry_run: true,
            ..Default::default()
        };
        let summary = harness.pipeline.run(None, &config).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(std::fs::read_dir(harness.vault.path()).unwrap().count(), 0);

        let done = DoneRecord::load(&harness.paths.done).await.unwrap();
        assert!(done.is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_keys() {
        let harness = harness(vec![item("AAAA1111", "First"), item("BBBB2222", "Second")]);

        let mut checkpoint = Checkpoint::new(None);
        checkpoint.record("AAAA1111", true);
        checkpoint.save(&harness.paths.checkpoint).await.unwrap();

        let config = StageConfig {
            resume: true,
            ..Default::default()
        };
        let summary = harness.pipeline.run(None, &config).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_mismatched_checkpoint_collection_starts_fresh() {
        let harness = harness(vec![item("AAAA1111", "First")]);

        let mut checkpoint = Checkpoint::new(Some("Old Filter".to_string()));
        checkpoint.record("AAAA1111", true);
        checkpoint.save(&harness.paths.checkpoint).await.unwrap();

        let config = StageConfig {
            resume: true,
            ..Default::default()
        };
        let summary = harness.pipeline.run(None, &config).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_pre_triggered_stop_drains_immediately() {
        let harness = harness(vec![item("AAAA1111", "First"), item("BBBB2222", "Second")]);
        harness.pipeline.stop_signal().trigger();

        let summary = harness
            .pipeline
            .run(None, &StageConfig::default())
            .await
            .unwrap();

        assert!(summary.drained);
        assert_eq!(summary.succeeded, 0);

        let checkpoint = Checkpoint::load(&harness.paths.checkpoint).await.unwrap();
        assert_eq!(checkpoint.pending_queue.len(), 2);
    }
}
