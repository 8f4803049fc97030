//! Batch Pipeline Integration Tests
//!
//! End-to-end runs over a scripted summarizer: retry exhaustion,
//! transient recovery, caching, done-record skipping, resume, and
//! worker loss.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use zotsync::adapters::{
    CallError, Extraction, Extractor, LibrarySource, SummarizeRequest, Summarizer,
};
use zotsync::core::{
    BatchPipeline, Checkpoint, DoneRecord, RateLimitedCaller, ResponseCache, RetryPolicy,
    StageConfig, StatePaths,
};
use zotsync::domain::{AttachmentRef, LibraryItem, Stage, Summary};
use zotsync::vault::VaultStore;

/// Library source backed by a fixed item list, with no attachments
struct StaticSource {
    items: Vec<LibraryItem>,
}

#[async_trait]
impl LibrarySource for StaticSource {
    fn name(&self) -> &str {
        "static"
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

struct NoExtractor;

#[async_trait]
impl Extractor for NoExtractor {
    fn name(&self) -> &str {
        "none"
    }

    async fn extract(&self, _pdf_path: &Path) -> Result<Extraction> {
        anyhow::bail!("no PDFs in these tests")
    }
}

/// Summarizer that replays a scripted sequence of responses
struct QueueSummarizer {
    calls: Arc<AtomicU32>,
    script: Mutex<VecDeque<Result<Summary, CallError>>>,
}

impl QueueSummarizer {
    fn new(script: Vec<Result<Summary, CallError>>) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let summarizer = Self {
            calls: Arc::clone(&calls),
            script: Mutex::new(script.into()),
        };
        (summarizer, calls)
    }
}

#[async_trait]
impl Summarizer for QueueSummarizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn summarize(&self, _request: &SummarizeRequest) -> Result<Summary, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::NonRetryable("script exhausted".to_string())))
    }
}

/// Summarizer whose first call panics; later calls succeed
struct PanickingSummarizer {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Summarizer for PanickingSummarizer {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn summarize(&self, _request: &SummarizeRequest) -> Result<Summary, CallError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("summarizer blew up");
        }
        Ok(sample_summary("Survived."))
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        backoff_multiplier: 2.0,
        transient_delay_ms: 1,
    }
}

fn sample_summary(text: &str) -> Summary {
    Summary {
        short_summary: text.to_string(),
        long_summary: format!("{} In much more detail.", text),
        ..Default::default()
    }
}

fn item(key: &str, title: &str, abstract_text: &str) -> LibraryItem {
    let mut item = LibraryItem::new(key, title);
    item.abstract_text = abstract_text.to_string();
    item
}

struct Setup {
    _home: TempDir,
    vault: TempDir,
    paths: StatePaths,
    pipeline: BatchPipeline,
    calls: Arc<AtomicU32>,
}

/// Pipeline over the given items, with a scripted summarizer attached
fn setup(items: Vec<LibraryItem>, script: Vec<Result<Summary, CallError>>) -> Setup {
    let home = TempDir::new().unwrap();
    let vault = TempDir::new().unwrap();
    let paths = StatePaths {
        checkpoint: home.path().join("checkpoint.json"),
        done: home.path().join("done.txt"),
    };

    let (summarizer, calls) = QueueSummarizer::new(script);
    let caller = RateLimitedCaller::new(
        Arc::new(summarizer),
        ResponseCache::new(home.path().join("cache"), 30),
        fast_policy(),
    );

    let pipeline = BatchPipeline::new(
        Arc::new(StaticSource { items }),
        Arc::new(NoExtractor),
        VaultStore::new(vault.path()),
        paths.clone(),
        home.path().join("pdfs"),
    )
    .with_caller(caller);

    Setup {
        _home: home,
        vault,
        paths,
        pipeline,
        calls,
    }
}

/// One worker keeps item order deterministic
fn serial_config() -> StageConfig {
    StageConfig {
        workers: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_three_rate_limits_exhaust_retries() {
    let setup = setup(
        vec![item("AAAA1111", "Rate Limited Paper", "A paper that keeps hitting the limit.")],
        vec![
            Err(CallError::RateLimited),
            Err(CallError::RateLimited),
            Err(CallError::RateLimited),
        ],
    );

    let summary = setup
        .pipeline
        .run(None, &serial_config())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 0);
    assert!(summary.has_failures());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].key, "AAAA1111");
    assert_eq!(summary.failed[0].stage, Stage::Summarizing);
    assert_eq!(summary.failed[0].reason, "retries-exhausted");
    assert_eq!(setup.calls.load(Ordering::SeqCst), 3);

    // The failed item must not produce a note or a done entry
    assert_eq!(std::fs::read_dir(setup.vault.path()).unwrap().count(), 0);
    let done = DoneRecord::load(&setup.paths.done).await.unwrap();
    assert!(done.is_empty());
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let setup = setup(
        vec![item("AAAA1111", "Flaky Paper", "An abstract about flaky networks.")],
        vec![
            Err(CallError::Transient("connection reset".to_string())),
            Ok(sample_summary("It recovered.")),
        ],
    );

    let summary = setup
        .pipeline
        .run(None, &serial_config())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(summary.failed.is_empty());
    assert_eq!(setup.calls.load(Ordering::SeqCst), 2);

    let note = setup
        .vault
        .path()
        .join("Uncategorized/Flaky Paper_AAAA1111.md");
    let content = std::fs::read_to_string(note).unwrap();
    assert!(content.contains("It recovered."));
}

#[tokio::test]
async fn test_identical_text_hits_the_cache() {
    // Same abstract, same model and language: the second item reuses
    // the first item's cached response
    let shared = "Two papers sharing one abstract, somehow.";
    let setup = setup(
        vec![
            item("AAAA1111", "First Copy", shared),
            item("BBBB2222", "Second Copy", shared),
        ],
        vec![Ok(sample_summary("Cached once."))],
    );

    let summary = setup
        .pipeline
        .run(None, &serial_config())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(setup.calls.load(Ordering::SeqCst), 1);

    let second = setup
        .vault
        .path()
        .join("Uncategorized/Second Copy_BBBB2222.md");
    let content = std::fs::read_to_string(second).unwrap();
    assert!(content.contains("Cached once."));
}

#[tokio::test]
async fn test_second_run_skips_done_items() {
    let items = vec![
        item("AAAA1111", "Good Paper", "The first abstract."),
        item("BBBB2222", "Bad Paper", "The second abstract."),
    ];

    let first = setup(
        items.clone(),
        vec![
            Ok(sample_summary("Summarized fine.")),
            Err(CallError::NonRetryable("model refused".to_string())),
        ],
    );
    let summary = first.pipeline.run(None, &serial_config()).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].reason, "non-retryable: model refused");
    assert_eq!(first.calls.load(Ordering::SeqCst), 2);

    // Second run over the same state: the done record covers the
    // succeeded key, so only the failed one is retried
    let (summarizer, calls) = QueueSummarizer::new(vec![Ok(sample_summary("Second pass."))]);
    let caller = RateLimitedCaller::new(
        Arc::new(summarizer),
        ResponseCache::new(first._home.path().join("cache"), 30),
        fast_policy(),
    );
    let pipeline = BatchPipeline::new(
        Arc::new(StaticSource { items }),
        Arc::new(NoExtractor),
        VaultStore::new(first.vault.path()),
        first.paths.clone(),
        first._home.path().join("pdfs"),
    )
    .with_caller(caller);

    let summary = pipeline.run(None, &serial_config()).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.failed.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drain_then_resume_completes_the_queue() {
    let items = vec![
        item("AAAA1111", "First", "Abstract one."),
        item("BBBB2222", "Second", "Abstract two."),
    ];

    // Stop before anything is submitted: the whole queue drains into
    // the checkpoint
    let stopped = setup(items.clone(), Vec::new());
    stopped.pipeline.stop_signal().trigger();
    let summary = stopped.pipeline.run(None, &serial_config()).await.unwrap();
    assert!(summary.drained);
    assert_eq!(summary.processed(), 0);

    let checkpoint = Checkpoint::load(&stopped.paths.checkpoint).await.unwrap();
    assert_eq!(checkpoint.pending_queue.len(), 2);

    // Resume picks the queue back up and finishes both items
    let (summarizer, _calls) = QueueSummarizer::new(vec![
        Ok(sample_summary("One.")),
        Ok(sample_summary("Two.")),
    ]);
    let caller = RateLimitedCaller::new(
        Arc::new(summarizer),
        ResponseCache::new(stopped._home.path().join("cache"), 30),
        fast_policy(),
    );
    let pipeline = BatchPipeline::new(
        Arc::new(StaticSource { items }),
        Arc::new(NoExtractor),
        VaultStore::new(stopped.vault.path()),
        stopped.paths.clone(),
        stopped._home.path().join("pdfs"),
    )
    .with_caller(caller);

    let config = StageConfig {
        resume: true,
        ..serial_config()
    };
    let summary = pipeline.run(None, &config).await.unwrap();
    assert!(!summary.drained);
    assert_eq!(summary.succeeded, 2);

    // Natural completion clears the checkpoint
    assert!(Checkpoint::load(&stopped.paths.checkpoint).await.is_none());
}

#[tokio::test]
async fn test_panicking_worker_is_reported_as_failed() {
    let home = TempDir::new().unwrap();
    let vault = TempDir::new().unwrap();
    let paths = StatePaths {
        checkpoint: home.path().join("checkpoint.json"),
        done: home.path().join("done.txt"),
    };

    let items = vec![
        item("AAAA1111", "Doomed Paper", "The first abstract."),
        item("BBBB2222", "Fine Paper", "The second abstract."),
    ];
    let caller = RateLimitedCaller::new(
        Arc::new(PanickingSummarizer {
            calls: Arc::new(AtomicU32::new(0)),
        }),
        ResponseCache::new(home.path().join("cache"), 30),
        fast_policy(),
    );
    let pipeline = BatchPipeline::new(
        Arc::new(StaticSource { items }),
        Arc::new(NoExtractor),
        VaultStore::new(vault.path()),
        paths.clone(),
        home.path().join("pdfs"),
    )
    .with_caller(caller);

    // The lost worker must not stall the run; the second item still
    // completes
    let summary = pipeline.run(None, &serial_config()).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].key, "AAAA1111");
    assert_eq!(summary.failed[0].reason, "worker panicked");

    let done = DoneRecord::load(&paths.done).await.unwrap();
    assert!(done.contains("BBBB2222"));
    assert!(!done.contains("AAAA1111"));
}

#[tokio::test]
async fn test_without_caller_notes_get_placeholder() {
    let home = TempDir::new().unwrap();
    let vault = TempDir::new().unwrap();
    let paths = StatePaths {
        checkpoint: home.path().join("checkpoint.json"),
        done: home.path().join("done.txt"),
    };

    let mut tagged = item("AAAA1111", "Untouched Paper", "Some abstract.");
    tagged.tags = vec!["biology".to_string()];

    let pipeline = BatchPipeline::new(
        Arc::new(StaticSource { items: vec![tagged] }),
        Arc::new(NoExtractor),
        VaultStore::new(vault.path()),
        paths,
        home.path().join("pdfs"),
    );

    let summary = pipeline.run(None, &serial_config()).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let note = vault.path().join("Uncategorized/Untouched Paper_AAAA1111.md");
    let content = std::fs::read_to_string(note).unwrap();
    assert!(content.contains("No text available for summarization."));
    assert!(content.contains("biology"));
}
