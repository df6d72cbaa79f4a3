//! Incremental embedding pipeline.
//!
//! Drives archive → embedding engine → index writer in bounded batches and
//! persists the cursor once at the end of the run:
//!
//! ```text
//! Idle → Reading → (Embedding → Writing)* → Advancing → Done
//!                          any state → Failed
//! ```
//!
//! The new watermark is the highest record id fetched in the run, including
//! records whose file could not be resolved or embedded. Per-item failures
//! are counted and skipped; an unreachable index or a cursor that cannot be
//! saved fails the whole run without touching the cursor.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::archive::ArchiveReader;
use crate::config::Config;
use crate::cursor::CursorStore;
use crate::embedding::{create_embedder, EmbeddingEngine};
use crate::index::elastic::ElasticIndex;
use crate::index::{DocumentIndex, IndexError};
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Reading,
    Embedding,
    Writing,
    Advancing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Reading => "reading",
            RunState::Embedding => "embedding",
            RunState::Writing => "writing",
            RunState::Advancing => "advancing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Ignore the stored watermark and start from 0.
    pub full: bool,
    pub batch_size: usize,
    /// Global cap on archive rows fetched.
    pub limit: Option<usize>,
    /// Read and embed, but write nothing and leave the cursor alone.
    pub dry_run: bool,
    /// Checked between batches; when set the run stops early.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            full: false,
            batch_size: 50,
            limit: None,
            dry_run: false,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Archive rows fetched, resolved or not.
    pub fetched: usize,
    /// Vectors successfully produced.
    pub processed: usize,
    /// Unresolvable files plus embedding failures.
    pub skipped: usize,
    /// Documents the index rejected.
    pub write_failed: usize,
    pub batches: usize,
    pub old_watermark: i64,
    pub new_watermark: i64,
    pub total_processed: u64,
    pub aborted: bool,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn headline(&self) -> String {
        format!("processed: {}, skipped: {}", self.processed, self.skipped)
    }

    pub fn print(&self) {
        if self.dry_run {
            println!("embed (dry-run)");
        } else {
            println!("embed");
        }
        println!("  {}", self.headline());
        println!("  fetched: {}", self.fetched);
        if self.write_failed > 0 {
            println!("  write failures: {}", self.write_failed);
        }
        println!("  watermark: {} -> {}", self.old_watermark, self.new_watermark);
        if !self.dry_run {
            println!("  total embedded (all time): {}", self.total_processed);
        }
        if self.aborted {
            println!("  interrupted: stopped after {} batch(es)", self.batches);
        }
    }
}

/// Collaborators for one run, constructed once by the caller.
pub struct Pipeline<'a> {
    pub reader: &'a ArchiveReader,
    pub engine: &'a EmbeddingEngine,
    pub index: &'a dyn DocumentIndex,
    pub cursor: &'a CursorStore,
    pub progress: &'a dyn RunProgressReporter,
}

impl<'a> Pipeline<'a> {
    pub async fn run(&self, opts: &RunOptions) -> Result<RunSummary> {
        let mut state = RunState::Idle;
        match self.run_inner(opts, &mut state).await {
            Ok(summary) => {
                transition(&mut state, RunState::Done);
                Ok(summary)
            }
            Err(e) => {
                tracing::debug!(state = %state, error = %e, "embed run failed");
                transition(&mut state, RunState::Failed);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, opts: &RunOptions, state: &mut RunState) -> Result<RunSummary> {
        let batch_size = opts.batch_size.max(1);

        if !opts.dry_run {
            self.index.ping().await.with_context(|| {
                format!("Cannot connect to index at {}", self.index.describe())
            })?;
            if self.index.ensure_index(self.engine.dims()).await? {
                tracing::info!(index = %self.index.describe(), "created index");
            }
        }

        let cursor = self.cursor.load();
        let since = if opts.full { 0 } else { cursor.watermark };

        let mut summary = RunSummary {
            old_watermark: cursor.watermark,
            new_watermark: cursor.watermark,
            total_processed: cursor.total_processed,
            dry_run: opts.dry_run,
            ..RunSummary::default()
        };

        transition(state, RunState::Reading);
        self.progress.report(RunProgressEvent::Reading { since });
        let batch = self.reader.read(since, opts.limit).await?;

        if batch.is_empty() {
            tracing::info!(since, "no new images to embed");
            return Ok(summary);
        }

        summary.fetched = batch.fetched();
        summary.skipped = batch.unresolved.len();
        for u in &batch.unresolved {
            tracing::debug!(rowid = u.record_id, locator = %u.locator, "attachment file not found");
        }

        let total = batch.records.len() as u64;
        let mut done = 0u64;
        let mut completed_max: Option<i64> = None;

        for chunk in batch.records.chunks(batch_size) {
            if is_cancelled(opts) {
                summary.aborted = true;
                tracing::warn!(batches = summary.batches, "interrupted, stopping before next batch");
                break;
            }

            transition(state, RunState::Embedding);
            let paths: Vec<_> = chunk.iter().map(|r| r.resource_path.clone()).collect();
            let vectors = self.engine.embed_batch(&paths).await;
            let produced = vectors.iter().filter(|v| v.is_some()).count();
            summary.skipped += chunk.len() - produced;

            let rejected = if opts.dry_run {
                0
            } else {
                transition(state, RunState::Writing);
                match writer::upsert(self.index, chunk, &vectors).await {
                    Ok(report) => report.failed.len().min(produced),
                    Err(e @ (IndexError::Unreachable(_) | IndexError::Auth(_))) => {
                        return Err(e).context("Index became unavailable during the run");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "bulk upsert failed for batch");
                        produced
                    }
                }
            };
            summary.write_failed += rejected;
            summary.processed += produced - rejected;

            summary.batches += 1;
            done += chunk.len() as u64;
            completed_max = completed_max.max(chunk.iter().map(|r| r.record_id).max());
            self.progress.report(RunProgressEvent::Embedding {
                batch: summary.batches,
                n: done,
                total,
            });
        }

        let max_seen = if summary.aborted {
            completed_max
        } else {
            batch.max_record_id()
        };

        let next = cursor.advance(max_seen, summary.processed as u64, chrono::Utc::now());
        summary.new_watermark = next.watermark;
        summary.total_processed = next.total_processed;

        if opts.dry_run {
            return Ok(summary);
        }

        transition(state, RunState::Advancing);
        self.cursor.save(&next)?;
        Ok(summary)
    }
}

/// Run the `embed` command against the configured archive and index.
pub async fn run_embed(
    config: &Config,
    opts: &RunOptions,
    progress: &dyn RunProgressReporter,
) -> Result<RunSummary> {
    if config.embedding.provider != "local" {
        anyhow::bail!(
            "Image embedding requires embedding.provider = \"local\" (got '{}')",
            config.embedding.provider
        );
    }

    let reader = ArchiveReader::open(&config.archive.path).await?;
    let index = ElasticIndex::new(&config.index)?;
    let engine = EmbeddingEngine::new(create_embedder(&config.embedding)?);
    let cursor = CursorStore::new(&config.state.path);

    tracing::info!(
        archive = %config.archive.path.display(),
        index = %index.describe(),
        model = engine.model_name(),
        "starting embed run"
    );

    let pipeline = Pipeline {
        reader: &reader,
        engine: &engine,
        index: &index,
        cursor: &cursor,
        progress,
    };
    let result = pipeline.run(opts).await;
    reader.close().await;
    result
}

/// Exit status for a run killed by a second interrupt (128 + SIGINT).
pub const FORCED_EXIT_CODE: i32 = 130;

/// Turn interrupt signals into cancellation.
///
/// The first signal sets `flag` so the run stops after the current batch.
/// Returns once a second signal arrives; the caller then exits without
/// waiting for the batch. A failing signal source ends the watch.
pub async fn watch_interrupts<F, Fut>(flag: Arc<AtomicBool>, mut next_signal: F) -> Option<i32>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    next_signal().await.ok()?;
    eprintln!("Interrupt received, finishing current batch (Ctrl-C again to abort)...");
    flag.store(true, Ordering::SeqCst);

    next_signal().await.ok()?;
    eprintln!("Second interrupt, aborting without saving the cursor.");
    Some(FORCED_EXIT_CODE)
}

fn is_cancelled(opts: &RunOptions) -> bool {
    opts.cancel
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::SeqCst))
}

fn transition(state: &mut RunState, next: RunState) {
    if *state != next {
        tracing::debug!(from = %state, to = %next, "pipeline state");
        *state = next;
    }
}
