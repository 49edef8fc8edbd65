//! `chat-search index` and `chat-search rebuild`.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::embedding;
use crate::indexer::{plan, IncrementalIndexer, IndexOptions, IndexReport};
use crate::progress::ProgressMode;
use crate::store::{self, Generation, IndexStore};
use crate::threads::load_threads;

pub fn served_generation(config: &Config) -> Generation {
    Generation::new(&config.index.vectors_path, &config.index.metadata_path)
}

fn index_options(config: &Config, batch_size: Option<usize>, limit: Option<usize>) -> IndexOptions {
    IndexOptions {
        batch_size: batch_size.unwrap_or(config.embedding.batch_size),
        max_records: limit,
        // Covers the provider's own retries and backoff.
        call_timeout: Duration::from_secs(
            config.embedding.timeout_secs * (u64::from(config.embedding.max_retries) + 1) + 60,
        ),
    }
}

/// Embed thread records missing from the served generation and append them.
pub async fn run_index(
    config: &Config,
    threads_path: &Path,
    batch_size: Option<usize>,
    limit: Option<usize>,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<()> {
    let records = load_threads(threads_path)
        .with_context(|| format!("Failed to read threads from {}", threads_path.display()))?;
    let mut store = IndexStore::open(served_generation(config), &config.index.array_key)?;

    if dry_run {
        let plan = plan(records, &store, limit);
        println!("index (dry-run)");
        println!("  existing rows: {}", store.rows());
        println!("  already indexed: {}", plan.skipped);
        println!("  records needing embeddings: {}", plan.pending.len());
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider = embedding::create_provider(&config.embedding)?;

    let indexer = IncrementalIndexer::new(provider.as_ref(), index_options(config, batch_size, limit))
        .with_reporter(progress.reporter());
    let report = indexer
        .index(records, &mut store)
        .await
        .context("Indexing stopped; committed batches are kept, re-run to resume")?;

    print_report("index", &report);
    Ok(())
}

/// Reindex everything into a fresh generation, then swap it in.
pub async fn run_rebuild(
    config: &Config,
    threads_path: &Path,
    batch_size: Option<usize>,
    limit: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let records = load_threads(threads_path)
        .with_context(|| format!("Failed to read threads from {}", threads_path.display()))?;
    let provider = embedding::create_provider(&config.embedding)?;

    let served = served_generation(config);
    let staged = served.staging();
    let mut store = IndexStore::open(staged.clone(), &config.index.array_key)?;

    let indexer = IncrementalIndexer::new(provider.as_ref(), index_options(config, batch_size, limit))
        .with_reporter(progress.reporter());
    let report = indexer
        .index(records, &mut store)
        .await
        .with_context(|| {
            format!(
                "Rebuild failed; served generation untouched, partial build left at {}",
                staged.vectors.display()
            )
        })?;

    if report.rows == 0 {
        bail!("No records to index; served generation left unchanged");
    }

    store::swap(&staged, &served, &config.index.array_key)?;
    print_report("rebuild", &report);
    println!("  previous generation kept at {}", served.old().vectors.display());
    Ok(())
}

fn print_report(command: &str, report: &IndexReport) {
    println!("{}", command);
    println!("  existing rows: {}", report.existing);
    println!("  already indexed: {}", report.skipped);
    println!("  embedded: {}", report.embedded);
    println!("  batches: {}", report.batches);
    println!("  total rows: {}", report.rows);
}
