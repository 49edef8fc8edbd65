//! Incremental embedding of thread records into an index generation.
//!
//! Records whose dedup key is already committed are skipped before any
//! embedding call is made. The rest are embedded in batches, strictly one
//! batch in flight at a time, and each batch is committed to the store
//! before the next is submitted. A failed batch stops the run; everything
//! committed before it stays, so re-running resumes where it stopped.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{DedupKey, ThreadRecord};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};
use crate::store::IndexStore;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub batch_size: usize,
    /// Only consider the first N input records.
    pub max_records: Option<usize>,
    /// Upper bound on a single embedding call.
    pub call_timeout: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_records: None,
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// Records that still need embedding, in input order.
#[derive(Debug, Default)]
pub struct Plan {
    pub pending: Vec<ThreadRecord>,
    /// Already committed, or repeated earlier in the same input.
    pub skipped: usize,
}

/// Split the (capped) input into already-indexed and pending records.
pub fn plan<I>(records: I, store: &IndexStore, max_records: Option<usize>) -> Plan
where
    I: IntoIterator<Item = ThreadRecord>,
{
    let mut seen: HashSet<DedupKey> = HashSet::new();
    let mut plan = Plan::default();
    let capped = records.into_iter().take(max_records.unwrap_or(usize::MAX));
    for record in capped {
        let key = record.dedup_key();
        if store.contains(&key) || seen.contains(&key) {
            plan.skipped += 1;
            continue;
        }
        seen.extend(record.indexed_keys());
        plan.pending.push(record);
    }
    plan
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexReport {
    /// Committed rows before the run.
    pub existing: usize,
    pub skipped: usize,
    pub embedded: usize,
    pub batches: usize,
    /// Committed rows after the run.
    pub rows: usize,
}

pub struct IncrementalIndexer<'a> {
    provider: &'a dyn EmbeddingProvider,
    options: IndexOptions,
    reporter: Box<dyn IndexProgressReporter + 'a>,
}

impl<'a> IncrementalIndexer<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider, options: IndexOptions) -> Self {
        Self {
            provider,
            options,
            reporter: Box::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn IndexProgressReporter + 'a>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Embed and append every record not already in `store`.
    ///
    /// Running twice over the same input appends nothing the second time
    /// and makes no embedding calls.
    pub async fn index<I>(&self, records: I, store: &mut IndexStore) -> Result<IndexReport>
    where
        I: IntoIterator<Item = ThreadRecord>,
    {
        let existing = store.rows();
        let plan = plan(records, store, self.options.max_records);
        let total = plan.pending.len();
        let mut report = IndexReport {
            existing,
            skipped: plan.skipped,
            rows: existing,
            ..Default::default()
        };

        self.reporter.report(IndexProgressEvent::Planned {
            existing: existing as u64,
            skipped: plan.skipped as u64,
            pending: total as u64,
        });
        tracing::info!(existing, skipped = plan.skipped, pending = total, "index plan");

        if total == 0 {
            return Ok(report);
        }

        if let Some(dims) = store.dims() {
            if self.provider.dims() != dims {
                return Err(Error::DimensionMismatch {
                    expected: dims,
                    actual: self.provider.dims(),
                });
            }
        }

        for batch in plan.pending.chunks(self.options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();

            let vectors = match self.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    tracing::error!(
                        batch = report.batches + 1,
                        committed = report.embedded,
                        remaining = total - report.embedded,
                        error = %e,
                        "embedding batch failed; committed batches are kept"
                    );
                    return Err(e);
                }
            };

            store.append_batch(&vectors, batch)?;
            report.batches += 1;
            report.embedded += batch.len();
            report.rows = store.rows();

            self.reporter.report(IndexProgressEvent::Committed {
                batch: report.batches as u64,
                n: report.embedded as u64,
                total: total as u64,
            });
        }

        Ok(report)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = tokio::time::timeout(self.options.call_timeout, self.provider.embed(texts))
            .await
            .map_err(|_| {
                Error::CollaboratorTransient(format!(
                    "embedding call timed out after {}s",
                    self.options.call_timeout.as_secs()
                ))
            })??;

        if vectors.len() != texts.len() {
            return Err(Error::CollaboratorPermanent(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Generation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct SlowProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn record(n: usize) -> ThreadRecord {
        ThreadRecord {
            text: format!("thread number {n}"),
            urls: vec![format!("https://t.me/c/{n}")],
            source: None,
            pub_time: None,
        }
    }

    fn open_store(dir: &TempDir) -> IndexStore {
        IndexStore::open(
            Generation::new(dir.path().join("idx.vec"), dir.path().join("idx.jsonl")),
            "embeddings",
        )
        .unwrap()
    }

    #[test]
    fn test_plan_skips_repeats_within_input() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let plan = plan(vec![record(1), record(2), record(1)], &store, None);
        assert_eq!(plan.pending.len(), 2);
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_plan_skips_reply_of_earlier_thread_in_input() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut thread = record(1);
        thread.urls.push("https://t.me/c/2".into());
        let plan = plan(vec![thread, record(2)], &store, None);
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_plan_caps_input_before_dedup() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let plan = plan((0..10).map(record), &store, Some(3));
        assert_eq!(plan.pending.len(), 3);
        assert_eq!(plan.pending[2].text, "thread number 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_as_transient() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let provider = SlowProvider {
            calls: AtomicUsize::new(0),
        };
        let indexer = IncrementalIndexer::new(
            &provider,
            IndexOptions {
                batch_size: 4,
                max_records: None,
                call_timeout: Duration::from_secs(5),
            },
        );

        let err = indexer
            .index((0..8).map(record), &mut store)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.rows(), 0);
    }
}
