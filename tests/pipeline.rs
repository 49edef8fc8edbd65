//! End-to-end pipeline tests against an in-process embedding provider.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use chat_search::embedding::EmbeddingProvider;
use chat_search::error::{Error, Result};
use chat_search::indexer::{IncrementalIndexer, IndexOptions};
use chat_search::models::{Message, ThreadRecord};
use chat_search::similarity::SimilarityIndex;
use chat_search::store::{self, read_generation, Generation, IndexStore};
use chat_search::threads::reconstruct;

const KEY: &str = "embeddings";

/// Deterministic provider: vector = [text length, call index], with an
/// optional scripted failure on the n-th call.
struct FakeProvider {
    calls: AtomicUsize,
    texts_seen: Mutex<Vec<String>>,
    fail_on_call: Option<usize>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts_seen: Mutex::new(Vec::new()),
            fail_on_call: None,
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(Error::CollaboratorTransient("rate limited".into()));
        }
        self.texts_seen.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, call as f32])
            .collect())
    }
}

fn record(n: usize) -> ThreadRecord {
    ThreadRecord {
        text: format!("thread body number {n}"),
        urls: vec![format!("https://t.me/chat/{n}")],
        source: Some("chat".into()),
        pub_time: Some(1_700_000_000 + n as i64),
    }
}

fn generation(dir: &TempDir, name: &str) -> Generation {
    Generation::new(
        dir.path().join(format!("{name}.vec")),
        dir.path().join(format!("{name}.jsonl")),
    )
}

fn options(batch_size: usize) -> IndexOptions {
    IndexOptions {
        batch_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_indexing_twice_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(3));

    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    let first = indexer.index((0..7).map(record), &mut store).await.unwrap();
    assert_eq!(first.embedded, 7);
    assert_eq!(first.batches, 3);
    assert_eq!(provider.calls(), 3);

    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    let second = indexer.index((0..7).map(record), &mut store).await.unwrap();
    assert_eq!(second.embedded, 0);
    assert_eq!(second.skipped, 7);
    assert_eq!(second.rows, 7);
    assert_eq!(provider.calls(), 3);

    assert_eq!(read_generation(&gen, KEY).unwrap().rows(), 7);
}

#[tokio::test]
async fn test_only_new_records_reach_the_provider() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(16));

    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    indexer.index((0..3).map(record), &mut store).await.unwrap();
    provider.texts_seen.lock().unwrap().clear();

    let report = indexer
        .index([record(1), record(5), record(2), record(6)], &mut store)
        .await
        .unwrap();
    assert_eq!(report.embedded, 2);
    assert_eq!(
        *provider.texts_seen.lock().unwrap(),
        vec!["thread body number 5", "thread body number 6"]
    );

    let data = read_generation(&gen, KEY).unwrap();
    let texts: Vec<&str> = data.records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts[3..], ["thread body number 5", "thread body number 6"]);
}

#[tokio::test]
async fn test_failed_batch_keeps_prior_batches_and_resumes() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");

    let failing = FakeProvider::failing_on(3);
    let indexer = IncrementalIndexer::new(&failing, options(2));
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    let err = indexer
        .index((0..9).map(record), &mut store)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.rows(), 4);
    drop(store);

    let data = read_generation(&gen, KEY).unwrap();
    assert_eq!(data.rows(), 4);

    let healthy = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&healthy, options(2));
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    let report = indexer.index((0..9).map(record), &mut store).await.unwrap();
    assert_eq!(report.skipped, 4);
    assert_eq!(report.embedded, 5);
    assert_eq!(healthy.calls(), 3);
    assert_eq!(
        healthy.texts_seen.lock().unwrap()[0],
        "thread body number 4"
    );
}

#[tokio::test]
async fn test_reply_already_inside_a_thread_is_not_reembedded() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(4));
    let thread = |text: &str, urls: &[&str]| ThreadRecord {
        text: text.into(),
        urls: urls.iter().map(|u| u.to_string()).collect(),
        source: None,
        pub_time: None,
    };

    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    indexer
        .index([thread("root\n  reply", &["u/1", "u/2"])], &mut store)
        .await
        .unwrap();

    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    let report = indexer
        .index([thread("reply", &["u/2"])], &mut store)
        .await
        .unwrap();
    assert_eq!(report.embedded, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rows, 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_rows_stay_paired_with_metadata() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(4));
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    indexer.index((0..12).map(record), &mut store).await.unwrap();

    let data = read_generation(&gen, KEY).unwrap();
    for (i, rec) in data.records.iter().enumerate() {
        assert_eq!(rec, &record(i));
        assert_eq!(data.vectors[i * 2], rec.text.len() as f32);
        assert_eq!(data.vectors[i * 2 + 1], (i / 4 + 1) as f32);
    }
}

#[tokio::test]
async fn test_merged_generations_stay_paired_and_searchable() {
    let dir = TempDir::new().unwrap();
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(8));

    let a = generation(&dir, "a");
    let mut store = IndexStore::open(a.clone(), KEY).unwrap();
    indexer.index((0..3).map(record), &mut store).await.unwrap();

    let b = generation(&dir, "b");
    let mut store = IndexStore::open(b.clone(), KEY).unwrap();
    indexer.index((100..102).map(record), &mut store).await.unwrap();

    let served = generation(&dir, "served");
    let staged = served.staging();
    assert_eq!(store::merge(&[a, b], KEY, &staged).unwrap(), 5);
    store::swap(&staged, &served, KEY).unwrap();

    let data = read_generation(&served, KEY).unwrap();
    let expected: Vec<ThreadRecord> = (0..3).chain(100..102).map(record).collect();
    assert_eq!(data.records, expected);
    for (i, rec) in data.records.iter().enumerate() {
        assert_eq!(data.vectors[i * 2], rec.text.len() as f32);
    }

    let index = SimilarityIndex::load(&served, KEY).unwrap();
    assert_eq!(index.len(), 5);
    assert_eq!(index.find_similar(&[1.0, 0.0], 10).unwrap().len(), 5);
}

#[tokio::test]
async fn test_reconstructed_threads_index_end_to_end() {
    let messages = vec![
        Message {
            id: 10,
            source: Some("chat".into()),
            text: "Is there a way to make serde skip empty vectors when serializing?".into(),
            reply_to: None,
            pub_time: Some(1_700_000_000),
            url: Some("https://t.me/chat/10".into()),
        },
        Message {
            id: 11,
            source: Some("chat".into()),
            text: "skip_serializing_if = \"Vec::is_empty\"".into(),
            reply_to: Some(10),
            pub_time: Some(1_700_000_030),
            url: Some("https://t.me/chat/11".into()),
        },
    ];
    let records: Vec<ThreadRecord> = reconstruct(messages, 50).collect();
    assert_eq!(records.len(), 1);

    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let indexer = IncrementalIndexer::new(&provider, options(16));
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    indexer.index(records.clone(), &mut store).await.unwrap();

    let index = SimilarityIndex::load(&gen, KEY).unwrap();
    let hits = index.search(&[records[0].text.len() as f32, 1.0], 1).unwrap();
    assert_eq!(hits[0].urls, records[0].urls);
    assert!((hits[0].similarity - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_provider_dimension_change_is_rejected_before_embedding() {
    struct WideProvider;

    #[async_trait]
    impl EmbeddingProvider for WideProvider {
        fn model_name(&self) -> &str {
            "wide"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            panic!("must not be called");
        }
    }

    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let provider = FakeProvider::new();
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    IncrementalIndexer::new(&provider, options(4))
        .index((0..2).map(record), &mut store)
        .await
        .unwrap();

    let err = IncrementalIndexer::new(&WideProvider, options(4))
        .index((2..4).map(record), &mut store)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: 2,
            actual: 3
        }
    ));
}

#[test]
fn test_mismatched_artifacts_refuse_to_load() {
    let dir = TempDir::new().unwrap();
    let gen = generation(&dir, "idx");
    let mut store = IndexStore::open(gen.clone(), KEY).unwrap();
    store
        .append_batch(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[record(0), record(1)])
        .unwrap();
    drop(store);

    // A hand-edited generation: checkpoint gone, one metadata line dropped.
    std::fs::remove_file(gen.checkpoint()).unwrap();
    let meta = std::fs::read_to_string(&gen.metadata).unwrap();
    let first_line = meta.lines().next().unwrap();
    std::fs::write(&gen.metadata, format!("{first_line}\n")).unwrap();

    assert!(matches!(
        SimilarityIndex::load(&gen, KEY),
        Err(Error::Consistency(_))
    ));
}
