//! Query path: embed the query, rank rows, optionally synthesize an answer.
//!
//! A [`Searcher`] owns one immutable [`SimilarityIndex`] snapshot together
//! with the embedding and generation collaborators. The CLI builds one per
//! invocation; the HTTP server builds one at startup and shares it.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::embed_cmd::served_generation;
use crate::embedding::{self, embed_query, EmbeddingProvider};
use crate::error::Error;
use crate::generation::{build_answer_prompt, create_generator, TextGenerator};
use crate::models::SearchHit;
use crate::similarity::SimilarityIndex;

pub struct Searcher {
    index: Arc<SimilarityIndex>,
    provider: Box<dyn EmbeddingProvider>,
    generator: Option<Box<dyn TextGenerator>>,
    max_top_k: usize,
}

impl Searcher {
    pub fn new(
        index: Arc<SimilarityIndex>,
        provider: Box<dyn EmbeddingProvider>,
        generator: Option<Box<dyn TextGenerator>>,
        max_top_k: usize,
    ) -> Self {
        Self {
            index,
            provider,
            generator,
            max_top_k,
        }
    }

    /// Load the served generation and build collaborators from config.
    ///
    /// Fails if the index does not pass its consistency checks.
    pub fn from_config(config: &Config) -> Result<Self> {
        let served = served_generation(config);
        let mut index = SimilarityIndex::load(&served, &config.index.array_key)
            .with_context(|| format!("Failed to load index {}", served.vectors.display()))?;
        if config.retrieval.recency_weighting {
            index = index.with_ranking_priors();
        }

        let provider = embedding::create_provider(&config.embedding)?;
        if !index.is_empty() && config.embedding.is_enabled() && provider.dims() != index.dims() {
            anyhow::bail!(
                "embedding.dims is {} but the index holds {}-dimensional vectors",
                provider.dims(),
                index.dims()
            );
        }
        let generator = if config.generation.is_enabled() {
            Some(create_generator(&config.generation)?)
        } else {
            None
        };

        tracing::info!(rows = index.len(), dims = index.dims(), "index loaded");
        Ok(Self::new(
            Arc::new(index),
            provider,
            generator,
            config.retrieval.max_top_k,
        ))
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    /// Top-`top_k` hits for a text query. `top_k` is capped at `max_top_k`.
    pub async fn search(&self, query: &str, top_k: usize) -> crate::error::Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::MalformedInput("query must not be empty".to_string()));
        }
        let top_k = top_k.min(self.max_top_k);
        let vector = embed_query(self.provider.as_ref(), query).await?;
        self.index.search(&vector, top_k)
    }

    /// Summarize hits with the generator. `None` when generation is disabled.
    pub async fn answer(
        &self,
        query: &str,
        hits: &[SearchHit],
    ) -> crate::error::Result<Option<String>> {
        match &self.generator {
            Some(generator) => {
                let prompt = build_answer_prompt(query, hits);
                generator.generate(&prompt).await.map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Run a search from the CLI and print ranked hits.
pub async fn run_search(config: &Config, query: &str, top_k: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        anyhow::bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let searcher = Searcher::from_config(config)?;
    let hits = searcher
        .search(query, top_k.unwrap_or(config.retrieval.top_k))
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.3}] row {}", i + 1, hit.similarity, hit.row);
        for (line, urls) in hit.urls_by_line() {
            match urls.first() {
                Some(url) => println!("    {}  <{}>", line, url),
                None => println!("    {}", line),
            }
        }
        println!();
    }

    if let Some(answer) = searcher.answer(query, &hits).await? {
        println!("Answer:");
        println!("{}", answer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThreadRecord;
    use async_trait::async_trait;

    struct AxisProvider;

    #[async_trait]
    impl EmbeddingProvider for AxisProvider {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("alpha") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
    }

    fn searcher(max_top_k: usize) -> Searcher {
        let records = ["alpha thread", "beta thread"]
            .iter()
            .map(|t| ThreadRecord {
                text: t.to_string(),
                urls: vec![],
                source: None,
                pub_time: None,
            })
            .collect();
        let index = SimilarityIndex::new(2, vec![1.0, 0.0, 0.0, 1.0], records).unwrap();
        Searcher::new(Arc::new(index), Box::new(AxisProvider), None, max_top_k)
    }

    #[tokio::test]
    async fn test_search_embeds_and_ranks() {
        let hits = searcher(10).search("alpha?", 2).await.unwrap();
        assert_eq!(hits[0].text, "alpha thread");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_top_k_capped() {
        let hits = searcher(1).search("beta", 50).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "beta thread");
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let err = searcher(10).search("   ", 3).await.unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_answer_none_without_generator() {
        assert!(searcher(10).answer("q", &[]).await.unwrap().is_none());
    }
}
