//! Exact cosine-similarity search over one loaded generation.
//!
//! Rows are L2-normalized once at construction, so a query costs one
//! matrix-vector product plus a sort. The index is immutable after
//! construction and can be shared across threads behind an `Arc`.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{Error, Result};
use crate::models::{SearchHit, ThreadRecord};
use crate::store::{read_generation, Generation};

const SECONDS_PER_DAY: i64 = 86_400;

pub struct SimilarityIndex {
    /// Unit-length rows; zero rows stay zero.
    matrix: Array2<f32>,
    records: Vec<ThreadRecord>,
    priors: Option<Vec<f32>>,
}

impl SimilarityIndex {
    /// Build from a row-major vector buffer and its parallel records.
    pub fn new(dims: usize, vectors: Vec<f32>, records: Vec<ThreadRecord>) -> Result<Self> {
        let rows = if dims == 0 { 0 } else { vectors.len() / dims };
        if rows * dims != vectors.len() || rows != records.len() {
            return Err(Error::consistency(rows, records.len()));
        }
        let mut matrix = Array2::from_shape_vec((rows, dims), vectors)
            .map_err(|e| Error::Consistency(e.to_string()))?;
        for mut row in matrix.rows_mut() {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row /= norm;
            }
        }
        Ok(Self {
            matrix,
            records,
            priors: None,
        })
    }

    /// Load the committed rows of a generation.
    ///
    /// Both artifacts must exist. A missing generation is a load failure,
    /// never an empty index.
    pub fn load(generation: &Generation, array_key: &str) -> Result<Self> {
        for path in [&generation.vectors, &generation.metadata] {
            if !path.exists() {
                return Err(Error::Consistency(format!(
                    "index artifact {} is missing",
                    path.display()
                )));
            }
        }
        let data = read_generation(generation, array_key)?;
        Self::new(data.dims, data.vectors, data.records)
    }

    /// Weight served scores by recency and length priors.
    ///
    /// Recency is measured in whole days against the newest `pub_time` in
    /// the index. Rows without a timestamp get a neutral recency prior.
    pub fn with_ranking_priors(mut self) -> Self {
        let newest = self.records.iter().filter_map(|r| r.pub_time).max();
        let priors = self
            .records
            .iter()
            .map(|record| {
                let recency = match (newest, record.pub_time) {
                    (Some(newest), Some(t)) => {
                        let age_days = ((newest - t) / SECONDS_PER_DAY) as f32;
                        0.9 + 0.1 * (365.0 - age_days).max(0.0) / 365.0
                    }
                    _ => 1.0,
                };
                let len = record.text.chars().count().min(300) as f32;
                let length = 0.85 + 0.15 * len / 300.0;
                recency * length
            })
            .collect();
        self.priors = Some(priors);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.records
    }

    /// Top-`k` rows by raw cosine similarity, as `(row, similarity)`.
    ///
    /// Descending by similarity, ties by row ascending. An empty index
    /// answers every query with no rows.
    pub fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let scores = self.cosine_scores(query)?;
        Ok(top_k(scores.iter().copied(), k))
    }

    /// Top-`k` hits with their metadata, scored with ranking priors when
    /// enabled.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let scores = self.cosine_scores(query)?;
        let ranked = match &self.priors {
            Some(priors) => top_k(scores.iter().zip(priors).map(|(s, p)| s * p), k),
            None => top_k(scores.iter().copied(), k),
        };

        Ok(ranked
            .into_iter()
            .map(|(row, similarity)| {
                let record = &self.records[row];
                SearchHit {
                    row,
                    text: record.text.clone(),
                    urls: record.urls.clone(),
                    source: record.source.clone(),
                    pub_time: record.pub_time,
                    similarity,
                }
            })
            .collect())
    }

    fn cosine_scores(&self, query: &[f32]) -> Result<Array1<f32>> {
        if query.len() != self.dims() {
            return Err(Error::DimensionMismatch {
                expected: self.dims(),
                actual: query.len(),
            });
        }
        let query = ArrayView1::from(query);
        let norm = query.dot(&query).sqrt();
        if norm == 0.0 {
            return Ok(Array1::zeros(self.len()));
        }
        Ok(self
            .matrix
            .dot(&query)
            .mapv(|s| (s / norm).clamp(-1.0, 1.0)))
    }
}

fn top_k(scores: impl Iterator<Item = f32>, k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}
