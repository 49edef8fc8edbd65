//! Core data models used throughout chat-search.
//!
//! These types represent the messages, reconstructed threads, and index
//! rows that flow through the reconstruction → indexing → search pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single chat or channel message after normalization.
///
/// Identity is the `(source, id)` pair: message ids are only unique within
/// one chat, so reply references never cross sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub source: Option<String>,
    pub text: String,
    pub reply_to: Option<i64>,
    pub pub_time: Option<i64>,
    pub url: Option<String>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            source: self.source.clone(),
            id: self.id,
        }
    }

    /// Key of the message this one replies to, scoped to the same source.
    pub fn parent_key(&self) -> Option<MessageKey> {
        self.reply_to.map(|id| MessageKey {
            source: self.source.clone(),
            id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub source: Option<String>,
    pub id: i64,
}

/// One reconstructed thread, flattened for persistence.
///
/// `text` holds one line per message, indented two spaces per depth level;
/// `urls` lists the message URLs in the same traversal order. This is also
/// the exact shape of one metadata line in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub text: String,
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_time: Option<i64>,
}

impl ThreadRecord {
    /// Key this record is looked up by when deciding whether to embed it.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::for_record(&self.urls, &self.text)
    }

    /// Keys a committed record answers to: every URL it carries, so a reply
    /// already indexed inside a larger thread is not embedded again on its
    /// own. Records without URLs answer to their text hash.
    pub fn indexed_keys(&self) -> Vec<DedupKey> {
        if self.urls.is_empty() {
            return vec![self.dedup_key()];
        }
        self.urls.iter().cloned().map(DedupKey::Url).collect()
    }

    /// Best-effort assignment of URLs to rendered lines.
    ///
    /// The thread stream does not record which URL belongs to which line, so
    /// the URL list is spread evenly across lines in order. Exact only when
    /// every message carried exactly one URL.
    pub fn urls_by_line(&self) -> Vec<(&str, &[String])> {
        distribute_urls(&self.text, &self.urls)
    }
}

fn distribute_urls<'a>(text: &'a str, urls: &'a [String]) -> Vec<(&'a str, &'a [String])> {
    let lines: Vec<&str> = text.split('\n').collect();
    let per_line = (urls.len() / lines.len()).max(1);
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| {
            let start = (i * per_line).min(urls.len());
            let end = ((i + 1) * per_line).min(urls.len());
            (line, &urls[start..end])
        })
        .collect()
}

/// Exact-match identity used to skip records that are already indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Primary (first) URL of the thread.
    Url(String),
    /// SHA-256 of the rendered text, for threads without any URL.
    TextHash(String),
}

impl DedupKey {
    pub fn for_record(urls: &[String], text: &str) -> Self {
        match urls.first() {
            Some(url) => DedupKey::Url(url.clone()),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                DedupKey::TextHash(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

/// A single ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Row index in the served generation.
    pub row: usize,
    pub text: String,
    pub urls: Vec<String>,
    pub source: Option<String>,
    pub pub_time: Option<i64>,
    pub similarity: f32,
}

impl SearchHit {
    /// See [`ThreadRecord::urls_by_line`].
    pub fn urls_by_line(&self) -> Vec<(&str, &[String])> {
        distribute_urls(&self.text, &self.urls)
    }
}
