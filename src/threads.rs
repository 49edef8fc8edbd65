//! Thread reconstruction from flat message streams.
//!
//! Messages arrive as a flat list where replies point at their parent by
//! id. [`reconstruct`] rebuilds the reply trees and renders each one as a
//! [`ThreadRecord`]: one line per message, indented two spaces per level,
//! plus the message URLs in the same order.
//!
//! # Edge-case policy
//!
//! - A reply whose parent is not in the batch becomes a root of its own tree.
//! - Cyclic reply chains are broken at the earliest-arriving member of the
//!   cycle; a message is never rendered twice.
//! - Siblings are ordered by arrival, never by id.
//!
//! The graph is an arena of messages indexed by position, with a separate
//! child-list index. Traversal uses an explicit stack, so deep reply chains
//! cannot overflow the call stack.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Message, MessageKey, ThreadRecord};

/// Default minimum rendered length (in characters) of an emitted thread.
pub const DEFAULT_MIN_TEXT_LENGTH: usize = 50;

/// Rebuild reply trees from `messages` and render them lazily.
///
/// Trees are emitted in arrival order of their roots. Threads whose
/// rendered text is shorter than `min_text_length` characters are skipped.
pub fn reconstruct(messages: Vec<Message>, min_text_length: usize) -> Threads {
    let mut index: HashMap<MessageKey, usize> = HashMap::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        index.entry(msg.key()).or_insert(i);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); messages.len()];
    let mut parent: Vec<Option<usize>> = vec![None; messages.len()];
    for (i, msg) in messages.iter().enumerate() {
        if let Some(&p) = msg.parent_key().as_ref().and_then(|k| index.get(k)) {
            if p != i {
                children[p].push(i);
                parent[i] = Some(p);
            }
        }
    }

    Threads {
        visited: vec![false; messages.len()],
        messages,
        children,
        parent,
        cursor: 0,
        orphan_pass: false,
        min_text_length,
    }
}

/// Lazy sequence of rendered threads produced by [`reconstruct`].
pub struct Threads {
    messages: Vec<Message>,
    children: Vec<Vec<usize>>,
    parent: Vec<Option<usize>>,
    visited: Vec<bool>,
    cursor: usize,
    /// Second pass: messages unreachable from any root (reply cycles).
    orphan_pass: bool,
    min_text_length: usize,
}

impl Threads {
    fn next_root(&mut self) -> Option<usize> {
        loop {
            if self.cursor >= self.messages.len() {
                if self.orphan_pass {
                    return None;
                }
                self.orphan_pass = true;
                self.cursor = 0;
                continue;
            }
            let i = self.cursor;
            self.cursor += 1;
            if self.visited[i] {
                continue;
            }
            if !self.orphan_pass {
                if self.parent[i].is_none() {
                    return Some(i);
                }
                continue;
            }
            return Some(self.cycle_root(i));
        }
    }

    /// Earliest-arriving member of the cycle reached by walking up from `start`.
    fn cycle_root(&self, start: usize) -> usize {
        let mut seen_at: HashMap<usize, usize> = HashMap::new();
        let mut path = Vec::new();
        let mut current = start;
        loop {
            if let Some(&pos) = seen_at.get(&current) {
                return path[pos..].iter().copied().min().unwrap_or(start);
            }
            seen_at.insert(current, path.len());
            path.push(current);
            match self.parent[current] {
                Some(p) if !self.visited[p] => current = p,
                _ => return current,
            }
        }
    }

    fn render(&mut self, root: usize) -> ThreadRecord {
        let mut lines = Vec::new();
        let mut urls = Vec::new();
        let mut stack = vec![(root, 0usize)];

        while let Some((i, depth)) = stack.pop() {
            if self.visited[i] {
                continue;
            }
            self.visited[i] = true;

            let msg = &self.messages[i];
            lines.push(format!(
                "{}{}",
                "  ".repeat(depth),
                normalize_whitespace(&msg.text)
            ));
            if let Some(url) = &msg.url {
                urls.push(url.clone());
            }
            for &child in self.children[i].iter().rev() {
                if !self.visited[child] {
                    stack.push((child, depth + 1));
                }
            }
        }

        let root_msg = &self.messages[root];
        ThreadRecord {
            text: lines.join("\n"),
            urls,
            source: root_msg.source.clone(),
            pub_time: root_msg.pub_time,
        }
    }
}

impl Iterator for Threads {
    type Item = ThreadRecord;

    fn next(&mut self) -> Option<ThreadRecord> {
        loop {
            let root = self.next_root()?;
            let record = self.render(root);
            if record.text.chars().count() >= self.min_text_length {
                return Some(record);
            }
        }
    }
}

/// Collapse every whitespace run (newlines included) into a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ Message input ============

/// Messages read from an export, plus how many records were skipped.
#[derive(Debug, Default)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
    pub skipped: usize,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<i64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Value,
    #[serde(default)]
    reply_to_message_id: Option<i64>,
    #[serde(default, alias = "chat_id")]
    source: Option<Value>,
    #[serde(default)]
    pub_time: Option<i64>,
    #[serde(default)]
    url: Option<String>,
}

impl RawMessage {
    fn into_message(self) -> Option<Message> {
        if self.kind.as_deref().unwrap_or("message") != "message" {
            return None;
        }
        let id = self.id.filter(|id| *id != 0)?;
        let text = extract_text(&self.text);
        if text.trim().is_empty() {
            return None;
        }
        Some(Message {
            id,
            source: self.source.and_then(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            }),
            text,
            reply_to: self.reply_to_message_id.filter(|id| *id != 0),
            pub_time: self.pub_time,
            url: self.url.filter(|u| !u.is_empty()),
        })
    }
}

/// Exports store text either as a plain string or as a list of fragments
/// where only the plain-string fragments carry body text.
fn extract_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .collect::<String>(),
        _ => String::new(),
    }
}

#[derive(Deserialize)]
struct MessageExport {
    #[serde(default)]
    messages: Vec<Value>,
}

/// Read messages from a `.json` export (`{"messages": [...]}`) or a
/// `.jsonl` stream with one message object per line.
pub fn load_messages(path: &Path) -> Result<MessageBatch> {
    let values = read_records(path, |reader| {
        let export: MessageExport = serde_json::from_reader(reader)?;
        Ok(export.messages)
    })?;

    let mut batch = MessageBatch::default();
    for value in values {
        match serde_json::from_value::<RawMessage>(value)
            .ok()
            .and_then(RawMessage::into_message)
        {
            Some(msg) => batch.messages.push(msg),
            None => batch.skipped += 1,
        }
    }
    tracing::debug!(
        path = %path.display(),
        loaded = batch.messages.len(),
        skipped = batch.skipped,
        "loaded messages"
    );
    Ok(batch)
}

#[derive(Deserialize)]
struct ThreadExport {
    threads: Vec<Value>,
}

/// Read a thread stream written by [`write_threads`] (`.jsonl`), or a
/// `.json` document of the form `{"threads": [...]}`.
pub fn load_threads(path: &Path) -> Result<Vec<ThreadRecord>> {
    let values = read_records(path, |reader| {
        let export: ThreadExport = serde_json::from_reader(reader)?;
        Ok(export.threads)
    })?;
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v).map_err(|e| {
                Error::MalformedInput(format!("{}: thread {}: {}", path.display(), i + 1, e))
            })
        })
        .collect()
}

/// Write threads as JSONL. The file appears atomically.
pub fn write_threads<I, R>(path: &Path, records: I) -> Result<usize>
where
    I: IntoIterator<Item = R>,
    R: Borrow<ThreadRecord>,
{
    let tmp = path.with_extension("jsonl.tmp");
    let mut written = 0usize;
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for record in records {
            serde_json::to_writer(&mut writer, record.borrow())?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(written)
}

fn read_records<F>(path: &Path, parse_document: F) -> Result<Vec<Value>>
where
    F: FnOnce(BufReader<File>) -> Result<Vec<Value>>,
{
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_document(reader),
        Some("jsonl") => {
            let mut values = Vec::new();
            for (i, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(&line).map_err(|e| {
                    Error::MalformedInput(format!("{}:{}: {}", path.display(), i + 1, e))
                })?;
                values.push(value);
            }
            Ok(values)
        }
        _ => Err(Error::MalformedInput(format!(
            "{}: expected a .json or .jsonl file",
            path.display()
        ))),
    }
}
