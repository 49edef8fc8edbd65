//! Indexing progress reporting.
//!
//! Reports observable progress during `chat-search index` and `rebuild` so
//! users see how many records were skipped as already indexed and how many
//! batches remain. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event for an indexing run.
#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// Existing rows were read and new records partitioned into batches.
    Planned {
        existing: u64,
        skipped: u64,
        pending: u64,
    },
    /// One batch was embedded and committed; `n` of `total` records done.
    Committed { batch: u64, n: u64, total: u64 },
}

/// Reports indexing progress. Implementations write to stderr (human or JSON).
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index  batch 3  48 / 1,200 records".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Planned {
                existing,
                skipped,
                pending,
            } => format!(
                "index  {} existing rows, {} already indexed, {} to embed\n",
                format_number(*existing),
                format_number(*skipped),
                format_number(*pending)
            ),
            IndexProgressEvent::Committed { batch, n, total } => format!(
                "index  batch {}  {} / {} records\n",
                batch,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::Planned {
                existing,
                skipped,
                pending,
            } => serde_json::json!({
                "event": "progress",
                "phase": "planned",
                "existing": existing,
                "skipped": skipped,
                "pending": pending
            }),
            IndexProgressEvent::Committed { batch, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "committed",
                "batch": batch,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
