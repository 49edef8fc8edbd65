//! `chat-search threads`: message export → thread stream.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::threads::{load_messages, reconstruct, write_threads};

/// Reconstruct threads from a message export and write them as JSONL.
pub fn run_threads(
    config: &Config,
    input: &Path,
    output: &Path,
    min_text_length: Option<usize>,
) -> Result<()> {
    let min_text_length = min_text_length.unwrap_or(config.threads.min_text_length);

    let batch = load_messages(input)
        .with_context(|| format!("Failed to read messages from {}", input.display()))?;
    let loaded = batch.messages.len();

    let written = write_threads(output, reconstruct(batch.messages, min_text_length))
        .with_context(|| format!("Failed to write threads to {}", output.display()))?;

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        loaded,
        written,
        "threads reconstructed"
    );

    println!("threads");
    println!("  messages loaded: {}", loaded);
    println!("  records skipped: {}", batch.skipped);
    println!("  threads written: {}", written);
    Ok(())
}
