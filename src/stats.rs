//! Index statistics.
//!
//! Summarizes the served generation: committed rows, dimensionality, the
//! commit checkpoint, and per-source row counts. Used by `chat-search stats`
//! to confirm indexing runs and swaps landed as expected.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::embed_cmd::served_generation;
use crate::progress::format_number;
use crate::store::read_generation;

/// Run the stats command: load the served generation and print a summary.
pub fn run_stats(config: &Config) -> Result<()> {
    let served = served_generation(config);
    let data = read_generation(&served, &config.index.array_key)?;

    let vectors_size = std::fs::metadata(&served.vectors)
        .map(|m| m.len())
        .unwrap_or(0);
    let metadata_size = std::fs::metadata(&served.metadata)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Chat Search Index Stats");
    println!("=======================");
    println!();
    println!(
        "  Vectors:     {} ({})",
        served.vectors.display(),
        format_bytes(vectors_size)
    );
    println!(
        "  Metadata:    {} ({})",
        served.metadata.display(),
        format_bytes(metadata_size)
    );
    println!();
    println!("  Rows:        {}", format_number(data.rows() as u64));
    println!("  Dimensions:  {}", data.dims);
    match &data.checkpoint {
        Some(cp) => println!(
            "  Committed:   {} rows at {}",
            format_number(cp.rows as u64),
            cp.updated_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("  Committed:   no checkpoint"),
    }
    if served.old().vectors.exists() {
        println!("  Previous:    {}", served.old().vectors.display());
    }

    let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &data.records {
        *by_source
            .entry(record.source.as_deref().unwrap_or("(none)"))
            .or_default() += 1;
    }

    if !by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<32} {:>8}", "SOURCE", "ROWS");
        println!("  {}", "-".repeat(41));
        for (source, rows) in &by_source {
            println!("  {:<32} {:>8}", source, rows);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
