//! `chat-search merge` and `chat-search rollback`.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::embed_cmd::served_generation;
use crate::store::{self, Generation};

/// Parse a `VECTORS,METADATA` pair given on the command line.
pub fn parse_generation(s: &str) -> std::result::Result<Generation, String> {
    let (vectors, metadata) = s
        .split_once(',')
        .ok_or_else(|| format!("expected VECTORS,METADATA but got '{}'", s))?;
    if vectors.is_empty() || metadata.is_empty() {
        return Err(format!("expected VECTORS,METADATA but got '{}'", s));
    }
    Ok(Generation::new(vectors, metadata))
}

/// Concatenate generations in order and swap the result in.
pub fn run_merge(config: &Config, sources: &[Generation]) -> Result<()> {
    if sources.is_empty() {
        bail!("merge needs at least one VECTORS,METADATA pair");
    }
    let served = served_generation(config);
    if sources.contains(&served) {
        bail!("the served generation cannot be a merge source; pass a copy instead");
    }

    let staged = served.staging();
    let rows = store::merge(sources, &config.index.array_key, &staged)
        .context("Merge failed; served generation untouched")?;
    if rows == 0 {
        bail!("All merge sources are empty; served generation left unchanged");
    }
    store::swap(&staged, &served, &config.index.array_key)?;

    println!("merge");
    println!("  sources: {}", sources.len());
    println!("  total rows: {}", rows);
    println!("  previous generation kept at {}", served.old().vectors.display());
    Ok(())
}

/// Restore the generation kept by the last swap.
pub fn run_rollback(config: &Config) -> Result<()> {
    let served = served_generation(config);
    store::rollback(&served, &config.index.array_key).context("Rollback failed")?;
    let info = store::inspect(&served, &config.index.array_key)?;
    println!("rollback");
    println!("  restored rows: {}", info.rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generation_pair() {
        let g = parse_generation("a.vec,a.jsonl").unwrap();
        assert_eq!(g, Generation::new("a.vec", "a.jsonl"));
        assert!(parse_generation("a.vec").is_err());
        assert!(parse_generation(",a.jsonl").is_err());
    }
}
