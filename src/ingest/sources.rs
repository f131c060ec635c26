// src/ingest/sources.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Read feed URLs, one per line. Blank lines and `#` comments are skipped,
/// duplicates dropped keeping first occurrence. A missing file reads as empty.
pub fn load_sources(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    Ok(parse_sources(&content))
}

pub fn parse_sources(content: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}
