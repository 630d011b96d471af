use std::path::Path;

use anyhow::{Context, Result};

/// Read newline-separated class labels. Blank lines are skipped.
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read class names from {}", path.display()))?;
    Ok(parse_class_names(&raw))
}

pub fn parse_class_names(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
