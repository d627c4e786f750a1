//! Notification dump parsing
//!
//! One fragment per line as hex. Blank lines and `#` comments are skipped;
//! spaces, colons and dashes between bytes are ignored.

use anyhow::{Context, Result};

pub fn parse_dump(text: &str) -> Result<Vec<Vec<u8>>> {
    let mut fragments = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let digits: String = line
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | ':' | '-'))
            .collect();
        let fragment =
            hex::decode(&digits).with_context(|| format!("line {}: invalid hex", index + 1))?;
        fragments.push(fragment);
    }
    Ok(fragments)
}
