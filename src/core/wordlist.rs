use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read a password wordlist: one candidate per line, surrounding whitespace
/// trimmed, blank lines skipped. No normalization beyond that.
pub fn load_passwords(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open wordlist file {path:?}"))?;

    let mut passwords = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read wordlist file {path:?}"))?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            passwords.push(trimmed.to_string());
        }
    }

    Ok(passwords)
}
