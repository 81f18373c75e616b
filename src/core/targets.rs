use anyhow::{Context, Result};
use log::{trace, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A single router target. Immutable once parsed.
///
/// `command` is a reserved per-target string carried through from the
/// target file; no driver consults it yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub username: String,
    pub ip: String,
    pub port: u16,
    pub command: String,
}

/// Parses target specifications from line-oriented text.
///
/// Recognized forms, `:`-separated:
/// `ip`, `user:ip`, `user:ip:port`, `user:ip:port:command`.
pub struct TargetParser {
    default_username: String,
    default_port: u16,
}

impl TargetParser {
    pub fn new(default_username: impl Into<String>, default_port: u16) -> Self {
        Self {
            default_username: default_username.into(),
            default_port,
        }
    }

    /// Parse one line. `Ok(None)` for comments and blank lines; `Err` for
    /// malformed lines (the file parser logs and skips those).
    pub fn parse_line(&self, line: &str) -> Result<Option<Target>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split(':').collect();

        let mut target = Target {
            username: self.default_username.clone(),
            ip: String::new(),
            port: self.default_port,
            command: String::new(),
        };

        match parts.len() {
            1 => {
                target.ip = parts[0].to_string();
            }
            2 => {
                target.username = parts[0].to_string();
                target.ip = parts[1].to_string();
            }
            3 | 4 => {
                target.username = parts[0].to_string();
                target.ip = parts[1].to_string();
                match parts[2].parse::<u16>() {
                    Ok(port) => target.port = port,
                    Err(_) => {
                        warn!("invalid port {:?}, using default {}", parts[2], self.default_port);
                    }
                }
                if parts.len() == 4 {
                    target.command = parts[3].to_string();
                }
            }
            _ => {
                anyhow::bail!("invalid target format ({} fields): {line}", parts.len());
            }
        }

        if target.ip.is_empty() {
            anyhow::bail!("target IP cannot be empty: {line}");
        }

        trace!("parsed target {target:?}");
        Ok(Some(target))
    }

    /// Read a whole target file. Malformed lines are logged and skipped;
    /// only an unreadable file is an error.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Vec<Target>> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open target file {path:?}"))?;

        let mut targets = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {path:?}"))?;
            match self.parse_line(&line) {
                Ok(Some(target)) => targets.push(target),
                Ok(None) => {}
                Err(e) => {
                    warn!("{path:?}:{}: {e}", line_num + 1);
                }
            }
        }

        Ok(targets)
    }
}
