use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-target slice of the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProgress {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub passwords_tried: u32,
    pub completed: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub found_password: Option<String>,
    #[serde(default)]
    pub timeout_ms: u32,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub consecutive_errors: u32,
}

impl TargetProgress {
    pub fn new(ip: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            username: username.into(),
            passwords_tried: 0,
            completed: false,
            success: false,
            found_password: None,
            timeout_ms: 0,
            dead: false,
            consecutive_errors: 0,
        }
    }
}

/// The complete durable state of an attack. One `TargetProgress` per
/// `(ip, port)`; produced by the tracker, consumed by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub timestamp: DateTime<Utc>,
    pub protocol: String,
    pub username: String,
    pub password_file: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_file: Option<String>,
    pub workers: usize,
    pub rate_limit: String,
    /// Reserved for protocol-specific extras; currently always absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub options: Option<serde_json::Map<String, serde_json::Value>>,
    pub targets: Vec<TargetProgress>,
}

impl ResumeState {
    pub fn add_target(&mut self, target: TargetProgress) {
        self.targets.push(target);
    }

    pub fn get_target_progress(&self, ip: &str, port: u16) -> Option<&TargetProgress> {
        self.targets.iter().find(|t| t.ip == ip && t.port == port)
    }

    pub fn target_progress_mut(&mut self, ip: &str, port: u16) -> Option<&mut TargetProgress> {
        self.targets.iter_mut().find(|t| t.ip == ip && t.port == port)
    }

    /// `(completed, total, successful)` target counts.
    pub fn progress_counts(&self) -> (usize, usize, usize) {
        let total = self.targets.len();
        let completed = self.targets.iter().filter(|t| t.completed).count();
        let successful = self
            .targets
            .iter()
            .filter(|t| t.completed && t.success)
            .count();
        (completed, total, successful)
    }

    pub fn remaining_targets(&self) -> Vec<&TargetProgress> {
        self.targets.iter().filter(|t| !t.completed).collect()
    }

    /// Human-readable summary block, printed to the diagnostic stream when
    /// an attack is resumed.
    pub fn summary(&self) -> String {
        let (completed, total, successful) = self.progress_counts();
        let mut out = String::new();

        let _ = writeln!(out, "=== Resume State Summary ===");
        let _ = writeln!(out, "Timestamp:     {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "Protocol:      {}", self.protocol);
        let _ = writeln!(out, "Username:      {}", self.username);
        let _ = writeln!(out, "Password File: {}", self.password_file);
        if let Some(target_file) = &self.target_file {
            let _ = writeln!(out, "Target File:   {target_file}");
        }
        let _ = writeln!(out, "Workers:       {}", self.workers);
        let _ = writeln!(out, "Rate Limit:    {}", self.rate_limit);
        let _ = writeln!(
            out,
            "Progress:      {completed}/{total} targets completed ({successful} successful)"
        );

        if successful > 0 {
            let _ = writeln!(out, "Credentials found:");
            for target in self.targets.iter().filter(|t| t.success) {
                let _ = writeln!(
                    out,
                    "  {}:{} - {}:{}",
                    target.ip,
                    target.port,
                    target.username,
                    target.found_password.as_deref().unwrap_or("")
                );
            }
        }

        let remaining = self.remaining_targets();
        if !remaining.is_empty() {
            let _ = writeln!(out, "Remaining targets: {}", remaining.len());
            for target in remaining.iter().take(5) {
                let _ = writeln!(
                    out,
                    "  {}:{} ({} passwords tried)",
                    target.ip, target.port, target.passwords_tried
                );
            }
            if remaining.len() > 5 {
                let _ = writeln!(out, "  ... and {} more", remaining.len() - 5);
            }
        }
        let _ = writeln!(out, "============================");

        out
    }
}

/// Write the state to a timestamped file under `directory`. The write is
/// atomic: temp file, fsync, rename. Returns the final path.
pub fn save_resume_state(state: &mut ResumeState, directory: impl AsRef<Path>) -> Result<PathBuf> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory)
        .with_context(|| format!("failed to create resume directory {directory:?}"))?;

    state.timestamp = Utc::now();
    let filename = format!("resume_{}.json", state.timestamp.format("%Y%m%d_%H%M%S"));
    let path = directory.join(&filename);
    let tmp_path = directory.join(format!(".{filename}.tmp"));

    let data = serde_json::to_vec_pretty(state).context("failed to serialize resume state")?;

    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {tmp_path:?}"))?;
        file.write_all(&data)
            .with_context(|| format!("failed to write {tmp_path:?}"))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {tmp_path:?}"))?;
    }
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("failed to move checkpoint into place at {path:?}"))?;

    info!("saved resume state to {}", path.display());
    Ok(path)
}

/// Load a checkpoint produced by `save_resume_state`.
pub fn load_resume_state(path: impl AsRef<Path>) -> Result<ResumeState> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read resume file {path:?}"))?;
    let state: ResumeState = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse resume file {path:?}"))?;

    info!(
        "loaded resume state from {} ({} targets)",
        path.display(),
        state.targets.len()
    );
    Ok(state)
}
