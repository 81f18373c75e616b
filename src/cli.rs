use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

use rosbrute::core::protocols::ModuleKind;

/// Command-line surface. Every flag except the protocol-specific ones is
/// global and may appear before or after the subcommand.
#[derive(Debug, Parser)]
#[command(
    name = "rosbrute",
    version,
    about = "Credential-testing engine for MikroTik RouterOS management protocols",
    long_about = "Tests password strength on RouterOS devices over the binary API, the \
                  WebFig API or the REST API. For authorized security assessments of \
                  your own infrastructure."
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    pub trace: bool,

    /// Router IP address or hostname (single-target mode)
    #[arg(long, global = true)]
    pub target: Option<String>,

    /// File with target specifications, one per line (multi-target mode)
    #[arg(long = "target-file", global = true)]
    pub target_file: Option<String>,

    /// Username to test
    #[arg(long, global = true, default_value = "admin")]
    pub user: String,

    /// Path to the password wordlist
    #[arg(long, global = true)]
    pub wordlist: Option<String>,

    /// Concurrent workers per target
    #[arg(long, global = true, default_value_t = 5)]
    pub workers: usize,

    /// Delay between attempts (e.g. 100ms)
    #[arg(long, global = true, default_value = "100ms", value_parser = parse_duration_arg)]
    pub rate: Duration,

    /// Initial connection/request timeout
    #[arg(long, global = true, default_value = "5s", value_parser = parse_duration_arg)]
    pub timeout: Duration,

    /// Upper bound for the adaptive timeout
    #[arg(long = "max-timeout", global = true, default_value = "15s", value_parser = parse_duration_arg)]
    pub max_timeout: Duration,

    /// Consecutive transient faults before a host is declared dead
    #[arg(long = "max-conseq-err-per-host", global = true, default_value_t = 5)]
    pub max_conseq_err_per_host: u32,

    /// Number of targets attacked simultaneously
    #[arg(long = "concurrent-targets", global = true, default_value_t = 1)]
    pub concurrent_targets: usize,

    /// Interval between progress reports on stderr (0 disables)
    #[arg(long = "output-progress", global = true, default_value = "5s", value_parser = parse_duration_arg)]
    pub output_progress: Duration,

    /// Resume a previous attack from a checkpoint file
    #[arg(long, global = true)]
    pub resume: Option<String>,

    /// Interval between checkpoint saves (0 disables)
    #[arg(long = "save-progress", global = true, default_value = "30s", value_parser = parse_duration_arg)]
    pub save_progress: Duration,

    /// Directory for checkpoint files
    #[arg(long = "save-dir", global = true, default_value = "./resume")]
    pub save_dir: String,

    #[command(subcommand)]
    pub command: Option<ProtocolCommand>,
}

#[derive(Debug, Subcommand)]
pub enum ProtocolCommand {
    /// RouterOS v6 binary API (plaintext sentences over TCP)
    #[command(name = "binary-v6")]
    BinaryV6 {
        /// Router API port
        #[arg(long, default_value_t = 8728)]
        port: u16,
    },

    /// RouterOS v7 WebFig API (encrypted session over HTTP)
    #[command(name = "binary-v7")]
    BinaryV7 {
        /// Router API port
        #[arg(long, default_value_t = 8729)]
        port: u16,
    },

    /// RouterOS v7 REST API (HTTP Basic against the JSON endpoint)
    #[command(name = "rest-v7")]
    RestV7 {
        /// HTTP port
        #[arg(long, default_value_t = 80)]
        port: u16,

        /// Use HTTPS instead of HTTP
        #[arg(long)]
        https: bool,
    },
}

impl ProtocolCommand {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ProtocolCommand::BinaryV6 { .. } => ModuleKind::BinaryV6,
            ProtocolCommand::BinaryV7 { .. } => ModuleKind::BinaryV7,
            ProtocolCommand::RestV7 { .. } => ModuleKind::RestV7,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ProtocolCommand::BinaryV6 { port }
            | ProtocolCommand::BinaryV7 { port }
            | ProtocolCommand::RestV7 { port, .. } => *port,
        }
    }

    pub fn https(&self) -> bool {
        matches!(self, ProtocolCommand::RestV7 { https: true, .. })
    }
}

impl Cli {
    /// Input validation that clap cannot express: exactly one way of naming
    /// the targets, and a wordlist plus protocol unless resuming.
    pub fn validate(&self) -> Result<()> {
        let sources = [
            self.target.is_some(),
            self.target_file.is_some(),
            self.resume.is_some(),
        ]
        .iter()
        .filter(|&&set| set)
        .count();

        if sources != 1 {
            bail!("exactly one of --target, --target-file or --resume is required");
        }

        if self.resume.is_none() {
            if self.wordlist.is_none() {
                bail!("--wordlist is required unless resuming");
            }
            if self.command.is_none() {
                bail!("a protocol subcommand is required unless resuming");
            }
        }

        Ok(())
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// Parse Go-style duration strings: `100ms`, `5s`, `1m30s`, bare `0`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total = 0.0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 || digits == rest.len() {
            bail!("invalid duration: {s}");
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration: {s}"))?;

        let unit_len = rest[digits..]
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len() - digits);
        let unit = &rest[digits..digits + unit_len];
        let seconds = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => bail!("unknown duration unit {unit:?} in {s:?}"),
        };
        total += value * seconds;
        rest = &rest[digits + unit_len..];
    }

    Ok(Duration::from_secs_f64(total))
}

/// Render a duration back into the string form the resume file stores.
pub fn format_duration_text(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let millis = d.as_millis();
    if millis < 1000 || millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
