//! The diagnostic output stream.
//!
//! Two streams leave the process: the complete structured log (every event,
//! via the `log` facade) and this strict subset on stderr carrying progress
//! ticks, success announcements and the resume command. Success lines are
//! duplicated into the complete log; progress-only lines are not.

use chrono::Utc;
use log::info;

fn stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Progress line: diagnostic stream only.
pub fn progress(msg: &str) {
    eprintln!("[{}] {}", stamp(), msg);
}

/// Success line: diagnostic stream and the complete log.
pub fn success(msg: &str) {
    info!("{msg}");
    eprintln!("[{}] {}", stamp(), msg);
}

/// Pre-formatted multi-line block (stats report, resume summary, resume
/// command): diagnostic stream only.
pub fn block(text: &str) {
    eprint!("{text}");
    if !text.ends_with('\n') {
        eprintln!();
    }
}
