use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::diag;
use super::tracker::ProgressTracker;

/// Periodic throughput / ETA reporting on the diagnostic stream. Purely
/// observational: it reads tracker snapshots on its own schedule and never
/// blocks the engines.
pub struct StatsTracker {
    start_time: Instant,
    total_passwords: usize,
    total_targets: usize,
    output_interval: Duration,
    tracker: Option<Arc<ProgressTracker>>,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsTracker {
    pub fn new(
        total_passwords: usize,
        total_targets: usize,
        output_interval: Duration,
        tracker: Option<Arc<ProgressTracker>>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            total_passwords,
            total_targets,
            output_interval,
            tracker,
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the ticker; an interval of zero disables reporting entirely.
    pub fn start(&self) {
        if self.output_interval.is_zero() {
            return;
        }

        let start_time = self.start_time;
        let total_passwords = self.total_passwords;
        let total_targets = self.total_targets;
        let interval = self.output_interval;
        let tracker = self.tracker.clone();
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        diag::block(&render_report(
                            start_time.elapsed(),
                            total_passwords,
                            total_targets,
                            tracker.as_deref(),
                        ));
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn render_report(
    elapsed: Duration,
    total_passwords: usize,
    total_targets: usize,
    tracker: Option<&ProgressTracker>,
) -> String {
    let mut tried: u64 = 0;
    let mut completed = 0usize;
    let mut dead = 0usize;
    let mut remaining_attempts: u64 = 0;

    match tracker {
        Some(tracker) => {
            let state = tracker.get_state();
            for target in &state.targets {
                tried += u64::from(target.passwords_tried);
                if target.completed {
                    completed += 1;
                }
                if target.dead {
                    dead += 1;
                }
                if !target.completed && !target.dead {
                    remaining_attempts += (total_passwords as u64)
                        .saturating_sub(u64::from(target.passwords_tried));
                }
            }
        }
        None => {
            remaining_attempts = (total_targets as u64) * (total_passwords as u64);
        }
    }

    let alive = total_targets - dead;
    let speed = if elapsed.as_secs_f64() > 0.0 {
        tried as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    let mut out = String::new();
    let _ = writeln!(out, "=== Progress Report ===");
    let _ = writeln!(
        out,
        "Speed:               {:.1} passwords/minute ({speed:.2} passwords/second)",
        speed * 60.0
    );
    let _ = writeln!(
        out,
        "Targets:             {completed}/{total_targets} completed ({alive} alive, {dead} dead)"
    );
    let _ = writeln!(out, "Passwords tried:     {tried}");
    let _ = writeln!(out, "Elapsed:             {}", format_duration(elapsed));
    if speed > 0.0 && remaining_attempts > 0 {
        let eta = Duration::from_secs_f64(remaining_attempts as f64 / speed);
        let _ = writeln!(out, "Estimated time left: {}", format_duration(eta));
    }
    let _ = writeln!(out, "=======================");
    out
}

/// Coarse human formatting, largest two units only.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86_400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600)
    }
}
