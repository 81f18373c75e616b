use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::resume::{save_resume_state, ResumeState, TargetProgress};

/// Capacity of the update channel. Senders never block: when the buffer is
/// full the update is dropped and the state stays eventually consistent
/// with the live engine counters.
const UPDATE_CHANNEL_CAPACITY: usize = 1000;

/// One progress delta for a target. FIFO per target (single producer); the
/// processor serializes across targets.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub ip: String,
    pub port: u16,
    pub passwords_tried: u32,
    pub completed: bool,
    pub success: bool,
    pub found_password: Option<String>,
    pub timeout_ms: u32,
    pub dead: bool,
    pub consecutive_errors: u32,
}

/// Owns the live `ResumeState` and persists it: a processor task applies
/// queued updates under the writer lock, an optional auto-save loop writes
/// a checkpoint whenever the state is dirty.
pub struct ProgressTracker {
    state: Arc<RwLock<ResumeState>>,
    update_tx: Mutex<Option<mpsc::Sender<ProgressUpdate>>>,
    update_rx: Mutex<Option<mpsc::Receiver<ProgressUpdate>>>,
    dirty: Arc<AtomicBool>,
    save_directory: PathBuf,
    save_interval: Duration,
    auto_save: bool,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_save_path: Arc<Mutex<Option<PathBuf>>>,
}

impl ProgressTracker {
    pub fn new(
        state: ResumeState,
        save_directory: impl Into<PathBuf>,
        save_interval: Duration,
        auto_save: bool,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(state)),
            update_tx: Mutex::new(Some(update_tx)),
            update_rx: Mutex::new(Some(update_rx)),
            dirty: Arc::new(AtomicBool::new(false)),
            save_directory: save_directory.into(),
            save_interval,
            auto_save,
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            last_save_path: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the update processor and, when enabled, the auto-save loop.
    pub fn start(&self) {
        let mut rx = self
            .update_rx
            .lock()
            .unwrap()
            .take()
            .expect("tracker started twice");

        let state = Arc::clone(&self.state);
        let dirty = Arc::clone(&self.dirty);
        let processor = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                apply_update(&state, update);
                dirty.store(true, Ordering::Release);
            }
            debug!("update processor drained");
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(processor);

        if self.auto_save && !self.save_interval.is_zero() {
            let state = Arc::clone(&self.state);
            let dirty = Arc::clone(&self.dirty);
            let directory = self.save_directory.clone();
            let last_save_path = Arc::clone(&self.last_save_path);
            let interval = self.save_interval;
            let stop = self.stop.clone();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if dirty.swap(false, Ordering::AcqRel) {
                                save_locked(&state, &directory, &last_save_path);
                            }
                        }
                        _ = stop.cancelled() => {
                            debug!("auto-save stopped");
                            return;
                        }
                    }
                }
            }));

            info!(
                "auto-save enabled every {:?} into {}",
                interval,
                self.save_directory.display()
            );
        }
    }

    /// Queue one progress update. Never blocks: a full channel drops the
    /// update with a warning.
    pub fn update_target_progress(&self, update: ProgressUpdate) {
        let guard = self.update_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(update)) = tx.try_send(update) {
            warn!(
                "progress update channel full, dropping update for {}:{}",
                update.ip, update.port
            );
        }
    }

    /// Deep copy of the current state.
    pub fn get_state(&self) -> ResumeState {
        self.state.read().unwrap().clone()
    }

    pub fn get_target_progress(&self, ip: &str, port: u16) -> Option<TargetProgress> {
        self.state
            .read()
            .unwrap()
            .get_target_progress(ip, port)
            .cloned()
    }

    /// Write a checkpoint immediately.
    pub fn save_now(&self) -> Option<PathBuf> {
        self.dirty.store(false, Ordering::Release);
        save_locked(&self.state, &self.save_directory, &self.last_save_path)
    }

    /// Path of the most recent checkpoint, if any was written.
    pub fn latest_save_path(&self) -> Option<PathBuf> {
        self.last_save_path.lock().unwrap().clone()
    }

    /// Close the update channel, wait for both tasks, then (when saving is
    /// enabled) write one final checkpoint reflecting every accepted
    /// update.
    pub async fn stop(&self) {
        self.update_tx.lock().unwrap().take();
        self.stop.cancel();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("tracker task failed: {e}");
            }
        }

        if self.auto_save {
            self.save_now();
        }
    }
}

fn apply_update(state: &RwLock<ResumeState>, update: ProgressUpdate) {
    let mut state = state.write().unwrap();
    let Some(target) = state.target_progress_mut(&update.ip, update.port) else {
        warn!("progress update for unknown target {}:{}", update.ip, update.port);
        return;
    };

    target.passwords_tried = update.passwords_tried;
    target.completed = update.completed;
    target.success = update.success;
    target.timeout_ms = update.timeout_ms;
    target.dead = update.dead;
    target.consecutive_errors = update.consecutive_errors;
    if update.success {
        target.found_password = update.found_password;
    }

    if update.completed {
        if update.success {
            info!(
                "target {}:{} completed successfully after {} attempts",
                update.ip, update.port, update.passwords_tried
            );
        } else {
            info!(
                "target {}:{} completed without success ({} attempts, dead: {})",
                update.ip, update.port, update.passwords_tried, update.dead
            );
        }
    }
}

fn save_locked(
    state: &RwLock<ResumeState>,
    directory: &PathBuf,
    last_save_path: &Mutex<Option<PathBuf>>,
) -> Option<PathBuf> {
    let mut state = state.write().unwrap();
    match save_resume_state(&mut state, directory) {
        Ok(path) => {
            let (completed, total, successful) = state.progress_counts();
            debug!(
                "progress saved: {completed}/{total} targets completed, {successful} successful"
            );
            *last_save_path.lock().unwrap() = Some(path.clone());
            Some(path)
        }
        Err(e) => {
            error!("failed to save resume state: {e:#}");
            None
        }
    }
}
