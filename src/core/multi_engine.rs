use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::diag;
use super::engine::{AttemptResult, Engine};
use super::protocols::{ModuleFactory, ModuleOptions, ProtocolError, RouterModule};
use super::targets::Target;
use super::tracker::{ProgressTracker, ProgressUpdate};

/// Fixed pre-flight connect budget; deliberately independent of the
/// adaptive timeout so a dead target fails fast exactly once.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the results collector pushes a progress snapshot.
const TRACKER_UPDATE_EVERY: usize = 10;

/// Outcome of one fully processed target.
#[derive(Debug, Clone)]
pub struct MultiTargetResult {
    pub target: Target,
    pub results: Vec<AttemptResult>,
    pub success: bool,
    pub success_password: Option<String>,
    pub attempts: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A target that could not be processed at all (initialization or
/// pre-flight failure).
#[derive(Debug, Clone)]
pub struct MultiTargetError {
    pub target: Target,
    pub error: ProtocolError,
}

/// Fans out per-target engines, bounded by a semaphore of
/// `concurrent_targets` slots.
pub struct MultiTargetEngine {
    factory: Arc<dyn ModuleFactory>,
    workers_per_target: usize,
    concurrent_targets: usize,
    rate_limit: Duration,
    initial_timeout: Duration,
    max_timeout: Duration,
    max_consec_errors: u32,
    https: bool,
    targets: Vec<Target>,
    passwords: Arc<Vec<String>>,
    tracker: Option<Arc<ProgressTracker>>,
    results_rx: Option<mpsc::Receiver<MultiTargetResult>>,
    errors_rx: Option<mpsc::Receiver<MultiTargetError>>,
    tasks: JoinSet<()>,
}

impl MultiTargetEngine {
    pub fn new(
        factory: Arc<dyn ModuleFactory>,
        workers_per_target: usize,
        concurrent_targets: usize,
        rate_limit: Duration,
    ) -> Self {
        Self {
            factory,
            workers_per_target: workers_per_target.max(1),
            concurrent_targets: concurrent_targets.max(1),
            rate_limit,
            initial_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(15),
            max_consec_errors: 5,
            https: false,
            targets: Vec::new(),
            passwords: Arc::new(Vec::new()),
            tracker: None,
            results_rx: None,
            errors_rx: None,
            tasks: JoinSet::new(),
        }
    }

    pub fn load_targets(&mut self, targets: Vec<Target>) {
        self.targets = targets;
    }

    pub fn load_passwords(&mut self, passwords: Vec<String>) {
        self.passwords = Arc::new(passwords);
    }

    pub fn set_tracker(&mut self, tracker: Arc<ProgressTracker>) {
        self.tracker = Some(tracker);
    }

    pub fn set_timeouts(&mut self, initial: Duration, max: Duration) {
        self.initial_timeout = initial;
        self.max_timeout = max;
    }

    pub fn set_max_consecutive_errors(&mut self, max: u32) {
        self.max_consec_errors = max;
    }

    pub fn set_https(&mut self, https: bool) {
        self.https = https;
    }

    /// Spawn one task per target. The outer channels close when the last
    /// task finishes.
    pub fn start(&mut self, cancel: CancellationToken) {
        diag::progress(&format!(
            "starting {} attack: {} targets, {} concurrent, {} workers per target",
            self.factory.protocol_name(),
            self.targets.len(),
            self.concurrent_targets,
            self.workers_per_target
        ));

        let semaphore = Arc::new(Semaphore::new(self.concurrent_targets));
        let (results_tx, results_rx) = mpsc::channel(self.concurrent_targets);
        let (errors_tx, errors_rx) = mpsc::channel(self.concurrent_targets);
        self.results_rx = Some(results_rx);
        self.errors_rx = Some(errors_rx);

        for target in self.targets.clone() {
            let task = TargetTask {
                factory: Arc::clone(&self.factory),
                target,
                passwords: Arc::clone(&self.passwords),
                workers: self.workers_per_target,
                rate_limit: self.rate_limit,
                initial_timeout: self.initial_timeout,
                max_timeout: self.max_timeout,
                max_consec_errors: self.max_consec_errors,
                https: self.https,
                tracker: self.tracker.clone(),
                semaphore: Arc::clone(&semaphore),
                results_tx: results_tx.clone(),
                errors_tx: errors_tx.clone(),
                cancel: cancel.clone(),
            };
            self.tasks.spawn(task.run());
        }
    }

    /// Take the outer result channel. Call once, after `start`.
    pub fn results(&mut self) -> mpsc::Receiver<MultiTargetResult> {
        self.results_rx.take().expect("results channel already taken")
    }

    /// Take the outer error channel. Call once, after `start`.
    pub fn errors(&mut self) -> mpsc::Receiver<MultiTargetError> {
        self.errors_rx.take().expect("errors channel already taken")
    }

    /// Wait for every per-target task.
    pub async fn wait_for_completion(&mut self) {
        while self.tasks.join_next().await.is_some() {}
        diag::progress("attack completed");
    }
}

struct TargetTask {
    factory: Arc<dyn ModuleFactory>,
    target: Target,
    passwords: Arc<Vec<String>>,
    workers: usize,
    rate_limit: Duration,
    initial_timeout: Duration,
    max_timeout: Duration,
    max_consec_errors: u32,
    https: bool,
    tracker: Option<Arc<ProgressTracker>>,
    semaphore: Arc<Semaphore>,
    results_tx: mpsc::Sender<MultiTargetResult>,
    errors_tx: mpsc::Sender<MultiTargetError>,
    cancel: CancellationToken,
}

impl TargetTask {
    async fn run(self) {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("cancelled before acquiring slot for {}", self.target.ip);
                return;
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            }
        };

        let start_time = Utc::now();
        diag::progress(&format!(
            "starting attack on {}:{} as {}",
            self.target.ip, self.target.port, self.target.username
        ));

        // Instantiate and initialize the module for this target.
        let mut module = self.factory.create_module();
        let options = ModuleOptions {
            port: Some(self.target.port),
            timeout: Some(self.initial_timeout),
            https: self.https,
        };
        if let Err(e) = module.initialize(&self.target.ip, &self.target.username, &options) {
            self.publish_error(e).await;
            return;
        }

        // Pre-flight: one clean failure per unreachable host instead of a
        // worker-count pile of duplicates.
        let preflight = tokio::select! {
            _ = self.cancel.cancelled() => return,
            outcome = tokio::time::timeout(PREFLIGHT_TIMEOUT, module.connect()) => outcome,
        };
        match preflight {
            Err(_) => {
                self.publish_error(ProtocolError::Timeout).await;
                return;
            }
            Ok(Err(e)) => {
                self.publish_error(e).await;
                return;
            }
            Ok(Ok(())) => {}
        }
        info!("connection test successful for {}:{}", self.target.ip, self.target.port);
        if let Err(e) = module.close().await {
            debug!("error closing test connection: {e}");
        }

        // Resume probe: skip finished targets, fast-forward the wordlist,
        // seed the adaptive timeout.
        let mut offset = 0usize;
        let mut resumed_timeout = None;
        if let Some(tracker) = &self.tracker {
            if let Some(progress) = tracker.get_target_progress(&self.target.ip, self.target.port)
            {
                if progress.completed {
                    info!(
                        "target {}:{} already completed (success: {}), skipping",
                        self.target.ip, self.target.port, progress.success
                    );
                    return;
                }
                offset = progress.passwords_tried as usize;
                if offset > 0 {
                    diag::progress(&format!(
                        "resuming {}:{} from password {}",
                        self.target.ip, self.target.port, offset
                    ));
                }
                if progress.timeout_ms > 0 {
                    resumed_timeout =
                        Some(Duration::from_millis(u64::from(progress.timeout_ms)));
                }
            }
        }

        let remaining: Vec<String> = self.passwords[offset.min(self.passwords.len())..].to_vec();

        let mut engine = Engine::new(module, self.workers, self.rate_limit);
        engine.set_current_timeout(resumed_timeout.unwrap_or(self.initial_timeout));
        engine.set_max_timeout(self.max_timeout);
        engine.set_max_consecutive_errors(self.max_consec_errors);
        engine.load_passwords(remaining);

        // Workers run on a child token so the first success stops this
        // target without touching the rest of the attack.
        let target_cancel = self.cancel.child_token();
        if let Err(e) = engine.start(target_cancel.clone()).await {
            self.publish_error(ProtocolError::Config(e.to_string())).await;
            return;
        }

        let results_collector = {
            let mut rx = engine.results();
            let shared = engine.shared();
            let tracker = self.tracker.clone();
            let target = self.target.clone();
            let stop_target = target_cancel.clone();
            tokio::spawn(async move {
                let mut results: Vec<AttemptResult> = Vec::new();
                let mut success = false;
                let mut success_password = None;

                while let Some(result) = rx.recv().await {
                    if result.success && !success {
                        success = true;
                        success_password = Some(result.password.clone());
                        diag::success(&format!(
                            "found valid credentials for {}@{}:{} - {}",
                            target.username, target.ip, target.port, result.password
                        ));
                        // Remaining workers stop once they observe this.
                        stop_target.cancel();
                    }
                    results.push(result);

                    if let Some(tracker) = &tracker {
                        if results.len() % TRACKER_UPDATE_EVERY == 0 {
                            tracker.update_target_progress(ProgressUpdate {
                                ip: target.ip.clone(),
                                port: target.port,
                                passwords_tried: (offset + results.len()) as u32,
                                completed: false,
                                success: false,
                                found_password: None,
                                timeout_ms: shared.current_timeout().as_millis() as u32,
                                dead: false,
                                consecutive_errors: shared.consecutive_errors(),
                            });
                        }
                    }
                }
                (results, success, success_password)
            })
        };

        let errors_collector = {
            let mut rx = engine.errors();
            let target = self.target.clone();
            tokio::spawn(async move {
                while let Some(e) = rx.recv().await {
                    warn!("error during attack on {}:{}: {e}", target.ip, target.port);
                }
            })
        };

        engine.wait_for_completion().await;
        engine.close().await;

        let (results, success, success_password) =
            results_collector.await.unwrap_or((Vec::new(), false, None));
        let _ = errors_collector.await;

        let end_time = Utc::now();
        let consecutive_errors = engine.get_consecutive_errors();
        let dead = consecutive_errors >= self.max_consec_errors.max(1);

        if let Some(tracker) = &self.tracker {
            tracker.update_target_progress(ProgressUpdate {
                ip: self.target.ip.clone(),
                port: self.target.port,
                passwords_tried: (offset + results.len()) as u32,
                completed: true,
                success,
                found_password: success_password.clone(),
                timeout_ms: engine.get_current_timeout().as_millis() as u32,
                dead,
                consecutive_errors,
            });
        }

        let attempts = results.len();
        let outcome = MultiTargetResult {
            target: self.target.clone(),
            results,
            success,
            success_password,
            attempts,
            start_time,
            end_time,
        };
        if self.results_tx.send(outcome).await.is_err() {
            debug!("result receiver dropped before {} finished", self.target.ip);
        }

        diag::progress(&format!(
            "completed attack on {}:{} (success: {success}, attempts: {attempts})",
            self.target.ip, self.target.port
        ));
    }

    async fn publish_error(&self, error: ProtocolError) {
        warn!(
            "failed to process target {}:{}: {error}",
            self.target.ip, self.target.port
        );
        let outcome = MultiTargetError {
            target: self.target.clone(),
            error,
        };
        if self.errors_tx.send(outcome).await.is_err() {
            debug!("error receiver dropped before {} finished", self.target.ip);
        }
    }
}
