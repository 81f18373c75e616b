use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::password_queue::PasswordQueue;
use super::protocols::{ProtocolError, RouterModule};

const TIMEOUT_STEP: Duration = Duration::from_millis(500);

/// Outcome of a single authentication attempt.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub username: String,
    pub password: String,
    pub success: bool,
    pub error: Option<String>,
    pub protocol: String,
    pub target: String,
    pub elapsed: Duration,
    pub attempted_at: DateTime<Utc>,
}

/// Counters shared between the workers and the owning task: the
/// consecutive-error count driving dead-host detection and the adaptive
/// timeout in milliseconds.
pub(crate) struct EngineShared {
    consecutive_errors: AtomicU32,
    current_timeout_ms: AtomicU64,
    max_timeout_ms: AtomicU64,
    max_consec_errors: AtomicU32,
}

impl EngineShared {
    pub(crate) fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub(crate) fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.current_timeout_ms.load(Ordering::Acquire))
    }

    /// A threshold of zero still requires one observed fault before the
    /// host is declared dead.
    fn dead_threshold(&self) -> u32 {
        self.max_consec_errors.load(Ordering::Acquire).max(1)
    }
}

/// Runs `workers` authentication workers against one module instance.
///
/// The module is behind a mutex held for the whole of each `authenticate`
/// call; the per-connection attempt accounting in the binary drivers relies
/// on that serialization.
pub struct Engine {
    workers: usize,
    rate_limit: Duration,
    module: Arc<Mutex<Box<dyn RouterModule>>>,
    queue: Option<Arc<PasswordQueue>>,
    shared: Arc<EngineShared>,
    results_rx: Option<mpsc::Receiver<AttemptResult>>,
    errors_rx: Option<mpsc::Receiver<ProtocolError>>,
    tasks: JoinSet<()>,
}

impl Engine {
    pub fn new(module: Box<dyn RouterModule>, workers: usize, rate_limit: Duration) -> Self {
        Self {
            workers: workers.max(1),
            rate_limit,
            module: Arc::new(Mutex::new(module)),
            queue: None,
            shared: Arc::new(EngineShared {
                consecutive_errors: AtomicU32::new(0),
                current_timeout_ms: AtomicU64::new(10_000),
                max_timeout_ms: AtomicU64::new(30_000),
                max_consec_errors: AtomicU32::new(5),
            }),
            results_rx: None,
            errors_rx: None,
            tasks: JoinSet::new(),
        }
    }

    pub fn set_current_timeout(&self, timeout: Duration) {
        self.shared
            .current_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn set_max_timeout(&self, timeout: Duration) {
        self.shared
            .max_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn set_max_consecutive_errors(&self, max: u32) {
        self.shared.max_consec_errors.store(max, Ordering::Release);
    }

    pub fn get_current_timeout(&self) -> Duration {
        self.shared.current_timeout()
    }

    pub fn get_consecutive_errors(&self) -> u32 {
        self.shared.consecutive_errors()
    }

    pub(crate) fn shared(&self) -> Arc<EngineShared> {
        Arc::clone(&self.shared)
    }

    pub fn load_passwords(&mut self, passwords: Vec<String>) {
        self.queue = Some(Arc::new(PasswordQueue::new(passwords)));
    }

    pub fn total_passwords(&self) -> usize {
        self.queue.as_ref().map(|q| q.total()).unwrap_or(0)
    }

    /// Fraction of the queue consumed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.queue.as_ref().map(|q| q.progress()).unwrap_or(0.0)
    }

    /// Spawn the worker pool. The result and error channels close once the
    /// last worker exits.
    pub async fn start(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no passwords loaded"))?;
        if queue.total() == 0 {
            debug!("starting with an empty password queue");
        }

        // Hand the (possibly resumed) adaptive timeout to the module before
        // any worker touches it.
        self.module
            .lock()
            .await
            .set_timeout(self.shared.current_timeout());

        let (results_tx, results_rx) = mpsc::channel(self.workers * 2);
        let (errors_tx, errors_rx) = mpsc::channel(self.workers);
        self.results_rx = Some(results_rx);
        self.errors_rx = Some(errors_rx);

        for id in 0..self.workers {
            self.tasks.spawn(worker(
                id,
                Arc::clone(&self.module),
                Arc::clone(queue),
                Arc::clone(&self.shared),
                self.rate_limit,
                results_tx.clone(),
                errors_tx.clone(),
                cancel.clone(),
            ));
        }

        Ok(())
    }

    /// Take the result channel. Call once, after `start`.
    pub fn results(&mut self) -> mpsc::Receiver<AttemptResult> {
        self.results_rx.take().expect("results channel already taken")
    }

    /// Take the error channel. Call once, after `start`.
    pub fn errors(&mut self) -> mpsc::Receiver<ProtocolError> {
        self.errors_rx.take().expect("errors channel already taken")
    }

    /// Block until every worker has exited.
    pub async fn wait_for_completion(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    /// Release the module's transport.
    pub async fn close(&mut self) {
        if let Err(e) = self.module.lock().await.close().await {
            debug!("error closing module connection: {e}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker(
    id: usize,
    module: Arc<Mutex<Box<dyn RouterModule>>>,
    queue: Arc<PasswordQueue>,
    shared: Arc<EngineShared>,
    rate_limit: Duration,
    results: mpsc::Sender<AttemptResult>,
    errors: mpsc::Sender<ProtocolError>,
    cancel: CancellationToken,
) {
    // Establish the transport up front; a worker that cannot connect
    // publishes one error and exits.
    {
        let mut module = module.lock().await;
        if !module.is_connected() {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = module.connect() => outcome,
            };
            if let Err(e) = outcome {
                error!("worker {id} failed to connect: {e}");
                drop(module);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = errors.send(e) => {}
                }
                return;
            }
        }
    }

    loop {
        if shared.consecutive_errors() >= shared.dead_threshold() {
            warn!(
                "worker {id}: {} consecutive errors, giving up on target",
                shared.consecutive_errors()
            );
            return;
        }

        let Some(password) = queue.next() else {
            return;
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(rate_limit) => {}
        }

        let started = Instant::now();
        let (outcome, username, protocol, target) = {
            let mut module = module.lock().await;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = module.authenticate(&password) => outcome,
            };

            if let Err(e) = &outcome {
                if e.is_timeout() {
                    let current = shared.current_timeout_ms.load(Ordering::Acquire);
                    let max = shared.max_timeout_ms.load(Ordering::Acquire);
                    let enlarged = (current + TIMEOUT_STEP.as_millis() as u64).min(max);
                    if enlarged != current {
                        shared
                            .current_timeout_ms
                            .store(enlarged, Ordering::Release);
                        module.set_timeout(Duration::from_millis(enlarged));
                        info!("increasing timeout from {current}ms to {enlarged}ms");
                    }
                }
            }

            (
                outcome,
                module.username().to_string(),
                module.protocol_name().to_string(),
                module.target().to_string(),
            )
        };
        let elapsed = started.elapsed();

        match outcome {
            Err(e) if e.is_transient() => {
                queue.unget();
                let count = shared.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
                warn!("transient fault, re-queuing password (consecutive errors: {count}): {e}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = errors.send(e) => {}
                }
            }
            outcome => {
                shared.consecutive_errors.store(0, Ordering::Release);
                let (success, error) = match outcome {
                    Ok(success) => (success, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                let result = AttemptResult {
                    username,
                    password,
                    success,
                    error,
                    protocol,
                    target,
                    elapsed,
                    attempted_at: Utc::now(),
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = results.send(result) => {}
                }
            }
        }
    }
}
