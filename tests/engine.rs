//! Engine and multi-target engine behavior against a scriptable mock
//! module.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use rosbrute::core::engine::{AttemptResult, Engine};
use rosbrute::core::multi_engine::{MultiTargetEngine, MultiTargetError, MultiTargetResult};
use rosbrute::core::protocols::{
    ModuleFactory, ModuleOptions, ProtocolError, RouterModule,
};
use rosbrute::core::resume::{ResumeState, TargetProgress};
use rosbrute::core::targets::Target;
use rosbrute::core::tracker::ProgressTracker;

#[derive(Default, Clone)]
struct MockConfig {
    valid_password: Option<String>,
    refuse_connect: bool,
    /// Passwords that fail with a transient fault the first time they are
    /// attempted, then behave normally.
    transient_once: Vec<String>,
    always_transient: bool,
}

#[derive(Default)]
struct MockLog {
    /// Every authenticate call, as "target/password".
    attempts: Mutex<Vec<String>>,
    connects: AtomicUsize,
    /// Set when two authenticate calls overlap in time.
    overlap_detected: AtomicBool,
}

impl MockLog {
    fn attempts_for(&self, target: &str) -> Vec<String> {
        let prefix = format!("{target}/");
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|a| a.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

struct MockModule {
    target: String,
    username: String,
    connected: bool,
    config: MockConfig,
    pending_transient: HashSet<String>,
    log: Arc<MockLog>,
    in_flight: Arc<AtomicBool>,
}

#[async_trait]
impl RouterModule for MockModule {
    fn initialize(
        &mut self,
        target: &str,
        username: &str,
        _options: &ModuleOptions,
    ) -> Result<(), ProtocolError> {
        self.target = target.to_string();
        self.username = username.to_string();
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.config.refuse_connect {
            return Err(ProtocolError::Connection {
                target: self.target.clone(),
                detail: "connection refused".to_string(),
            });
        }
        self.connected = true;
        self.log.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<bool, ProtocolError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.log.overlap_detected.store(true, Ordering::Release);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.in_flight.store(false, Ordering::Release);

        if self.config.always_transient {
            return Err(ProtocolError::Transient("connection reset".to_string()));
        }
        if self.pending_transient.remove(password) {
            return Err(ProtocolError::Transient("connection reset".to_string()));
        }

        self.log
            .attempts
            .lock()
            .unwrap()
            .push(format!("{}/{password}", self.target));

        Ok(self.config.valid_password.as_deref() == Some(password))
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.connected = false;
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn protocol_name(&self) -> &'static str {
        "mock"
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct MockFactory {
    config: MockConfig,
    log: Arc<MockLog>,
}

impl MockFactory {
    fn new(config: MockConfig) -> Self {
        Self {
            config,
            log: Arc::new(MockLog::default()),
        }
    }

    fn module(&self) -> Box<dyn RouterModule> {
        self.create_module()
    }
}

impl ModuleFactory for MockFactory {
    fn create_module(&self) -> Box<dyn RouterModule> {
        Box::new(MockModule {
            target: String::new(),
            username: String::new(),
            connected: false,
            config: self.config.clone(),
            pending_transient: self.config.transient_once.iter().cloned().collect(),
            log: Arc::clone(&self.log),
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    fn protocol_name(&self) -> &'static str {
        "mock"
    }
}

fn passwords(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn target(ip: &str) -> Target {
    Target {
        username: "admin".to_string(),
        ip: ip.to_string(),
        port: 8728,
        command: String::new(),
    }
}

/// Drive a per-target engine to completion and return its published
/// results and errors.
async fn run_engine(
    mut engine: Engine,
    cancel: CancellationToken,
) -> (Vec<AttemptResult>, Vec<ProtocolError>) {
    engine.start(cancel).await.unwrap();

    let mut results_rx = engine.results();
    let results = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(r) = results_rx.recv().await {
            out.push(r);
        }
        out
    });

    let mut errors_rx = engine.errors();
    let errors = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(e) = errors_rx.recv().await {
            out.push(e);
        }
        out
    });

    engine.wait_for_completion().await;
    engine.close().await;
    (results.await.unwrap(), errors.await.unwrap())
}

/// Drive a multi-target engine to completion.
async fn run_multi(
    mut engine: MultiTargetEngine,
    cancel: CancellationToken,
) -> (Vec<MultiTargetResult>, Vec<MultiTargetError>) {
    engine.start(cancel);

    let mut results_rx = engine.results();
    let results = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(r) = results_rx.recv().await {
            out.push(r);
        }
        out
    });

    let mut errors_rx = engine.errors();
    let errors = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(e) = errors_rx.recv().await {
            out.push(e);
        }
        out
    });

    engine.wait_for_completion().await;
    (results.await.unwrap(), errors.await.unwrap())
}

fn state_for(targets: &[Target], protocol: &str) -> ResumeState {
    ResumeState {
        timestamp: chrono::Utc::now(),
        protocol: protocol.to_string(),
        username: "admin".to_string(),
        password_file: "/tmp/words.txt".to_string(),
        target_file: None,
        workers: 2,
        rate_limit: "0s".to_string(),
        options: None,
        targets: targets
            .iter()
            .map(|t| TargetProgress::new(&t.ip, t.port, &t.username))
            .collect(),
    }
}

#[tokio::test]
async fn single_worker_finds_the_valid_password() {
    let factory = MockFactory::new(MockConfig {
        valid_password: Some("mikrotik".to_string()),
        ..MockConfig::default()
    });

    let mut module = factory.module();
    module
        .initialize("192.0.2.1", "admin", &ModuleOptions::default())
        .unwrap();
    let mut engine = Engine::new(module, 1, Duration::ZERO);
    engine.load_passwords(passwords(&["a", "b", "c", "mikrotik"]));

    let (results, errors) = run_engine(engine, CancellationToken::new()).await;

    assert_eq!(results.len(), 4);
    assert!(errors.is_empty());
    let hit = results.iter().find(|r| r.success).unwrap();
    assert_eq!(hit.password, "mikrotik");
    assert_eq!(hit.username, "admin");
    assert_eq!(hit.protocol, "mock");
    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
}

#[tokio::test]
async fn transient_fault_requeues_the_password() {
    let factory = MockFactory::new(MockConfig {
        transient_once: vec!["b".to_string()],
        ..MockConfig::default()
    });
    let log = Arc::clone(&factory.log);

    let mut module = factory.module();
    module
        .initialize("192.0.2.1", "admin", &ModuleOptions::default())
        .unwrap();
    let mut engine = Engine::new(module, 1, Duration::ZERO);
    engine.load_passwords(passwords(&["a", "b", "c"]));

    let (results, errors) = run_engine(engine, CancellationToken::new()).await;

    // All three passwords got a verdict despite the blip on "b".
    let mut verdicts: Vec<_> = results.iter().map(|r| r.password.clone()).collect();
    verdicts.sort();
    assert_eq!(verdicts, vec!["a", "b", "c"]);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_transient());
    assert_eq!(log.attempts_for("192.0.2.1"), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn consecutive_transient_faults_stop_the_workers() {
    let factory = MockFactory::new(MockConfig {
        always_transient: true,
        ..MockConfig::default()
    });

    let mut module = factory.module();
    module
        .initialize("192.0.2.1", "admin", &ModuleOptions::default())
        .unwrap();
    let mut engine = Engine::new(module, 1, Duration::ZERO);
    engine.set_max_consecutive_errors(3);
    engine.load_passwords(passwords(&["a", "b", "c", "d", "e", "f", "g", "h"]));

    let (results, errors) = run_engine(engine, CancellationToken::new()).await;

    assert!(results.is_empty());
    assert_eq!(errors.len(), 3);
}

#[tokio::test]
async fn authenticate_calls_are_serialized_across_workers() {
    let factory = MockFactory::new(MockConfig::default());
    let log = Arc::clone(&factory.log);

    let mut module = factory.module();
    module
        .initialize("192.0.2.1", "admin", &ModuleOptions::default())
        .unwrap();
    let mut engine = Engine::new(module, 4, Duration::ZERO);
    engine.load_passwords((0..40).map(|i| format!("pw{i}")).collect());

    let (results, _) = run_engine(engine, CancellationToken::new()).await;

    assert_eq!(results.len(), 40);
    assert!(!log.overlap_detected.load(Ordering::Acquire));
}

#[tokio::test]
async fn every_target_produces_exactly_one_result() {
    let factory = Arc::new(MockFactory::new(MockConfig {
        valid_password: Some("pw2".to_string()),
        ..MockConfig::default()
    }));

    let targets = vec![target("192.0.2.1"), target("192.0.2.2"), target("192.0.2.3")];
    let mut engine = MultiTargetEngine::new(factory, 2, 2, Duration::ZERO);
    engine.load_targets(targets.clone());
    engine.load_passwords(passwords(&["pw1", "pw2", "pw3"]));

    let (results, errors) = run_multi(engine, CancellationToken::new()).await;

    assert_eq!(results.len(), targets.len());
    assert!(errors.is_empty());
    let mut seen: Vec<_> = results.iter().map(|r| r.target.ip.clone()).collect();
    seen.sort();
    assert_eq!(seen, vec!["192.0.2.1", "192.0.2.2", "192.0.2.3"]);
    for result in &results {
        assert!(result.success);
        assert_eq!(result.success_password.as_deref(), Some("pw2"));
        assert!(result.attempts <= 3);
    }
}

#[tokio::test]
async fn unreachable_target_emits_one_error_and_no_result() {
    let factory = Arc::new(MockFactory::new(MockConfig {
        refuse_connect: true,
        ..MockConfig::default()
    }));

    let mut engine = MultiTargetEngine::new(factory, 3, 1, Duration::ZERO);
    engine.load_targets(vec![target("192.0.2.99")]);
    engine.load_passwords(passwords(&["a", "b"]));

    let (results, errors) = run_multi(engine, CancellationToken::new()).await;

    assert!(results.is_empty());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].target.ip, "192.0.2.99");
    assert!(errors[0].error.is_transient());
}

#[tokio::test]
async fn zero_targets_close_the_channels_immediately() {
    let factory = Arc::new(MockFactory::new(MockConfig::default()));
    let mut engine = MultiTargetEngine::new(factory, 2, 1, Duration::ZERO);
    engine.load_passwords(passwords(&["only"]));

    let (results, errors) = run_multi(engine, CancellationToken::new()).await;
    assert!(results.is_empty());
    assert!(errors.is_empty());
}

#[tokio::test]
async fn resume_skips_tried_passwords_and_completed_targets() {
    let factory = Arc::new(MockFactory::new(MockConfig::default()));
    let log = Arc::clone(&factory.log);

    let targets = vec![target("192.0.2.1"), target("192.0.2.2")];
    let mut state = state_for(&targets, "mock");
    {
        let t1 = state.target_progress_mut("192.0.2.1", 8728).unwrap();
        t1.passwords_tried = 3;
        t1.timeout_ms = 2500;
    }
    {
        let t2 = state.target_progress_mut("192.0.2.2", 8728).unwrap();
        t2.completed = true;
    }

    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ProgressTracker::new(
        state,
        dir.path(),
        Duration::from_secs(3600),
        true,
    ));
    tracker.start();

    let mut engine = MultiTargetEngine::new(factory, 1, 2, Duration::ZERO);
    engine.load_targets(targets);
    engine.load_passwords(passwords(&["p1", "p2", "p3", "p4", "p5", "p6"]));
    engine.set_tracker(Arc::clone(&tracker));

    let (results, errors) = run_multi(engine, CancellationToken::new()).await;
    tracker.stop().await;

    // Only the unfinished target ran, and only over the untried suffix.
    assert_eq!(results.len(), 1);
    assert!(errors.is_empty());
    assert_eq!(results[0].target.ip, "192.0.2.1");
    assert_eq!(results[0].attempts, 3);
    assert_eq!(log.attempts_for("192.0.2.1"), vec!["p4", "p5", "p6"]);
    assert!(log.attempts_for("192.0.2.2").is_empty());

    let final_state = tracker.get_state();
    let t1 = final_state.get_target_progress("192.0.2.1", 8728).unwrap();
    assert!(t1.completed);
    assert_eq!(t1.passwords_tried, 6);
    // The adaptive timeout seeded from the checkpoint survives untouched.
    assert_eq!(t1.timeout_ms, 2500);
}

#[tokio::test]
async fn dead_host_is_flagged_in_the_tracker() {
    let factory = Arc::new(MockFactory::new(MockConfig {
        always_transient: true,
        ..MockConfig::default()
    }));

    let targets = vec![target("192.0.2.7")];
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ProgressTracker::new(
        state_for(&targets, "mock"),
        dir.path(),
        Duration::from_secs(3600),
        true,
    ));
    tracker.start();

    let mut engine = MultiTargetEngine::new(factory, 1, 1, Duration::ZERO);
    engine.load_targets(targets);
    engine.load_passwords(passwords(&["a", "b", "c"]));
    engine.set_max_consecutive_errors(2);
    engine.set_tracker(Arc::clone(&tracker));

    let (results, errors) = run_multi(engine, CancellationToken::new()).await;
    tracker.stop().await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(errors.is_empty());

    let progress = tracker.get_target_progress("192.0.2.7", 8728).unwrap();
    assert!(progress.dead);
    assert!(progress.completed);
    assert!(!progress.success);
    assert!(progress.consecutive_errors >= 2);
}

#[tokio::test]
async fn cancellation_stops_the_attack_and_publishes_partial_results() {
    let factory = Arc::new(MockFactory::new(MockConfig::default()));

    let mut engine = MultiTargetEngine::new(factory, 1, 1, Duration::from_millis(50));
    engine.load_targets(vec![target("192.0.2.1")]);
    engine.load_passwords((0..10_000).map(|i| format!("pw{i}")).collect());

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let (results, _errors) = run_multi(engine, cancel).await;
    canceller.await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].attempts < 10_000);
}
