mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cli::{format_duration_text, parse_duration, Cli};
use rosbrute::core::diag;
use rosbrute::core::multi_engine::MultiTargetEngine;
use rosbrute::core::protocols::ModuleKind;
use rosbrute::core::resume::{load_resume_state, ResumeState, TargetProgress};
use rosbrute::core::stats::StatsTracker;
use rosbrute::core::targets::{Target, TargetParser};
use rosbrute::core::tracker::ProgressTracker;
use rosbrute::core::wordlist::load_passwords;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(
            e.kind(),
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
        ) =>
        {
            e.exit();
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let level = if cli.trace {
        LevelFilter::Trace
    } else if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Everything needed to start (or restart) an attack, resolved from either
/// the CLI flags or a resume file.
struct AttackPlan {
    kind: ModuleKind,
    workers: usize,
    rate_limit: std::time::Duration,
    https: bool,
    passwords: Vec<String>,
    targets: Vec<Target>,
    state: ResumeState,
}

async fn run(cli: Cli) -> Result<()> {
    cli.validate()?;

    let plan = if let Some(resume_path) = &cli.resume {
        resolve_resume_plan(&cli, resume_path)?
    } else {
        resolve_fresh_plan(&cli)?
    };

    info!(
        "starting {} attack: {} targets, {} passwords, {} workers per target",
        plan.kind,
        plan.targets.len(),
        plan.passwords.len(),
        plan.workers
    );

    let auto_save = !cli.save_progress.is_zero();
    let tracker = Arc::new(ProgressTracker::new(
        plan.state.clone(),
        &cli.save_dir,
        cli.save_progress,
        auto_save,
    ));
    tracker.start();

    let stats = StatsTracker::new(
        plan.passwords.len(),
        plan.targets.len(),
        cli.output_progress,
        Some(Arc::clone(&tracker)),
    );
    stats.start();

    // One root cancellation scope; the signal handler trips it.
    let root = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(root.clone(), Arc::clone(&interrupted));

    let mut engine = MultiTargetEngine::new(
        Arc::new(plan.kind),
        plan.workers,
        cli.concurrent_targets,
        plan.rate_limit,
    );
    engine.load_targets(plan.targets.clone());
    engine.load_passwords(plan.passwords.clone());
    engine.set_timeouts(cli.timeout, cli.max_timeout);
    engine.set_max_consecutive_errors(cli.max_conseq_err_per_host);
    engine.set_https(plan.https);
    engine.set_tracker(Arc::clone(&tracker));
    engine.start(root.clone());

    let mut results_rx = engine.results();
    let results_task = tokio::spawn(async move {
        let mut processed = 0usize;
        let mut successful = 0usize;
        while let Some(result) = results_rx.recv().await {
            processed += 1;
            if result.success {
                successful += 1;
                info!(
                    "valid credentials for {}@{}:{} - {} ({} attempts)",
                    result.target.username,
                    result.target.ip,
                    result.target.port,
                    result.success_password.as_deref().unwrap_or(""),
                    result.attempts
                );
            } else {
                info!(
                    "no valid credentials for {}:{} ({} attempts)",
                    result.target.ip, result.target.port, result.attempts
                );
            }
        }
        (processed, successful)
    });

    let mut errors_rx = engine.errors();
    let errors_task = tokio::spawn(async move {
        let mut failed = 0usize;
        while let Some(e) = errors_rx.recv().await {
            error!(
                "target {}:{} failed: {}",
                e.target.ip, e.target.port, e.error
            );
            failed += 1;
        }
        failed
    });

    engine.wait_for_completion().await;
    let (processed, successful) = results_task.await.unwrap_or((0, 0));
    let failed = errors_task.await.unwrap_or(0);

    stats.stop().await;
    tracker.stop().await;

    info!(
        "attack summary: {} targets, {processed} processed, {successful} successful, {failed} failed",
        plan.targets.len()
    );

    if interrupted.load(Ordering::Acquire) {
        let path = tracker.save_now().or_else(|| tracker.latest_save_path());
        if let Some(path) = path {
            diag::block(&format!(
                "Interrupted. To resume this attack, run:\n  rosbrute --resume {}\n",
                path.display()
            ));
        }
    }

    Ok(())
}

fn resolve_fresh_plan(cli: &Cli) -> Result<AttackPlan> {
    let command = cli.command.as_ref().expect("validated");
    let kind = command.kind();
    let port = command.port();

    let wordlist_path = cli.wordlist.as_ref().expect("validated");
    let passwords = load_passwords(wordlist_path)?;

    let targets = if let Some(target) = &cli.target {
        vec![Target {
            username: cli.user.clone(),
            ip: target.clone(),
            port,
            command: String::new(),
        }]
    } else {
        let target_file = cli.target_file.as_ref().expect("validated");
        let parser = TargetParser::new(&cli.user, port);
        let targets = parser.parse_file(target_file)?;
        anyhow::ensure!(!targets.is_empty(), "no valid targets in {target_file}");
        targets
    };

    let state = ResumeState {
        timestamp: chrono::Utc::now(),
        protocol: kind.protocol_name().to_string(),
        username: cli.user.clone(),
        password_file: absolute(wordlist_path),
        target_file: cli.target_file.as_deref().map(absolute),
        workers: cli.workers,
        rate_limit: format_duration_text(cli.rate),
        options: None,
        targets: targets
            .iter()
            .map(|t| TargetProgress::new(&t.ip, t.port, &t.username))
            .collect(),
    };

    Ok(AttackPlan {
        kind,
        workers: cli.workers,
        rate_limit: cli.rate,
        https: command.https(),
        passwords,
        targets,
        state,
    })
}

fn resolve_resume_plan(cli: &Cli, resume_path: &str) -> Result<AttackPlan> {
    let state = load_resume_state(resume_path)?;
    diag::block(&state.summary());

    let kind = ModuleKind::from_protocol_name(&state.protocol)
        .with_context(|| format!("unknown protocol {:?} in resume file", state.protocol))?;
    let rate_limit = parse_duration(&state.rate_limit)
        .with_context(|| format!("invalid rate limit {:?} in resume file", state.rate_limit))?;

    let passwords = load_passwords(&state.password_file)?;

    let targets = state
        .targets
        .iter()
        .map(|t| Target {
            username: t.username.clone(),
            ip: t.ip.clone(),
            port: t.port,
            command: String::new(),
        })
        .collect();

    // Protocol-specific settings come from the checkpoint, and the
    // checkpoint's `options` object is permanently absent, so the https
    // flag cannot be restored.
    if kind == ModuleKind::RestV7 {
        warn!("resuming a rest-v7 attack over plain HTTP; the https setting is not stored in checkpoints");
    }

    Ok(AttackPlan {
        kind,
        workers: state.workers,
        rate_limit,
        https: false,
        passwords,
        targets,
        state,
    })
}

fn absolute(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn spawn_signal_handler(root: CancellationToken, interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    interrupted.store(true, Ordering::Release);
                    root.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        diag::progress("interrupt received, saving progress and shutting down");
        interrupted.store(true, Ordering::Release);
        root.cancel();
    });
}
