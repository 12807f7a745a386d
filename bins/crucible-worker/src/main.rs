mod config;
mod engine;
mod evaluator;
mod executor;
mod generator;
mod runner;


use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use config::WorkerConfig;
use crucible_common::config::HarnessConfig;
use crucible_common::dataset::DatasetStore;
use crucible_common::types::{ExecutionResult, Task, TaskStatus};
use engine::ProcessEngine;
use generator::{OpenAiClient, PromptBook, Requester, RetryPolicy, Role, TaskPrompt};
use runner::{RoundOrchestrator, RoundSettings, RunSummary};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "crucible-worker")]
#[command(about = "Crucible Worker - Generate, execute and score candidate programs", long_about = None)]
struct Cli {
    /// Dataset file (defaults to $CRUCIBLE_DATASET or dataset/tasks.json)
    #[arg(long, global = true)]
    dataset: Option<PathBuf>,

    /// Worker config file (defaults to config/worker.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request completed implementations for every task
    Complete {
        /// Completions per task
        #[arg(short)]
        k: Option<usize>,

        /// Concurrent generation requests
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Request unit-test suites for every task
    DesignTests {
        /// Test suites per task (defaults to the task's completion count)
        #[arg(short)]
        k: Option<usize>,

        /// Concurrent generation requests
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run the execute / score / repair rounds
    Evaluate {
        #[arg(long)]
        rounds: Option<u32>,

        /// Concurrent generation requests
        #[arg(long)]
        workers: Option<usize>,

        /// Concurrent executions (0 = one per core)
        #[arg(long)]
        exec_workers: Option<usize>,

        /// Per-execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Accuracy below which a task is regenerated
        #[arg(long)]
        threshold: Option<f64>,

        /// Skip re-executing tasks that are already done
        #[arg(long, default_value = "false")]
        no_revalidate: bool,

        /// Rewrite `while running:` loops into bounded loops before executing
        #[arg(long, default_value = "false")]
        bound_event_loop: bool,
    },

    /// Check that each stored completion starts and exits on its own
    Sanity {
        /// Per-program timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut harness = HarnessConfig::from_env();
    if let Some(path) = cli.dataset {
        harness.dataset_path = path;
    }

    let worker_config = match &cli.config {
        Some(path) => WorkerConfig::load(path),
        None => WorkerConfig::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load worker configuration: {:#}", e);
        e
    })?;

    info!(
        dataset = %harness.dataset_path.display(),
        runtime = %worker_config.runtime.command,
        model = %worker_config.generation.model,
        "Crucible worker starting"
    );

    let store = DatasetStore::new(&harness.dataset_path);

    run_until_interrupted(
        run_command(cli.command, harness, worker_config, store),
        signal::ctrl_c(),
    )
    .await?;

    info!("Worker shutdown complete");
    Ok(())
}

/// Drive `work` to completion unless `interrupt` fires first
///
/// An interrupted batch is an error so the process exits non-zero.
async fn run_until_interrupted(
    work: impl Future<Output = Result<()>>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    tokio::select! {
        result = work => result,
        _ = interrupt => {
            warn!("Received interrupt, aborting batch");
            Err(anyhow!("Interrupted; the last completed round is on disk"))
        }
    }
}

async fn run_command(
    command: Commands,
    mut harness: HarnessConfig,
    worker_config: WorkerConfig,
    store: DatasetStore,
) -> Result<()> {
    match command {
        Commands::Complete { k, workers } => {
            let k = k.unwrap_or(worker_config.generation.completions_per_task);
            let workers = workers.unwrap_or(harness.generation_workers);
            let requester = build_requester(&worker_config)?;
            generate_pass(&store, &requester, Role::Programmer, Some(k), workers).await
        }
        Commands::DesignTests { k, workers } => {
            let k = k.or(worker_config.generation.tests_per_task);
            let workers = workers.unwrap_or(harness.generation_workers);
            let requester = build_requester(&worker_config)?;
            generate_pass(&store, &requester, Role::TestDesigner, k, workers).await
        }
        Commands::Evaluate {
            rounds,
            workers,
            exec_workers,
            timeout,
            threshold,
            no_revalidate,
            bound_event_loop,
        } => {
            if let Some(rounds) = rounds {
                harness.rounds = rounds;
            }
            if let Some(workers) = workers {
                harness.generation_workers = workers;
            }
            if let Some(exec_workers) = exec_workers {
                harness.execution_workers = exec_workers;
            }
            if let Some(timeout) = timeout {
                harness.timeout_seconds = timeout;
            }
            if let Some(threshold) = threshold {
                harness.pass_threshold = threshold;
            }
            if no_revalidate {
                harness.revalidate_done = false;
            }
            evaluate(&store, &worker_config, &harness, bound_event_loop).await
        }
        Commands::Sanity { timeout } => {
            let timeout = Duration::from_secs(timeout.unwrap_or(harness.timeout_seconds));
            sanity(&store, &worker_config, timeout).await
        }
    }
}

fn build_requester(worker_config: &WorkerConfig) -> Result<Requester> {
    let generation = &worker_config.generation;
    let client = OpenAiClient::from_config(generation)?;
    let prompts = PromptBook::from_config(generation)?;
    let retry = RetryPolicy::from_config(&generation.retry);
    Ok(Requester::new(Arc::new(client), prompts, retry))
}

fn task_prompt(task_index: usize, task: &Task) -> TaskPrompt {
    TaskPrompt {
        task_index,
        name: task.name.clone(),
        prompt: task.prompt.clone(),
        backbone: task.backbone.clone(),
    }
}

/// Fill `completion_list` or `test_case_list` for every task
///
/// With no explicit `k`, each task gets as many programs as it has
/// completions so attempts stay paired. A replaced list invalidates the
/// task's score, so the task is reopened.
async fn generate_pass(
    store: &DatasetStore,
    requester: &Requester,
    role: Role,
    k: Option<usize>,
    workers: usize,
) -> Result<()> {
    let mut tasks = store.load()?;

    println!("→ Requesting {:?} output for {} tasks", role, tasks.len());

    // Group by per-task count so each group is one bounded fan-out
    let mut groups: BTreeMap<usize, Vec<TaskPrompt>> = BTreeMap::new();
    for (task_index, task) in tasks.iter().enumerate() {
        let count = k.unwrap_or_else(|| task.completion_list.len().max(1));
        groups.entry(count).or_default().push(task_prompt(task_index, task));
    }

    let mut filled = 0;
    let mut exhausted = 0;
    for (count, prompts) in groups {
        for (task_index, result) in requester.fan_out(role, prompts, count, workers).await {
            let task = &mut tasks[task_index];
            match result {
                Ok(programs) => {
                    match role {
                        Role::Programmer => task.completion_list = programs,
                        Role::TestDesigner => task.test_case_list = programs,
                    }
                    task.clear_score();
                    filled += 1;
                }
                Err(e) => {
                    warn!(task = %task.name, error = %e, "Generation exhausted; task left unchanged");
                    task.status = TaskStatus::GenerationExhausted;
                    exhausted += 1;
                }
            }
        }
    }

    store.save(&tasks)?;

    println!("✅ {} tasks filled, {} exhausted", filled, exhausted);
    println!("📂 Saved to {}", store.path().display());
    Ok(())
}

async fn evaluate(
    store: &DatasetStore,
    worker_config: &WorkerConfig,
    harness: &HarnessConfig,
    bound_event_loop: bool,
) -> Result<()> {
    let mut tasks = store.load()?;
    let settings = RoundSettings::from_harness(harness, bound_event_loop);

    info!(
        tasks = tasks.len(),
        rounds = settings.rounds,
        timeout_s = harness.timeout_seconds,
        exec_workers = settings.execution.workers,
        generation_workers = settings.generation_workers,
        revalidate_done = settings.revalidate_done,
        "Starting evaluation"
    );

    let orchestrator = RoundOrchestrator::new(
        ProcessEngine::new(worker_config.runtime.clone()),
        build_requester(worker_config)?,
        DatasetStore::new(store.path()),
        settings,
    );

    let summary = orchestrator.run(&mut tasks).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n📋 Results:\n");
    println!("{:<30} {:<22} {:>9} {:>9}", "TASK", "STATUS", "ACCURACY", "ATTEMPTS");
    println!("{}", "─".repeat(73));
    for outcome in &summary.per_task {
        println!(
            "{:<30} {:<22} {:>9.3} {:>9}",
            outcome.name,
            outcome.status.to_string(),
            outcome.accuracy,
            outcome.attempts
        );
    }
    println!(
        "\n✅ {} passed, ❌ {} not passed after {} round(s)",
        summary.passed,
        summary.failed,
        summary.rounds.len()
    );
}

/// Per-program outcome of a sanity pass
#[derive(Debug, Default)]
struct SanityReport {
    clean: usize,
    total: usize,
    /// `(task name, completion index, reason)` for every program that did not run cleanly
    failures: Vec<(String, usize, String)>,
}

fn failure_reason(result: &ExecutionResult) -> String {
    if result.timed_out {
        return "timed out".to_string();
    }
    result
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .to_string()
}

/// Run every stored completion once; a program that cannot even be
/// launched is reported like any other failure.
async fn sanity_pass(engine: &ProcessEngine, tasks: &[Task], timeout: Duration) -> SanityReport {
    let mut report = SanityReport::default();
    for task in tasks {
        for (index, program) in task.completion_list.iter().enumerate() {
            report.total += 1;
            let reason = match engine.sanity_check(program, timeout).await {
                Ok(result) if result.ran_cleanly() => {
                    report.clean += 1;
                    println!("  ✅ {}[{}] ({} ms)", task.name, index, result.execution_time_ms);
                    continue;
                }
                Ok(result) => failure_reason(&result),
                Err(e) => {
                    warn!(task = %task.name, index, error = %e, "Sanity run failed to start");
                    format!("{:#}", e)
                }
            };
            println!("  ❌ {}[{}]: {}", task.name, index, reason);
            report.failures.push((task.name.clone(), index, reason));
        }
    }
    report
}

async fn sanity(store: &DatasetStore, worker_config: &WorkerConfig, timeout: Duration) -> Result<()> {
    let tasks = store.load()?;
    let engine = ProcessEngine::new(worker_config.runtime.clone());

    println!("→ Sanity-checking completions of {} tasks", tasks.len());

    let report = sanity_pass(&engine, &tasks, timeout).await;

    println!("\n{} of {} programs ran cleanly", report.clean, report.total);
    Ok(())
}
