/// Attempt Executor - High-Level Orchestration of One Execution Phase
///
/// **Responsibility:**
/// Coordinate the process engine and the evaluator to score attempts.
///
/// **Architecture:**
/// 1. Use ProcessEngine to run each pair in its own sandbox (engine.rs)
/// 2. Use the Evaluator to parse verdicts and compute accuracy (evaluator.rs)
/// 3. Return one AttemptScore per attempt, in submission order
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How reports are parsed (evaluator's job)
/// - Rounds, thresholds or regeneration (runner's job)
///
/// A failure here is never an error to the caller: infrastructure problems
/// (spawn failure, unwritable temp dir) degrade to an attempt with zero
/// verdicts so one broken task cannot stop the batch.

use crate::engine::{bound_event_loop, ProcessEngine};
use crate::evaluator::{self, AttemptScore};
use crucible_common::types::{ExecutionResult, Verdicts};
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Transient, owned copy of one attempt handed to the engine
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub task_index: usize,
    pub task_name: String,
    pub attempt_index: usize,
    pub implementation: String,
    pub tests: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout: Duration,
    /// Apply the `while running:` rewrite to implementations before running
    pub bound_event_loop: bool,
    /// Executions in flight at once; 1 keeps the phase strictly sequential
    pub workers: usize,
}

/// Execute and score a single attempt
pub async fn execute_attempt(
    engine: &ProcessEngine,
    job: &ExecutionJob,
    options: &ExecutionOptions,
) -> AttemptScore {
    let implementation = if options.bound_event_loop {
        bound_event_loop(&job.implementation, engine.runtime().sanity_iterations)
    } else {
        job.implementation.clone()
    };

    let execution = match engine.execute(&implementation, &job.tests, options.timeout).await {
        Ok(execution) => execution,
        Err(e) => {
            error!(
                task = %job.task_name,
                attempt = job.attempt_index,
                error = %format!("{:#}", e),
                "Execution infrastructure failed; attempt scores 0"
            );
            return AttemptScore {
                verdicts: Verdicts::default(),
                accuracy: 0.0,
                timed_out: false,
                exit_code: None,
                execution_time_ms: 0,
            };
        }
    };

    log_execution_flags(job, &execution);

    let score = evaluator::score(&execution);

    debug!(
        task = %job.task_name,
        attempt = job.attempt_index,
        passed = score.verdicts.passed.len(),
        failed = score.verdicts.failed.len(),
        errored = score.verdicts.errored.len(),
        accuracy = score.accuracy,
        execution_ms = score.execution_time_ms,
        "Attempt scored"
    );

    score
}

/// Execute every job with bounded concurrency
///
/// Results come back in the same order as `jobs`, whatever order the
/// executions finish in.
pub async fn execute_jobs(
    engine: &ProcessEngine,
    jobs: Vec<ExecutionJob>,
    options: &ExecutionOptions,
) -> Vec<(ExecutionJob, AttemptScore)> {
    let workers = options.workers.max(1);

    stream::iter(jobs)
        .map(|job| async move {
            let score = execute_attempt(engine, &job, options).await;
            (job, score)
        })
        .buffered(workers)
        .collect()
        .await
}

// Cross-layer guard: surface why an attempt cannot score before evaluation
fn log_execution_flags(job: &ExecutionJob, execution: &ExecutionResult) {
    if execution.timed_out {
        warn!(
            task = %job.task_name,
            attempt = job.attempt_index,
            execution_ms = execution.execution_time_ms,
            "Execution timed out; attempt cannot pass"
        );
    } else if execution.exit_code != Some(0) {
        debug!(
            task = %job.task_name,
            attempt = job.attempt_index,
            exit_code = ?execution.exit_code,
            stderr_head = execution.stderr.lines().next().unwrap_or(""),
            "Execution exited non-zero"
        );
    }
}
