/// Round Orchestrator - Bounded Execute / Score / Repair Loop
///
/// **Core Responsibility:**
/// Drive the whole dataset through a fixed number of rounds. Every round is
/// a barrier: all attempts of all tasks are executed and scored before any
/// task is sent back for regeneration.
///
/// **Per-task lifecycle:**
/// Executing → Scored → Done (an attempt scored 1.0, task frozen)
///                    → Generating (one fresh attempt appended) → next round
/// When the round budget runs out, tasks still below the threshold are
/// Failed. History is never discarded; every attempt stays on the task.
///
/// **Persistence:**
/// The dataset is saved after every round, so an interrupted run loses at
/// most the round in progress.

use crate::engine::ProcessEngine;
use crate::executor::{execute_jobs, ExecutionJob, ExecutionOptions};
use crate::generator::{Requester, Role, TaskPrompt};
use anyhow::{Context, Result};
use crucible_common::config::HarnessConfig;
use crucible_common::dataset::DatasetStore;
use crucible_common::types::{Task, TaskStatus};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Where a task is in the current round, for tracing only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Generating,
    Executing,
    Scored,
    Done,
    Failed,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPhase::Generating => "generating",
            TaskPhase::Executing => "executing",
            TaskPhase::Scored => "scored",
            TaskPhase::Done => "done",
            TaskPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct RoundSettings {
    pub rounds: u32,
    /// Tasks scoring below this are regenerated
    pub pass_threshold: f64,
    /// Re-execute tasks that are already Done
    pub revalidate_done: bool,
    pub generation_workers: usize,
    pub execution: ExecutionOptions,
}

impl RoundSettings {
    pub fn from_harness(config: &HarnessConfig, bound_event_loop: bool) -> Self {
        Self {
            rounds: config.rounds,
            pass_threshold: config.pass_threshold,
            revalidate_done: config.revalidate_done,
            generation_workers: config.generation_workers,
            execution: ExecutionOptions {
                timeout: Duration::from_secs(config.timeout_seconds),
                bound_event_loop,
                workers: config.effective_execution_workers(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub round: u32,
    /// Attempts executed this round
    pub executed: usize,
    pub passed: usize,
    pub below_threshold: usize,
    pub regenerated: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub accuracy: f64,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub rounds: Vec<RoundReport>,
    pub passed: usize,
    pub failed: usize,
    pub per_task: Vec<TaskOutcome>,
}

impl RunSummary {
    fn from_tasks(rounds: Vec<RoundReport>, tasks: &[Task]) -> Self {
        let per_task: Vec<TaskOutcome> = tasks
            .iter()
            .map(|t| TaskOutcome {
                name: t.name.clone(),
                status: t.status,
                accuracy: t.report_accuracy,
                attempts: t.completion_list.len(),
            })
            .collect();
        let passed = tasks.iter().filter(|t| t.passed).count();

        Self {
            rounds,
            passed,
            failed: tasks.len() - passed,
            per_task,
        }
    }
}

pub struct RoundOrchestrator {
    engine: ProcessEngine,
    requester: Requester,
    store: DatasetStore,
    settings: RoundSettings,
}

impl RoundOrchestrator {
    pub fn new(
        engine: ProcessEngine,
        requester: Requester,
        store: DatasetStore,
        settings: RoundSettings,
    ) -> Self {
        Self {
            engine,
            requester,
            store,
            settings,
        }
    }

    /// Run every round over the whole dataset
    ///
    /// Only dataset I/O failures are returned as errors. Candidate failures,
    /// timeouts and generation exhaustion are recorded on the task and the
    /// batch carries on.
    #[instrument(skip_all, fields(tasks = tasks.len(), rounds = self.settings.rounds))]
    pub async fn run(&self, tasks: &mut [Task]) -> Result<RunSummary> {
        // A new run gets a fresh budget
        for task in tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Failed | TaskStatus::GenerationExhausted) {
                task.status = TaskStatus::Pending;
            }
        }

        let mut reports = Vec::with_capacity(self.settings.rounds as usize);
        for round in 1..=self.settings.rounds {
            println!("→ Round {}/{}", round, self.settings.rounds);
            let report = self.run_round(round, tasks).await?;
            println!(
                "  executed {} attempts, {} passed, {} below threshold, {} regenerated, {} exhausted",
                report.executed, report.passed, report.below_threshold, report.regenerated, report.exhausted
            );
            reports.push(report);
        }

        if self.settings.rounds > 0 {
            self.mark_failed(tasks);
            self.store
                .save(tasks)
                .context("Failed to persist final task states")?;
        }

        Ok(RunSummary::from_tasks(reports, tasks))
    }

    #[instrument(skip(self, tasks))]
    async fn run_round(&self, round: u32, tasks: &mut [Task]) -> Result<RoundReport> {
        let mut report = RoundReport {
            round,
            ..RoundReport::default()
        };

        // Executing: one job per paired attempt, across the whole dataset
        let mut scheduled = vec![false; tasks.len()];
        let mut misaligned = vec![false; tasks.len()];
        let mut accuracies: Vec<Vec<f64>> = vec![Vec::new(); tasks.len()];
        let mut jobs = Vec::new();

        for (task_index, task) in tasks.iter().enumerate() {
            if task.status == TaskStatus::Done && !self.settings.revalidate_done {
                debug!(task = %task.name, "Already done; skipping execution");
                continue;
            }
            scheduled[task_index] = true;
            trace_phase(task, TaskPhase::Executing);

            match task.attempts() {
                Ok(attempts) => {
                    accuracies[task_index] = vec![0.0; attempts.len()];
                    jobs.extend(attempts.into_iter().map(|attempt| ExecutionJob {
                        task_index,
                        task_name: task.name.clone(),
                        attempt_index: attempt.index,
                        implementation: attempt.implementation.to_string(),
                        tests: attempt.tests.to_string(),
                    }));
                }
                Err(e) => {
                    warn!(task = %task.name, error = %e, "Attempts cannot be paired; task scores 0");
                    misaligned[task_index] = true;
                }
            }
        }

        report.executed = jobs.len();
        info!(round, attempts = report.executed, "Executing attempts");

        for (job, score) in execute_jobs(&self.engine, jobs, &self.settings.execution).await {
            accuracies[job.task_index][job.attempt_index] = score.accuracy;
        }

        // Scored
        for (task_index, task) in tasks.iter_mut().enumerate() {
            if !scheduled[task_index] {
                continue;
            }
            task.record_score(std::mem::take(&mut accuracies[task_index]));
            task.rounds_completed += 1;

            info!(
                task = %task.name,
                round,
                accuracy = task.report_accuracy,
                attempts = task.attempt_accuracies.len(),
                passed = task.passed,
                "Task scored"
            );
            trace_phase(task, if task.passed { TaskPhase::Done } else { TaskPhase::Scored });
        }

        report.passed = tasks.iter().filter(|t| t.passed).count();

        // Generating: exactly one fresh attempt per task still below threshold
        let mut prompts = Vec::new();
        for (task_index, task) in tasks.iter().enumerate() {
            if !self.below_threshold(task) {
                continue;
            }
            report.below_threshold += 1;

            if misaligned[task_index] {
                continue;
            }
            if task.latest_tests().is_none() {
                warn!(task = %task.name, "No test suite to pair a new attempt with; skipping regeneration");
                continue;
            }

            trace_phase(task, TaskPhase::Generating);
            prompts.push(TaskPrompt {
                task_index,
                name: task.name.clone(),
                prompt: task.prompt.clone(),
                backbone: task.backbone.clone(),
            });
        }

        if !prompts.is_empty() {
            let results = self
                .requester
                .fan_out(Role::Programmer, prompts, 1, self.settings.generation_workers)
                .await;

            for (task_index, result) in results {
                let task = &mut tasks[task_index];
                match result {
                    Ok(programs) => {
                        let tests = task.latest_tests().map(str::to_string);
                        if let (Some(program), Some(tests)) = (programs.into_iter().next(), tests) {
                            task.push_attempt(program, tests);
                            task.status = TaskStatus::Pending;
                            report.regenerated += 1;
                        }
                    }
                    Err(e) => {
                        warn!(task = %task.name, error = %e, "Regeneration exhausted");
                        task.status = TaskStatus::GenerationExhausted;
                        report.exhausted += 1;
                    }
                }
            }
        }

        self.store
            .save(tasks)
            .with_context(|| format!("Failed to persist dataset after round {}", round))?;
        debug!(round, path = %self.store.path().display(), "Dataset saved");

        Ok(report)
    }

    fn below_threshold(&self, task: &Task) -> bool {
        task.status != TaskStatus::Done && task.report_accuracy < self.settings.pass_threshold
    }

    // Exhausted tasks keep their more specific status
    fn mark_failed(&self, tasks: &mut [Task]) {
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Pending && self.below_threshold(task) {
                task.status = TaskStatus::Failed;
                trace_phase(task, TaskPhase::Failed);
            }
        }
    }
}

fn trace_phase(task: &Task, phase: TaskPhase) {
    debug!(task = %task.name, phase = %phase, "Phase transition");
}
