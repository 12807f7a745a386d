use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a task across rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    /// Some attempt reached a perfect score.
    Done,
    /// Round budget exhausted without a perfect score.
    Failed,
    /// The generation service never produced a usable program.
    GenerationExhausted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::GenerationExhausted => "generation_exhausted",
        };
        write!(f, "{}", s)
    }
}

/// One unit of work: a prompt, a skeleton, and its accumulated history.
///
/// The on-disk shape keeps the two parallel lists `completion_list` and
/// `test_case_list`; code should go through [`Task::attempts`] and
/// [`Task::push_attempt`] so the positional pairing cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(alias = "game")]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub backbone: String,
    #[serde(default)]
    pub completion_list: Vec<String>,
    #[serde(default)]
    pub test_case_list: Vec<String>,
    #[serde(default)]
    pub report_accuracy: f64,
    #[serde(default)]
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_accuracies: Vec<f64>,
    #[serde(default, skip_serializing_if = "is_pending")]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rounds_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_at: Option<DateTime<Utc>>,
    /// Fields written by other tools, carried through load and save untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_pending(status: &TaskStatus) -> bool {
    *status == TaskStatus::Pending
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A candidate implementation paired with the test suite it is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt<'a> {
    pub index: usize,
    pub implementation: &'a str,
    pub tests: &'a str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("task has {completions} completions but {test_suites} test suites")]
    Misaligned {
        completions: usize,
        test_suites: usize,
    },
}

impl Task {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>, backbone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            backbone: backbone.into(),
            completion_list: Vec::new(),
            test_case_list: Vec::new(),
            report_accuracy: 0.0,
            passed: false,
            attempt_accuracies: Vec::new(),
            status: TaskStatus::Pending,
            rounds_completed: 0,
            scored_at: None,
            extra: Map::new(),
        }
    }

    /// Pair `completion_list[i]` with `test_case_list[i]`.
    pub fn attempts(&self) -> Result<Vec<Attempt<'_>>, PairingError> {
        if self.completion_list.len() != self.test_case_list.len() {
            return Err(PairingError::Misaligned {
                completions: self.completion_list.len(),
                test_suites: self.test_case_list.len(),
            });
        }

        Ok(self
            .completion_list
            .iter()
            .zip(&self.test_case_list)
            .enumerate()
            .map(|(index, (implementation, tests))| Attempt {
                index,
                implementation,
                tests,
            })
            .collect())
    }

    /// Append a new attempt to both lists at once.
    pub fn push_attempt(&mut self, implementation: String, tests: String) {
        self.completion_list.push(implementation);
        self.test_case_list.push(tests);
    }

    /// Test suite of the most recent attempt, used to pair a regeneration.
    pub fn latest_tests(&self) -> Option<&str> {
        self.test_case_list.last().map(String::as_str)
    }

    /// Forget every score; the attempts they were computed from are gone.
    pub fn clear_score(&mut self) {
        self.report_accuracy = 0.0;
        self.passed = false;
        self.attempt_accuracies.clear();
        self.scored_at = None;
        self.rounds_completed = 0;
        self.status = TaskStatus::Pending;
    }

    /// Overwrite the score fields. `passed` is derived, never set directly.
    pub fn record_score(&mut self, attempt_accuracies: Vec<f64>) {
        let best = attempt_accuracies.iter().copied().fold(0.0_f64, f64::max);
        self.report_accuracy = best.clamp(0.0, 1.0);
        self.passed = self.report_accuracy == 1.0;
        self.attempt_accuracies = attempt_accuracies;
        self.scored_at = Some(Utc::now());
        if self.passed {
            self.status = TaskStatus::Done;
        } else if self.status == TaskStatus::Done {
            self.status = TaskStatus::Pending;
        }
    }
}

/// Raw output of one sandboxed execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Exited 0 within the deadline.
    pub fn ran_cleanly(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Outcome of a single named test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    Failed,
    Errored,
}

/// Names of tests per outcome, each in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdicts {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub errored: Vec<String>,
}

impl Verdicts {
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.errored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Fraction of parsed tests that passed; 0 when nothing was parsed.
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.passed.len() as f64 / total as f64
        }
    }

    pub fn push(&mut self, name: String, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passed.push(name),
            Outcome::Failed => self.failed.push(name),
            Outcome::Errored => self.errored.push(name),
        }
    }
}
