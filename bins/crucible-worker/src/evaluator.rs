/// Test Evaluator - Verdict Parsing and Accuracy
///
/// **Core Responsibility:**
/// Turn the free-form diagnostic stream of a unit-test run into per-test
/// verdicts and a single accuracy number.
///
/// **Critical Properties:**
/// - Knows nothing about processes, temp files or deadlines
/// - Knows nothing about the dataset or rounds
/// - Pure function: (diagnostic text) → verdicts
/// - Deterministic: parsing the same text twice yields identical verdicts
///
/// **Report Format:**
/// One line per test in the verbose unittest shape
/// `test_name (module.Class.test_name) ... ok|FAIL|ERROR`.
/// Lines that do not match (tracebacks, prints, truncated tails) are ignored.
///
/// **Scoring Rules:**
/// - accuracy = passed / (passed + failed + errored)
/// - Nothing parsed (import error, syntax error, timeout) → accuracy 0

use crucible_common::types::{ExecutionResult, Outcome, Verdicts};
use regex::Regex;
use std::sync::OnceLock;
use tracing::trace;

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(test\w*) \(([^\n]*?)\) \.\.\. (ok|FAIL|ERROR)\b")
            .expect("verdict pattern is valid")
    })
}

/// One classified line of a test report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVerdict {
    pub name: String,
    pub context: String,
    pub outcome: Outcome,
}

/// Score of one (implementation, test suite) execution
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptScore {
    pub verdicts: Verdicts,
    pub accuracy: f64,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
}

/// Extract every classified test line, in order of appearance
pub fn parse_report(diagnostics: &str) -> Vec<TestVerdict> {
    verdict_regex()
        .captures_iter(diagnostics)
        .filter_map(|caps| {
            let outcome = match caps.get(3)?.as_str() {
                "ok" => Outcome::Passed,
                "FAIL" => Outcome::Failed,
                "ERROR" => Outcome::Errored,
                _ => return None,
            };
            Some(TestVerdict {
                name: caps.get(1)?.as_str().to_string(),
                context: caps.get(2)?.as_str().to_string(),
                outcome,
            })
        })
        .collect()
}

/// Group test names by outcome
pub fn parse_verdicts(diagnostics: &str) -> Verdicts {
    let mut verdicts = Verdicts::default();
    for verdict in parse_report(diagnostics) {
        trace!(test = %verdict.name, context = %verdict.context, outcome = ?verdict.outcome, "Verdict");
        verdicts.push(verdict.name, verdict.outcome);
    }
    verdicts
}

/// Score a raw execution
///
/// A timed-out run is never parsed: the runner replaced its output with a
/// sentinel, so it contributes zero verdicts and accuracy 0.
pub fn score(execution: &ExecutionResult) -> AttemptScore {
    let verdicts = if execution.timed_out {
        Verdicts::default()
    } else {
        parse_verdicts(&execution.stderr)
    };

    AttemptScore {
        accuracy: verdicts.accuracy(),
        verdicts,
        timed_out: execution.timed_out,
        exit_code: execution.exit_code,
        execution_time_ms: execution.execution_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITTEST_REPORT: &str = "\
test_ball_moves (__main__.TestCatcher.test_ball_moves) ... ok
test_catcher_bounds (__main__.TestCatcher.test_catcher_bounds) ... FAIL
test_score_increments (__main__.TestCatcher.test_score_increments) ... ERROR
test_reset (__main__.TestCatcher.test_reset) ... ok

======================================================================
ERROR: test_score_increments (__main__.TestCatcher.test_score_increments)
----------------------------------------------------------------------
Traceback (most recent call last):
  File \"test_suite.py\", line 40, in test_score_increments
AttributeError: 'Game' object has no attribute 'score'

----------------------------------------------------------------------
Ran 4 tests in 0.012s

FAILED (failures=1, errors=1)
";

    fn execution(stderr: &str) -> ExecutionResult {
        ExecutionResult {
            stderr: stderr.to_string(),
            exit_code: Some(1),
            ..ExecutionResult::default()
        }
    }

    #[test]
    fn test_ok_and_fail_markers() {
        let verdicts = parse_verdicts("test_a (x.T.test_a) ... ok\ntest_b (x.T.test_b) ... FAIL\n");

        assert_eq!(verdicts.passed, vec!["test_a"]);
        assert_eq!(verdicts.failed, vec!["test_b"]);
        assert!(verdicts.errored.is_empty());
        assert_eq!(verdicts.accuracy(), 0.5);
    }

    #[test]
    fn test_full_unittest_report() {
        let verdicts = parse_verdicts(UNITTEST_REPORT);

        assert_eq!(verdicts.passed, vec!["test_ball_moves", "test_reset"]);
        assert_eq!(verdicts.failed, vec!["test_catcher_bounds"]);
        assert_eq!(verdicts.errored, vec!["test_score_increments"]);
        assert_eq!(verdicts.accuracy(), 0.5);
    }

    #[test]
    fn test_traceback_header_is_not_a_verdict() {
        // "ERROR: test_x (...)" lines in the summary must not double count
        let report = parse_report(UNITTEST_REPORT);
        assert_eq!(report.len(), 4);
        assert_eq!(report[2].context, "__main__.TestCatcher.test_score_increments");
    }

    #[test]
    fn test_empty_diagnostics() {
        let verdicts = parse_verdicts("");
        assert!(verdicts.is_empty());
        assert_eq!(verdicts.accuracy(), 0.0);
    }

    #[test]
    fn test_import_error_yields_nothing() {
        let stderr = "Traceback (most recent call last):\n  File \"test_suite.py\", line 1\nModuleNotFoundError: No module named 'pygame'\n";
        let score = score(&execution(stderr));

        assert!(score.verdicts.is_empty());
        assert_eq!(score.accuracy, 0.0);
    }

    #[test]
    fn test_truncated_output_is_tolerated() {
        let stderr = "test_a (x.T.test_a) ... ok\ntest_b (x.T.test_b) ... FA";
        let verdicts = parse_verdicts(stderr);

        assert_eq!(verdicts.passed, vec!["test_a"]);
        assert_eq!(verdicts.total(), 1);
    }

    #[test]
    fn test_parsing_is_idempotent() {
        assert_eq!(parse_verdicts(UNITTEST_REPORT), parse_verdicts(UNITTEST_REPORT));
        assert_eq!(parse_report(UNITTEST_REPORT), parse_report(UNITTEST_REPORT));
    }

    #[test]
    fn test_skipped_and_expected_failures_are_unclassified() {
        let stderr = "test_a (x.T.test_a) ... skipped 'no display'\ntest_b (x.T.test_b) ... expected failure\ntest_c (x.T.test_c) ... ok\n";
        let verdicts = parse_verdicts(stderr);

        assert_eq!(verdicts.passed, vec!["test_c"]);
        assert_eq!(verdicts.accuracy(), 1.0);
    }

    #[test]
    fn test_timed_out_execution_scores_zero() {
        let timed_out = ExecutionResult {
            stderr: "test_a (x.T.test_a) ... ok".to_string(),
            timed_out: true,
            ..ExecutionResult::default()
        };
        let score = score(&timed_out);

        assert!(score.timed_out);
        assert!(score.verdicts.is_empty());
        assert_eq!(score.accuracy, 0.0);
    }

    #[test]
    fn test_score_keeps_execution_metadata() {
        let mut exec = execution("test_a (x.T.test_a) ... ok\n");
        exec.execution_time_ms = 42;
        let score = score(&exec);

        assert_eq!(score.accuracy, 1.0);
        assert_eq!(score.exit_code, Some(1));
        assert_eq!(score.execution_time_ms, 42);
    }
}
