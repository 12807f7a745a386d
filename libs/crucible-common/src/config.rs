// Harness configuration shared by the worker and the CLI

use std::path::PathBuf;

pub const DEFAULT_DATASET_PATH: &str = "dataset/tasks.json";

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub dataset_path: PathBuf,
    pub rounds: u32,
    pub generation_workers: usize,
    /// 1 runs executions one after another; 0 means one per available core.
    pub execution_workers: usize,
    pub timeout_seconds: u64,
    pub pass_threshold: f64,
    pub revalidate_done: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self {
            dataset_path: PathBuf::from(DEFAULT_DATASET_PATH),
            rounds: 2,
            generation_workers: 5,
            execution_workers: 1,
            timeout_seconds: 20,
            pass_threshold: 1.0,
            revalidate_done: true,
        }
    }

    /// Defaults overlaid with `CRUCIBLE_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();

        if let Some(path) = lookup("CRUCIBLE_DATASET") {
            config.dataset_path = PathBuf::from(path);
        }
        if let Some(v) = lookup("CRUCIBLE_ROUNDS").and_then(|v| v.parse().ok()) {
            config.rounds = v;
        }
        if let Some(v) = lookup("CRUCIBLE_GENERATION_WORKERS").and_then(|v| v.parse().ok()) {
            config.generation_workers = v;
        }
        if let Some(v) = lookup("CRUCIBLE_EXECUTION_WORKERS").and_then(|v| v.parse().ok()) {
            config.execution_workers = v;
        }
        if let Some(v) = lookup("CRUCIBLE_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            config.timeout_seconds = v;
        }
        if let Some(v) = lookup("CRUCIBLE_PASS_THRESHOLD").and_then(|v| v.parse().ok()) {
            config.pass_threshold = v;
        }
        if let Some(v) = lookup("CRUCIBLE_REVALIDATE_DONE").and_then(|v| v.parse().ok()) {
            config.revalidate_done = v;
        }

        config
    }

    /// Execution pool size with 0 resolved to the number of cores.
    pub fn effective_execution_workers(&self) -> usize {
        match self.execution_workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::new();
        assert_eq!(config.rounds, 2);
        assert_eq!(config.generation_workers, 5);
        assert_eq!(config.execution_workers, 1);
        assert_eq!(config.timeout_seconds, 20);
        assert_eq!(config.pass_threshold, 1.0);
        assert!(config.revalidate_done);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("CRUCIBLE_ROUNDS", "4"),
            ("CRUCIBLE_TIMEOUT_SECONDS", "7"),
            ("CRUCIBLE_GENERATION_WORKERS", "not-a-number"),
            ("CRUCIBLE_REVALIDATE_DONE", "false"),
        ]
        .into_iter()
        .collect();

        let config = HarnessConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.rounds, 4);
        assert_eq!(config.timeout_seconds, 7);
        assert_eq!(config.generation_workers, 5);
        assert!(!config.revalidate_done);
    }

    #[test]
    fn test_zero_execution_workers_means_cores() {
        let mut config = HarnessConfig::new();
        config.execution_workers = 0;
        assert!(config.effective_execution_workers() >= 1);
    }
}
