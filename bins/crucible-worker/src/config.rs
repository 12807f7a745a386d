// Worker configuration: how candidates are executed and how the generation
// service is reached
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";

/// Variables that keep graphical and audio calls headless. Always applied
/// to the child; `RuntimeConfig::env` can override a value but not drop it.
const HEADLESS_ENV: [(&str, &str); 3] = [
    ("SDL_VIDEODRIVER", "dummy"),
    ("SDL_AUDIODRIVER", "dummy"),
    ("PYTHONUNBUFFERED", "1"),
];

/// Interpreter used to run a test suite against an implementation.
/// Invoked as `<command> <args..> <test-file> <implementation-file>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub file_extension: String,
    /// Extra child variables, layered over the headless set.
    pub env: BTreeMap<String, String>,
    pub max_output_bytes: usize,
    pub sanity_iterations: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: Vec::new(),
            file_extension: ".py".to_string(),
            env: BTreeMap::new(),
            max_output_bytes: 1024 * 1024,
            sanity_iterations: 300,
        }
    }
}

impl RuntimeConfig {
    /// Environment the child actually gets: headless defaults, then `env`
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, String> = HEADLESS_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        merged.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_base: String,
    pub model: String,
    /// Name of the environment variable holding the bearer key.
    pub api_key_env: String,
    pub request_timeout_seconds: u64,
    pub completions_per_task: usize,
    /// None means "as many as the task already has completions".
    pub tests_per_task: Option<usize>,
    pub language_tag: String,
    pub programmer_prompt_path: Option<PathBuf>,
    pub test_designer_prompt_path: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_seconds: 120,
            completions_per_task: 1,
            tests_per_task: None,
            language_tag: "python".to_string(),
            programmer_prompt_path: None,
            test_designer_prompt_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Read a few-shot prefix file, empty when unset
    pub fn read_prompt(path: Option<&Path>) -> Result<String> {
        match path {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file {}", path.display())),
            None => Ok(String::new()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub runtime: RuntimeConfig,
    pub generation: GenerationConfig,
}

impl WorkerConfig {
    /// Load worker configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: WorkerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if config.runtime.command.trim().is_empty() {
            bail!("runtime.command must not be empty");
        }

        Ok(config)
    }

    /// Load with default path (config/worker.json), built-in defaults if absent
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_headless_python() {
        let config = WorkerConfig::default();
        assert_eq!(config.runtime.command, "python3");
        assert_eq!(
            config.runtime.child_env().get("SDL_VIDEODRIVER").map(String::as_str),
            Some("dummy")
        );
        assert_eq!(config.runtime.sanity_iterations, 300);
        assert_eq!(config.generation.completions_per_task, 1);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(
            &path,
            r#"{"runtime": {"command": "python3.11"}, "generation": {"model": "local-model"}}"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.runtime.command, "python3.11");
        assert_eq!(config.runtime.file_extension, ".py");
        assert_eq!(config.generation.model, "local-model");
        assert_eq!(config.generation.retry.max_attempts, 6);
    }

    #[test]
    fn test_custom_env_keeps_headless_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(
            &path,
            r#"{"runtime": {"env": {"FOO": "1", "SDL_AUDIODRIVER": "disk"}}}"#,
        )
        .unwrap();

        let env = WorkerConfig::load(&path).unwrap().runtime.child_env();
        assert_eq!(env.get("FOO").map(String::as_str), Some("1"));
        assert_eq!(env.get("SDL_VIDEODRIVER").map(String::as_str), Some("dummy"));
        assert_eq!(env.get("SDL_AUDIODRIVER").map(String::as_str), Some("disk"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WorkerConfig::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_load_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(&path, r#"{"runtime": {"command": "  "}}"#).unwrap();

        assert!(WorkerConfig::load(&path).is_err());
    }
}
