//! Completion and test-suite requesters.
//!
//! Both roles share one round-trip: render a prompt for a task, call the
//! generation service, extract the first fenced code block. Empty or
//! fenceless responses and transport errors are retried with exponential
//! backoff up to a fixed number of attempts, after which the task is
//! reported as exhausted instead of looping forever.

use crate::config::{GenerationConfig, RetryConfig};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use handlebars::Handlebars;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const PROGRAMMER_SYSTEM: &str = "You are a helpful assistant.";
const TEST_DESIGNER_SYSTEM: &str = "You are a code developer assistant.";

const PROGRAMMER_TEMPLATE: &str = r#"
{{few_shot}}

{{prompt}}
Follow the specifications provided in the subsequent (incomplete) implementation closely: it's essential to retain all variables defined in the format shown, as our unit testing code will interact with the variables established in this incomplete implementation.

**Input Code Snippet**:
```{{lang}}
{{backbone}}
```
- Do not reference external image files (e.g., .png, .jpg) or sound effects (e.g., .mp3).
- Return the complete implementation of the program, not just the provided existing code.
"#;

const TEST_DESIGNER_TEMPLATE: &str = r#"
{{few_shot}}

{{prompt}}
**Input Code Snippet**:
```{{lang}}
{{backbone}}
```
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Completes the skeleton into a full program
    Programmer,
    /// Writes a unit-test suite for the skeleton's interface
    TestDesigner,
}

impl Role {
    fn template_name(self) -> &'static str {
        match self {
            Role::Programmer => "programmer",
            Role::TestDesigner => "test_designer",
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Role::Programmer => PROGRAMMER_SYSTEM,
            Role::TestDesigner => TEST_DESIGNER_SYSTEM,
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to render {role:?} prompt: {source}")]
    Prompt {
        role: Role,
        #[source]
        source: handlebars::RenderError,
    },
    #[error("generation for '{task}' exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },
}

/// A text-completion backend
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints
pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.into(),
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "No API key in environment; sending unauthenticated requests");
        }
        info!(model = %config.model, api_base = %config.api_base, "Generation client configured");
        Self::new(&config.api_base, &config.model, api_key, config.request_timeout())
    }
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message { role: "system", content: system },
                Message { role: "user", content: user },
            ],
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.context("Generation request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            bail!("Generation service returned {}: {}", status, err);
        }

        let chat: ChatResponse = resp.json().await.context("Malformed generation response")?;
        Ok(chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Return the body of the first fenced code block
///
/// A block tagged with `language` wins over an untagged one. An unterminated
/// fence counts as no block at all.
pub fn extract_code_block(text: &str, language: &str) -> Option<String> {
    let tagged = format!("```{}", language);
    let start = match text.find(&tagged) {
        Some(pos) if !language.is_empty() => pos + tagged.len(),
        _ => text.find("```")? + 3,
    };

    let rest = &text[start..];
    let line_end = rest.find('\n').unwrap_or(rest.len());

    // Whole block on the fence line: ```python x = 1```
    if let Some(close) = rest[..line_end].find("```") {
        return Some(rest[..close].trim().to_string());
    }

    // Skip whatever is left of the opening fence line (an unexpected tag)
    let body = rest.get(line_end + 1..)?;
    let end = body.find("```")?;

    Some(body[..end].to_string())
}

/// Exponential backoff schedule with optional jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let spread = delay.as_millis() as u64 / 2;
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            delay
        }
    }
}

/// Handlebars prompts for both roles
pub struct PromptBook {
    registry: Handlebars<'static>,
    programmer_few_shot: String,
    test_designer_few_shot: String,
    language_tag: String,
}

impl PromptBook {
    pub fn new(
        programmer_few_shot: String,
        test_designer_few_shot: String,
        language_tag: impl Into<String>,
    ) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Prompts carry source code, never HTML
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(Role::Programmer.template_name(), PROGRAMMER_TEMPLATE)
            .context("Invalid programmer template")?;
        registry
            .register_template_string(Role::TestDesigner.template_name(), TEST_DESIGNER_TEMPLATE)
            .context("Invalid test designer template")?;

        Ok(Self {
            registry,
            programmer_few_shot,
            test_designer_few_shot,
            language_tag: language_tag.into(),
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        Self::new(
            GenerationConfig::read_prompt(config.programmer_prompt_path.as_deref())?,
            GenerationConfig::read_prompt(config.test_designer_prompt_path.as_deref())?,
            &config.language_tag,
        )
    }

    pub fn language_tag(&self) -> &str {
        &self.language_tag
    }

    pub fn render(&self, role: Role, prompt: &str, backbone: &str) -> Result<String, GenerationError> {
        let few_shot = match role {
            Role::Programmer => &self.programmer_few_shot,
            Role::TestDesigner => &self.test_designer_few_shot,
        };
        let data = json!({
            "few_shot": few_shot,
            "prompt": prompt,
            "lang": self.language_tag,
            "backbone": backbone,
        });

        self.registry
            .render(role.template_name(), &data)
            .map_err(|source| GenerationError::Prompt { role, source })
    }
}

/// Owned request input for one task
#[derive(Debug, Clone)]
pub struct TaskPrompt {
    pub task_index: usize,
    pub name: String,
    pub prompt: String,
    pub backbone: String,
}

/// Result of one task's requests, correlated by index rather than order
pub type FanOutResult = (usize, Result<Vec<String>, GenerationError>);

pub struct Requester {
    client: Arc<dyn GenerationClient>,
    prompts: PromptBook,
    retry: RetryPolicy,
}

impl Requester {
    pub fn new(client: Arc<dyn GenerationClient>, prompts: PromptBook, retry: RetryPolicy) -> Self {
        Self {
            client,
            prompts,
            retry,
        }
    }

    /// One program for one task, retried until non-empty or exhausted
    #[instrument(skip(self, task), fields(task = %task.name))]
    pub async fn request_one(&self, role: Role, task: &TaskPrompt) -> Result<String, GenerationError> {
        let user = self.prompts.render(role, &task.prompt, &task.backbone)?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.client.chat(role.system_prompt(), &user).await {
                Ok(response) => match extract_code_block(&response, self.prompts.language_tag()) {
                    Some(code) if !code.trim().is_empty() => {
                        debug!(attempt, bytes = code.len(), "Code block extracted");
                        return Ok(code);
                    }
                    _ => {
                        warn!(attempt, "No code block found in response");
                        last_error = "no fenced code block in response".to_string();
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %format!("{:#}", e), "Generation request failed");
                    last_error = format!("{:#}", e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }
        }

        Err(GenerationError::Exhausted {
            task: task.name.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// `k` programs for one task; exhaustion of any request fails the task
    pub async fn request_many(
        &self,
        role: Role,
        task: &TaskPrompt,
        k: usize,
    ) -> Result<Vec<String>, GenerationError> {
        let mut programs = Vec::with_capacity(k);
        for _ in 0..k {
            programs.push(self.request_one(role, task).await?);
        }
        Ok(programs)
    }

    /// Request `k` programs for every task with at most `workers` tasks in
    /// flight. Completion order is arbitrary; each result carries its task
    /// index.
    pub async fn fan_out(
        &self,
        role: Role,
        tasks: Vec<TaskPrompt>,
        k: usize,
        workers: usize,
    ) -> Vec<FanOutResult> {
        let total = tasks.len();
        info!(role = ?role, tasks = total, per_task = k, workers, "Fanning out generation requests");

        stream::iter(tasks)
            .map(|task| async move {
                let result = self.request_many(role, &task, k).await;
                (task.task_index, result)
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn task(index: usize, name: &str) -> TaskPrompt {
        TaskPrompt {
            task_index: index,
            name: name.to_string(),
            prompt: format!("Build {}", name),
            backbone: "class Game:\n    pass".to_string(),
        }
    }

    #[test]
    fn test_extract_tagged_block() {
        let text = "Sure!\n```python\nprint('hi')\n```\nDone.";
        assert_eq!(extract_code_block(text, "python").as_deref(), Some("print('hi')\n"));
    }

    #[test]
    fn test_extract_prefers_tagged_over_bare() {
        let text = "```\nnot this\n```\n```python\nthis\n```";
        assert_eq!(extract_code_block(text, "python").as_deref(), Some("this\n"));
    }

    #[test]
    fn test_extract_falls_back_to_bare_fence() {
        let text = "```\nx = 1\n```";
        assert_eq!(extract_code_block(text, "python").as_deref(), Some("x = 1\n"));
    }

    #[test]
    fn test_extract_skips_other_tag() {
        let text = "```py\nx = 1\n```";
        assert_eq!(extract_code_block(text, "python").as_deref(), Some("x = 1\n"));
    }

    #[test]
    fn test_extract_single_line_block() {
        assert_eq!(extract_code_block("```python x = 1```", "python").as_deref(), Some("x = 1"));
        assert_eq!(extract_code_block("Try ```y = 2``` instead", "python").as_deref(), Some("y = 2"));
    }

    #[test]
    fn test_extract_fails_closed() {
        assert_eq!(extract_code_block("no code here", "python"), None);
        assert_eq!(extract_code_block("```python\nunterminated", "python"), None);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_prompts_embed_skeleton_unescaped() {
        let book = PromptBook::new("FEW SHOT".into(), String::new(), "python").unwrap();
        let text = book
            .render(Role::Programmer, "Make a <game>", "if a < b and c > d: pass")
            .unwrap();

        assert!(text.contains("FEW SHOT"));
        assert!(text.contains("Make a <game>"));
        assert!(text.contains("```python\nif a < b and c > d: pass\n```"));
        assert!(text.contains("external image files"));
    }

    #[tokio::test]
    async fn test_request_one_retries_until_code_block() {
        let responses = Mutex::new(vec![
            Err(anyhow::anyhow!("429 rate limited")),
            Ok("I cannot help with that".to_string()),
            Ok("```python\ngame = 1\n```".to_string()),
        ]);
        let client = Arc::new(ScriptedClient::new(move |_| responses.lock().unwrap().remove(0)));
        let requester = requester(client.clone(), 5);

        let code = requester.request_one(Role::Programmer, &task(0, "snake")).await.unwrap();

        assert_eq!(code, "game = 1\n");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_request_one_exhausts() {
        let client = Arc::new(ScriptedClient::new(|_| Ok("no fence".to_string())));
        let requester = requester(client.clone(), 3);

        let err = requester
            .request_one(Role::TestDesigner, &task(0, "pong"))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Exhausted { attempts: 3, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_request_many_returns_k_programs() {
        let client = Arc::new(ScriptedClient::fixed("x = 1"));
        let requester = requester(client.clone(), 1);

        let programs = requester
            .request_many(Role::Programmer, &task(0, "catcher"), 3)
            .await
            .unwrap();

        assert_eq!(programs.len(), 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fan_out_never_exceeds_worker_limit() {
        let client = Arc::new(ScriptedClient::fixed("x = 1").with_delay(Duration::from_millis(20)));
        let requester = requester(client.clone(), 1);
        let tasks: Vec<_> = (0..10).map(|i| task(i, &format!("game{}", i))).collect();

        let results = requester.fan_out(Role::Programmer, tasks, 1, 3).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let max = client.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "saw {} requests in flight", max);
        assert!(max >= 1);
    }

    #[tokio::test]
    async fn test_fan_out_correlates_by_task_index() {
        // Echo the game name back so each result can be matched to its task
        let client = Arc::new(ScriptedClient::new(|user| {
            let name = user
                .lines()
                .find_map(|l| l.strip_prefix("Build "))
                .unwrap_or("unknown")
                .to_string();
            Ok(format!("```python\n# {}\n```", name))
        }));
        let requester = requester(client, 1);
        let tasks: Vec<_> = (0..6).map(|i| task(i, &format!("game{}", i))).collect();

        let results = requester.fan_out(Role::Programmer, tasks, 1, 4).await;

        for (index, result) in results {
            let programs = result.unwrap();
            assert_eq!(programs[0], format!("# game{}\n", index));
        }
    }

    #[tokio::test]
    async fn test_openai_client_round_trip() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer secret")
                    .body_contains("gpt-test");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "choices": [{"message": {"role": "assistant", "content": "```python\nok = True\n```"}}]
                    }));
            })
            .await;

        let client = OpenAiClient::new(
            server.base_url(),
            "gpt-test",
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let content = client.chat("system", "user").await.unwrap();
        mock.assert_async().await;
        assert_eq!(extract_code_block(&content, "python").as_deref(), Some("ok = True\n"));
    }

    #[tokio::test]
    async fn test_openai_client_surfaces_http_errors() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(429).body("rate limited");
            })
            .await;

        let client = OpenAiClient::new(server.base_url(), "gpt-test", None, Duration::from_secs(5)).unwrap();

        let err = client.chat("system", "user").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
