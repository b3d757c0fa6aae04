//! LLM-based summarization of conversation history
//!
//! Messages are flattened into a line-oriented transcript, wrapped in a fixed
//! instruction prompt and sent to a lightweight model picked per provider.

use super::model_registry::Provider;
use super::models::{Message, Part};
use crate::config::SummarizerConfig;
use crate::logging;
use crate::metrics::METRICS;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Text-generation request handed to a [`TextGenerator`]
#[derive(Debug)]
pub struct GenerationRequest<'a> {
    pub model: &'a str,
    pub api_key: &'a SecretString,
    pub base_url: Option<&'a str>,
    pub prompt: &'a str,
    pub temperature: f32,
}

/// Capability that turns a prompt into generated text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text; implementations should stop early once `cancel` fires
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Failed to generate summary: {message}")]
    Failed {
        session_id: String,
        provider: String,
        model: String,
        message: String,
    },

    #[error("Summarization cancelled")]
    Cancelled,
}

/// Generator for OpenAI-compatible `/chat/completions` endpoints
pub struct OpenAiCompatibleGenerator {
    client: Client,
    config: SummarizerConfig,
}

impl OpenAiCompatibleGenerator {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SummarizerError::Initialization(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, base_url: Option<&str>) -> String {
        let base = base_url.unwrap_or(&self.config.base_url);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    async fn call_api(&self, url: &str, request: &GenerationRequest<'_>) -> Result<String, CallError> {
        let body = ChatCompletionRequest {
            model: request.model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.prompt.to_string(),
            }],
            temperature: Some(request.temperature),
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(request.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Retryable(anyhow!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = anyhow!("HTTP {}: {}", status, text);
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                CallError::Retryable(err)
            } else {
                CallError::Fatal(err)
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CallError::Fatal(anyhow!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CallError::Fatal(anyhow!("No choices in response")))
    }
}

enum CallError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        request: GenerationRequest<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let url = self.endpoint(request.base_url);
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => bail!("request cancelled"),
                result = self.call_api(&url, &request) => result,
            };

            match result {
                Ok(text) => return Ok(text),
                Err(CallError::Fatal(e)) => return Err(e),
                Err(CallError::Retryable(e)) => {
                    if attempt >= self.config.max_retries {
                        warn!(attempts = attempt + 1, "Generation failed after retries");
                        return Err(e);
                    }
                    attempt += 1;
                    let backoff = self.config.retry_backoff() * 2u32.saturating_pow(attempt as u32);
                    debug!(attempt, error = %e, ?backoff, "Retrying generation");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => bail!("request cancelled"),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

/// Inputs of one summarization call
#[derive(Debug)]
pub struct SummarizationOptions<'a> {
    pub messages: &'a [Message],
    pub provider: &'a str,
    /// Overrides the provider's default summarization model
    pub model: Option<&'a str>,
    pub api_key: &'a SecretString,
    pub base_url: Option<&'a str>,
    pub session_id: &'a str,
    /// Replaces the built-in instructions; `{conversation}` marks where the
    /// transcript goes, otherwise it is appended
    pub prompt_template: Option<&'a str>,
}

/// Produces natural-language summaries of message histories
pub struct SummarizationService {
    generator: Arc<dyn TextGenerator>,
    config: SummarizerConfig,
    span: Span,
}

impl SummarizationService {
    pub fn new(generator: Arc<dyn TextGenerator>, config: SummarizerConfig) -> Self {
        Self {
            generator,
            config,
            span: logging::scope("compression:summarization"),
        }
    }

    /// Service backed by an [`OpenAiCompatibleGenerator`]
    pub fn openai_compatible(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let generator = OpenAiCompatibleGenerator::new(config.clone())?;
        Ok(Self::new(Arc::new(generator), config))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Cheap, fast model used for summaries of a provider's conversations
    pub fn select_model(&self, provider: &Provider) -> String {
        match provider {
            Provider::OpenAi | Provider::Azure => "gpt-4o-mini".to_string(),
            Provider::Anthropic => "claude-3-5-haiku-20241022".to_string(),
            Provider::Google => "gemini-2.5-flash".to_string(),
            Provider::Other(name) => {
                warn!(provider = %name, "No summarization model configured for provider, using default");
                self.config.default_model.clone()
            }
        }
    }

    /// Generate a summary of `options.messages`
    pub async fn summarize(
        &self,
        options: SummarizationOptions<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, SummarizerError> {
        self.summarize_inner(options, cancel)
            .instrument(self.span.clone())
            .await
    }

    async fn summarize_inner(
        &self,
        options: SummarizationOptions<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, SummarizerError> {
        let model = match options.model {
            Some(model) => model.to_string(),
            None => self.select_model(&Provider::from(options.provider)),
        };

        info!(
            session_id = %options.session_id,
            provider = %options.provider,
            model = %model,
            message_count = options.messages.len(),
            "Starting summarization"
        );

        let conversation = render_transcript(options.messages);
        let prompt = match options.prompt_template {
            Some(template) if template.contains("{conversation}") => {
                template.replace("{conversation}", &conversation)
            }
            Some(template) => format!("{}\n\n{}", template, conversation),
            None => build_prompt(&conversation),
        };

        let request = GenerationRequest {
            model: &model,
            api_key: options.api_key,
            base_url: options.base_url,
            prompt: &prompt,
            temperature: self.config.temperature,
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(anyhow!("cancelled")),
            result = self.generator.generate(request, cancel) => result,
        };
        let elapsed = start.elapsed();

        if cancel.is_cancelled() {
            info!(session_id = %options.session_id, "Summarization cancelled");
            return Err(SummarizerError::Cancelled);
        }

        let result = result.and_then(|summary| {
            if summary.trim().is_empty() {
                Err(anyhow!("model returned an empty summary"))
            } else {
                Ok(summary)
            }
        });

        match result {
            Ok(summary) => {
                METRICS.record_summarization(true, elapsed.as_secs_f64());
                let ratio = summary.len() as f64 / conversation.len().max(1) as f64;
                info!(
                    session_id = %options.session_id,
                    duration_ms = elapsed.as_millis() as u64,
                    summary_length = summary.len(),
                    compression_ratio = %format!("{:.2}", ratio),
                    "Summarization completed"
                );
                Ok(summary)
            }
            Err(e) => {
                METRICS.record_summarization(false, elapsed.as_secs_f64());
                error!(
                    session_id = %options.session_id,
                    provider = %options.provider,
                    model = %model,
                    error = %e,
                    "Summarization failed"
                );
                Err(SummarizerError::Failed {
                    session_id: options.session_id.to_string(),
                    provider: options.provider.to_string(),
                    model,
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Instruction prompt wrapped around a rendered transcript
pub fn build_prompt(conversation: &str) -> String {
    format!(
        "You are an expert at summarizing conversations while preserving important information.

Your task is to create a concise summary of the following conversation that:

1. **Preserves key facts and decisions**: Include all important information, data, and conclusions
2. **Maintains chronological order**: Keep the flow of the conversation clear
3. **Retains technical details**: Keep code snippets, API names, configuration values, and technical terminology verbatim
4. **Includes tool invocations**: Mention when tools were used and what they accomplished
5. **Uses concise language**: Compress verbose explanations while keeping essential meaning
6. **Focuses on actionable content**: Prioritize information that affects understanding or future decisions

Format the summary as:
- Start with a \"## Summary\" heading
- Use bullet points for key facts and decisions
- Use sub-sections for different topics if needed
- Keep code examples inline with triple backticks
- Aim for 50-70% compression while retaining all essential information

Conversation to summarize:

{}

Generate the summary now:",
        conversation
    )
}

/// Flatten messages into the transcript given to the summarization model.
///
/// Metadata parts are left out.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut lines = Vec::new();

    for message in messages {
        lines.push(format!("\n[{}]", message.role.as_str().to_uppercase()));

        for part in &message.parts {
            match part {
                Part::Text { content } => lines.push(content.clone()),

                Part::ToolInvocation {
                    tool_name,
                    tool_call_id,
                    input,
                    status,
                    ..
                } => lines.push(format!(
                    "<tool_invocation name=\"{}\" id=\"{}\">\nInput: {}\nStatus: {}\n</tool_invocation>",
                    tool_name,
                    tool_call_id,
                    pretty_json(input),
                    status.as_str()
                )),

                Part::ToolResult {
                    related_tool_call_id,
                    output,
                    output_text,
                    error_code,
                    error_message,
                } => {
                    let mut block = format!("<tool_result for=\"{}\">", related_tool_call_id);
                    if let Some(output) = output.as_ref().filter(|o| !o.is_null()) {
                        block.push_str(&format!("\nOutput: {}", pretty_json(output)));
                    }
                    if let Some(text) = output_text {
                        block.push_str(&format!("\n{}", text));
                    }
                    match (error_code, error_message) {
                        (Some(code), Some(message)) => {
                            block.push_str(&format!("\nError: {} ({})", message, code))
                        }
                        (None, Some(message)) => block.push_str(&format!("\nError: {}", message)),
                        (Some(code), None) => block.push_str(&format!("\nError: {}", code)),
                        (None, None) => {}
                    }
                    block.push_str("\n</tool_result>");
                    lines.push(block);
                }

                Part::Attachment {
                    mime_type,
                    size_bytes,
                    ..
                } => {
                    let size = size_bytes
                        .map(|size| format!(" size=\"{}\"", size))
                        .unwrap_or_default();
                    lines.push(format!("<attachment type=\"{}\"{} />", mime_type, size));
                }

                Part::Metadata { .. } => {}
            }
        }
    }

    lines.join("\n")
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::{Role, ToolStatus};
    use serde_json::json;
    use std::sync::Mutex;

    /// Generator returning a fixed reply and recording what it was asked
    struct ScriptedGenerator {
        reply: anyhow::Result<String>,
        seen: Mutex<Vec<(String, String, f32)>>,
    }

    impl ScriptedGenerator {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(anyhow!(message.to_string())),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            request: GenerationRequest<'_>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push((
                request.model.to_string(),
                request.prompt.to_string(),
                request.temperature,
            ));
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow!(e.to_string())),
            }
        }
    }

    /// Generator that never answers
    struct HangingGenerator;

    #[async_trait]
    impl TextGenerator for HangingGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest<'_>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<String> {
            std::future::pending().await
        }
    }

    fn service(generator: Arc<dyn TextGenerator>) -> SummarizationService {
        SummarizationService::new(generator, SummarizerConfig::default())
    }

    fn options<'a>(messages: &'a [Message], key: &'a SecretString) -> SummarizationOptions<'a> {
        SummarizationOptions {
            messages,
            provider: "anthropic",
            model: None,
            api_key: key,
            base_url: None,
            session_id: "session-1",
            prompt_template: None,
        }
    }

    fn key() -> SecretString {
        SecretString::new("sk-test".to_string())
    }

    #[test]
    fn test_select_model_per_provider() {
        let service = service(Arc::new(ScriptedGenerator::replying("x")));
        assert_eq!(service.select_model(&Provider::OpenAi), "gpt-4o-mini");
        assert_eq!(service.select_model(&Provider::Azure), "gpt-4o-mini");
        assert_eq!(
            service.select_model(&Provider::Anthropic),
            "claude-3-5-haiku-20241022"
        );
        assert_eq!(service.select_model(&Provider::Google), "gemini-2.5-flash");
        assert_eq!(
            service.select_model(&Provider::Other("mystery".to_string())),
            "gpt-4o-mini"
        );
    }

    #[test]
    fn test_render_transcript() {
        let messages = vec![
            Message::new("s", 1, Role::User, vec![Part::text("List files")]),
            Message::new(
                "s",
                2,
                Role::Assistant,
                vec![
                    Part::ToolInvocation {
                        tool_name: "ls".to_string(),
                        tool_call_id: "call_1".to_string(),
                        input: json!({"path": "."}),
                        input_text: None,
                        status: ToolStatus::Completed,
                    },
                    Part::Metadata {
                        payload: json!({"secret_ui_state": "hidden"}),
                    },
                ],
            ),
            Message::new(
                "s",
                3,
                Role::Tool,
                vec![
                    Part::ToolResult {
                        related_tool_call_id: "call_1".to_string(),
                        output: None,
                        output_text: Some("Cargo.toml".to_string()),
                        error_code: None,
                        error_message: Some("partial listing".to_string()),
                    },
                    Part::Attachment {
                        mime_type: "image/png".to_string(),
                        size_bytes: Some(1024),
                        metadata: None,
                    },
                ],
            ),
        ];

        let text = render_transcript(&messages);
        let expected = "\n[USER]\nList files\n\n[ASSISTANT]\n\
            <tool_invocation name=\"ls\" id=\"call_1\">\nInput: {\n  \"path\": \".\"\n}\nStatus: completed\n</tool_invocation>\n\
            \n[TOOL]\n<tool_result for=\"call_1\">\nCargo.toml\nError: partial listing\n</tool_result>\n\
            <attachment type=\"image/png\" size=\"1024\" />";
        assert_eq!(text, expected);
        assert!(!text.contains("secret_ui_state"));
    }

    #[test]
    fn test_prompt_template() {
        let prompt = build_prompt("[USER]\nhello");
        assert!(prompt.contains("## Summary"));
        assert!(prompt.contains("50-70%"));
        assert!(prompt.contains("chronological order"));
        assert!(prompt.contains("[USER]\nhello"));
    }

    #[tokio::test]
    async fn test_summarize_uses_selected_model_and_low_temperature() {
        let generator = Arc::new(ScriptedGenerator::replying("## Summary\n- greeted"));
        let service = service(generator.clone());
        let messages = vec![Message::new("s", 1, Role::User, vec![Part::text("hello")])];
        let key = key();

        let summary = service
            .summarize(options(&messages, &key), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, "## Summary\n- greeted");

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "claude-3-5-haiku-20241022");
        assert!(seen[0].1.contains("[USER]\nhello"));
        assert!((seen[0].2 - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_summarize_with_overrides() {
        let generator = Arc::new(ScriptedGenerator::replying("short"));
        let service = service(generator.clone());
        let messages = vec![Message::new("s", 1, Role::User, vec![Part::text("hello")])];
        let key = key();

        let mut opts = options(&messages, &key);
        opts.model = Some("custom-model");
        opts.prompt_template = Some("Summarize tersely:\n{conversation}\nEND");
        service.summarize(opts, &CancellationToken::new()).await.unwrap();

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen[0].0, "custom-model");
        assert_eq!(seen[0].1, "Summarize tersely:\n\n[USER]\nhello\nEND");
    }

    #[tokio::test]
    async fn test_summarize_wraps_generator_error() {
        let service = service(Arc::new(ScriptedGenerator::failing("rate limited")));
        let messages = vec![Message::new("s", 1, Role::User, vec![Part::text("hello")])];
        let key = key();

        let err = service
            .summarize(options(&messages, &key), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            SummarizerError::Failed {
                session_id,
                provider,
                model,
                message,
            } => {
                assert_eq!(session_id, "session-1");
                assert_eq!(provider, "anthropic");
                assert_eq!(model, "claude-3-5-haiku-20241022");
                assert!(message.contains("rate limited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().starts_with("Failed to generate summary:"));
    }

    #[tokio::test]
    async fn test_empty_summary_is_a_failure() {
        let service = service(Arc::new(ScriptedGenerator::replying("   ")));
        let messages = vec![Message::new("s", 1, Role::User, vec![Part::text("hello")])];
        let key = key();

        let result = service
            .summarize(options(&messages, &key), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SummarizerError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_summarize_cancelled() {
        let service = service(Arc::new(HangingGenerator));
        let messages = vec![Message::new("s", 1, Role::User, vec![Part::text("hello")])];
        let key = key();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = service.summarize(options(&messages, &key), &cancel).await;
        assert!(matches!(result, Err(SummarizerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_openai_compatible_generator() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r###"{"choices":[{"message":{"role":"assistant","content":"## Summary\n- ok"}}]}"###)
            .create_async()
            .await;

        let generator = OpenAiCompatibleGenerator::new(SummarizerConfig::default()).unwrap();
        let base_url = format!("{}/v1/", server.url());
        let key = key();
        let text = generator
            .generate(
                GenerationRequest {
                    model: "gpt-4o-mini",
                    api_key: &key,
                    base_url: Some(&base_url),
                    prompt: "hi",
                    temperature: 0.3,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(text, "## Summary\n- ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openai_compatible_generator_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid api key")
            .expect(1)
            .create_async()
            .await;

        let generator = OpenAiCompatibleGenerator::new(SummarizerConfig::default()).unwrap();
        let base_url = server.url();
        let key = key();
        let err = generator
            .generate(
                GenerationRequest {
                    model: "gpt-4o-mini",
                    api_key: &key,
                    base_url: Some(&base_url),
                    prompt: "hi",
                    temperature: 0.3,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("401"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openai_compatible_generator_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let config = SummarizerConfig {
            max_retries: 1,
            retry_backoff_ms: 1,
            ..SummarizerConfig::default()
        };
        let generator = OpenAiCompatibleGenerator::new(config).unwrap();
        let base_url = server.url();
        let key = key();
        let result = generator
            .generate(
                GenerationRequest {
                    model: "gpt-4o-mini",
                    api_key: &key,
                    base_url: Some(&base_url),
                    prompt: "hi",
                    temperature: 0.3,
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        mock.assert_async().await;
    }
}
