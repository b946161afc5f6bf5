use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ebook_core::{
    GenerationOptions, LanguageModel, LanguageModelError, LlmConfig, MockLanguageModel,
    ProviderKind, TextStream,
};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::base_url::resolve_base_url;
use crate::error::AdapterError;
use crate::sse::{text_stream, SseEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the adapter for the configured backend. Keys are read from the
/// profile, then from the provider's environment variables.
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    create_language_model_with(config, |name| std::env::var(name).ok())
}

pub fn create_language_model_with<F>(
    config: &LlmConfig,
    lookup: F,
) -> Result<Arc<dyn LanguageModel>, AdapterError>
where
    F: Fn(&str) -> Option<String>,
{
    if !config.provider.requires_api_key() {
        return Ok(Arc::new(MockLanguageModel::new()));
    }

    let api_key = config
        .resolve_api_key_with(&lookup)
        .ok_or_else(|| AdapterError::missing_api_key(config.provider))?;
    let base_url = resolve_base_url(config.resolve_base_url_with(&lookup), config.provider)
        .ok_or_else(|| {
            AdapterError::InvalidConfig(format!(
                "{} needs a base_url{}",
                config.provider,
                config
                    .provider
                    .base_url_env_var()
                    .map(|var| format!(" or {var}"))
                    .unwrap_or_default()
            ))
        })?;
    let endpoint = Endpoint::new(config, api_key, base_url)?;
    debug!(
        "Using {} adapter for model {} at {}",
        config.provider, endpoint.model, endpoint.base_url
    );

    Ok(match config.provider {
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter { endpoint }),
        ProviderKind::Gemini => Arc::new(GeminiAdapter { endpoint }),
        _ => Arc::new(OpenAiCompatibleAdapter { endpoint }),
    })
}

/// Connection details shared by every HTTP adapter.
struct Endpoint {
    client: Client,
    provider: ProviderKind,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl Endpoint {
    fn new(config: &LlmConfig, api_key: String, base_url: String) -> Result<Self, AdapterError> {
        let model = config.model().to_string();
        if model.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            provider: config.provider,
            name: format!("{}:{}", config.provider, model),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout: Duration::from_secs(config.timeout.max(1)),
        })
    }

    /// Completion requests get the profile timeout; streams are bounded by the gateway.
    async fn send(&self, request: RequestBuilder, streaming: bool) -> Result<Response, AdapterError> {
        let request = if streaming {
            request.header(ACCEPT, HeaderValue::from_static("text/event-stream"))
        } else {
            request.timeout(self.timeout)
        };
        let response = request.send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Provider answered {status}: {}", truncate(&body, 200));
    Err(AdapterError::HttpStatus { status, body })
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// OpenAI, OpenRouter, Groq and any custom OpenAI-compatible server.
struct OpenAiCompatibleAdapter {
    endpoint: Endpoint,
}

impl OpenAiCompatibleAdapter {
    fn request(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> RequestBuilder {
        let body = ChatCompletionRequest {
            model: &self.endpoint.model,
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_tokens.filter(|tokens| *tokens > 0),
            temperature: options.temperature,
            stream,
        };
        let mut request = self
            .endpoint
            .client
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .bearer_auth(&self.endpoint.api_key)
            .json(&body);
        if self.endpoint.provider == ProviderKind::Openrouter {
            request = request.headers(openrouter_headers());
        }
        request
    }
}

fn openrouter_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-Title", HeaderValue::from_static("ebookgen"));
    headers
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, false), false)
            .await?;
        let parsed: ChatCompletionResponse = response.json().await.map_err(AdapterError::from)?;
        Ok(extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)?)
    }

    async fn stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, true), true)
            .await?;
        Ok(text_stream(response, parse_chat_chunk))
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    delta: Option<ChatMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    for choice in response.choices {
        if choice.finish_reason.as_deref() == Some("length") {
            warn!("Completion truncated due to max_tokens limit");
        }
        if let Some(content) = choice.message.and_then(|message| message.content) {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}

fn parse_chat_chunk(payload: &str) -> SseEvent {
    if payload.trim() == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(ChatChunk {
            error: Some(error), ..
        }) => SseEvent::Error(error.message),
        Ok(chunk) => SseEvent::Text(
            chunk
                .choices
                .into_iter()
                .filter_map(|choice| choice.delta.and_then(|delta| delta.content))
                .collect(),
        ),
        Err(err) => SseEvent::Error(format!("malformed chunk: {err}")),
    }
}

/// Anthropic messages API.
struct AnthropicAdapter {
    endpoint: Endpoint,
}

impl AnthropicAdapter {
    fn request(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> RequestBuilder {
        let body = MessagesRequest {
            model: &self.endpoint.model,
            max_tokens: options.max_tokens.filter(|tokens| *tokens > 0).unwrap_or(4096),
            temperature: options.temperature,
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            stream,
        };
        self.endpoint
            .client
            .post(format!("{}/messages", self.endpoint.base_url))
            .header("x-api-key", &self.endpoint.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
    }
}

#[async_trait]
impl LanguageModel for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, false), false)
            .await?;
        let parsed: MessagesResponse = response.json().await.map_err(AdapterError::from)?;
        Ok(parse_messages_response(parsed)?)
    }

    async fn stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, true), true)
            .await?;
        Ok(text_stream(response, parse_messages_event))
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<ContentBlock>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

fn parse_messages_response(response: MessagesResponse) -> Result<String, AdapterError> {
    if response.stop_reason.as_deref() == Some("max_tokens") {
        warn!("Anthropic response truncated due to max_tokens limit");
    }
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect();
    if text.trim().is_empty() {
        Err(AdapterError::EmptyResponse)
    } else {
        Ok(text)
    }
}

fn parse_messages_event(payload: &str) -> SseEvent {
    let event = match serde_json::from_str::<MessagesEvent>(payload) {
        Ok(event) => event,
        Err(err) => return SseEvent::Error(format!("malformed event: {err}")),
    };
    match event.kind.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|delta| delta.text)
            .map(SseEvent::Text)
            .unwrap_or(SseEvent::Skip),
        "message_stop" => SseEvent::Done,
        "error" => SseEvent::Error(
            event
                .error
                .map(|error| error.message)
                .unwrap_or_else(|| "unknown stream error".to_string()),
        ),
        _ => SseEvent::Skip,
    }
}

/// Google Gemini `generateContent` API.
struct GeminiAdapter {
    endpoint: Endpoint,
}

impl GeminiAdapter {
    fn request(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> RequestBuilder {
        let body = GeminiRequest {
            contents: vec![GeminiRequestContent {
                role: "user",
                parts: vec![GeminiRequestPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: options.max_tokens.filter(|tokens| *tokens > 0),
                temperature: options.temperature,
            },
        };
        let url = if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.endpoint.base_url, self.endpoint.model
            )
        } else {
            format!(
                "{}/models/{}:generateContent",
                self.endpoint.base_url, self.endpoint.model
            )
        };
        self.endpoint
            .client
            .post(url)
            .header("x-goog-api-key", &self.endpoint.api_key)
            .json(&body)
    }
}

#[async_trait]
impl LanguageModel for GeminiAdapter {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, false), false)
            .await?;
        let parsed: GeminiResponse = response.json().await.map_err(AdapterError::from)?;
        Ok(parse_gemini_response(parsed)?)
    }

    async fn stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, LanguageModelError> {
        let response = self
            .endpoint
            .send(self.request(prompt, options, true), true)
            .await?;
        Ok(text_stream(response, parse_gemini_event))
    }
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiRequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiRequestContent<'a> {
    role: &'static str,
    parts: Vec<GeminiRequestPart<'a>>,
}

#[derive(Serialize)]
struct GeminiRequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn candidate_text(candidate: GeminiCandidate) -> String {
    if let Some(reason) = candidate.finish_reason.as_deref() {
        match reason {
            "MAX_TOKENS" => warn!("Gemini response truncated due to max_tokens limit"),
            "SAFETY" => warn!("Gemini response blocked by safety filters"),
            "RECITATION" => warn!("Gemini response blocked due to recitation concerns"),
            _ => {}
        }
    }
    candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| match part {
                    GeminiPart::Text { text } => Some(text),
                    GeminiPart::Other(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_gemini_response(response: GeminiResponse) -> Result<String, AdapterError> {
    response
        .candidates
        .into_iter()
        .map(candidate_text)
        .find(|text| !text.trim().is_empty())
        .ok_or(AdapterError::EmptyResponse)
}

fn parse_gemini_event(payload: &str) -> SseEvent {
    match serde_json::from_str::<GeminiResponse>(payload) {
        Ok(response) => SseEvent::Text(
            response
                .candidates
                .into_iter()
                .next()
                .map(candidate_text)
                .unwrap_or_default(),
        ),
        Err(err) => SseEvent::Error(format!("malformed chunk: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebook_core::LanguageModelErrorKind;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_key_never_falls_back_to_mock() {
        let config = LlmConfig::for_provider(ProviderKind::Anthropic);
        let err = match create_language_model_with(&config, no_env) {
            Ok(_) => panic!("adapter built without a key"),
            Err(err) => err,
        };
        assert!(err.is_auth());
    }

    #[test]
    fn key_comes_from_environment_lookup() -> Result<(), Box<dyn std::error::Error>> {
        let config = LlmConfig::for_provider(ProviderKind::Gemini);
        let model = create_language_model_with(&config, |name| {
            (name == "GEMINI_API_KEY").then(|| "secret".to_string())
        })?;
        assert_eq!(model.name(), "gemini:gemini-1.5-pro");
        Ok(())
    }

    #[test]
    fn mock_provider_needs_no_key() -> Result<(), Box<dyn std::error::Error>> {
        let config = LlmConfig::for_provider(ProviderKind::Mock);
        let model = create_language_model_with(&config, no_env)?;
        assert_eq!(model.name(), "mock");
        Ok(())
    }

    #[test]
    fn custom_provider_requires_base_url() {
        let mut config = LlmConfig::for_provider(ProviderKind::Custom);
        config.api_key = "key".into();
        let err = match create_language_model_with(&config, no_env) {
            Ok(_) => panic!("custom adapter built without a base url"),
            Err(err) => err,
        };
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
        assert!(err.to_string().contains("CUSTOM_LLM_BASE_URL"));
    }

    #[test]
    fn chat_chunks_yield_delta_text() {
        let payload = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_chat_chunk(payload), SseEvent::Text("Hel".into()));
        assert_eq!(parse_chat_chunk("[DONE]"), SseEvent::Done);
        assert!(matches!(parse_chat_chunk("{not json"), SseEvent::Error(_)));
        let failure = r#"{"error":{"message":"overloaded"}}"#;
        assert_eq!(parse_chat_chunk(failure), SseEvent::Error("overloaded".into()));
    }

    #[test]
    fn completion_skips_blank_choices() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"  "}},{"message":{"content":"Answer"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_choice_content(response), Some("Answer".to_string()));
    }

    #[test]
    fn anthropic_events_follow_message_lifecycle() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(parse_messages_event(delta), SseEvent::Text("Hi".into()));
        assert_eq!(
            parse_messages_event(r#"{"type":"ping"}"#),
            SseEvent::Skip
        );
        assert_eq!(
            parse_messages_event(r#"{"type":"message_stop"}"#),
            SseEvent::Done
        );
        let error = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(parse_messages_event(error), SseEvent::Error("Overloaded".into()));
    }

    #[test]
    fn anthropic_response_joins_text_blocks() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"Part one. "},{"type":"text","text":"Part two."}],"stop_reason":"end_turn"}"#,
        )
        .unwrap();
        assert_eq!(
            parse_messages_response(response).unwrap(),
            "Part one. Part two."
        );
    }

    #[test]
    fn gemini_response_requires_text() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{}}]},"finishReason":"SAFETY"}]}"#,
        )
        .unwrap();
        let err = parse_gemini_response(response).unwrap_err();
        let converted: LanguageModelError = err.into();
        assert_eq!(converted.kind(), LanguageModelErrorKind::InvalidResponse);
    }

    #[test]
    fn gemini_stream_chunk_text() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"Chunk"}],"role":"model"}}]}"#;
        assert_eq!(parse_gemini_event(payload), SseEvent::Text("Chunk".into()));
    }
}
