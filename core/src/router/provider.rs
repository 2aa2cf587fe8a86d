//! Live OpenAI-compatible `ProviderClient`, generalized from the teacher's
//! `ChatOpenAI` (`loom::llm::ChatOpenAI`) to take the endpoint and credentials
//! from a [`ModelDescriptor`] per call instead of being constructed once per model.

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessage, ChatCompletionTool,
    ChatCompletionToolChoiceOption, ChatCompletionTools, CreateChatCompletionRequestArgs,
    FunctionObject, ToolChoiceOptions,
};
use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::message::Message;
use crate::model::ModelDescriptor;
use crate::state::ToolCall;

use super::{ChatOptions, ProviderClient, ProviderError, RouterErrorKind, RouterResponse, TokenUsage};

/// Calls the OpenAI Chat Completions API (or any OpenAI-compatible endpoint reachable
/// via `descriptor.base_url`). One client is built per call so each descriptor's
/// `apiKey`/`baseUrl` is honored independently (design §3 Model Descriptor).
pub struct OpenAiProviderClient;

impl OpenAiProviderClient {
    pub fn new() -> Self {
        Self
    }

    fn client_for(descriptor: &ModelDescriptor) -> async_openai::Client<OpenAIConfig> {
        let mut config = OpenAIConfig::new();
        if let Some(key) = &descriptor.api_key {
            config = config.with_api_key(key);
        }
        if let Some(base) = &descriptor.base_url {
            config = config.with_api_base(base);
        }
        async_openai::Client::with_config(config)
    }

    fn build_request(
        descriptor: &ModelDescriptor,
        messages: &[Message],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, ProviderError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(descriptor.model.clone());
        args.messages(Self::messages_to_request(messages));

        if let Some(t) = options.temperature {
            args.temperature(t);
        }
        if !options.tool_names.is_empty() {
            let tools: Vec<ChatCompletionTools> = options
                .tool_names
                .iter()
                .map(|name| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: name.clone(),
                            description: None,
                            parameters: None,
                            strict: None,
                        },
                    })
                })
                .collect();
            args.tools(tools);
            args.tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }
        if stream {
            args.stream(true);
        }

        args.build().map_err(|e| ProviderError {
            kind: RouterErrorKind::Other,
            message: format!("request build failed: {e}"),
            retry_after_ms: None,
        })
    }

    fn messages_to_request(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System { content } => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(content.as_str()),
                ),
                Message::User { content } => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(content.as_str()),
                ),
                Message::Assistant { content, .. } => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(content.as_str())
                        .build()
                        .unwrap_or_default(),
                ),
                Message::Tool { call_id, content } => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call_id.clone())
                        .content(content.as_str())
                        .build()
                        .unwrap_or_default(),
                ),
            })
            .collect()
    }
}

impl Default for OpenAiProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for OpenAiProviderClient {
    async fn invoke(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<RouterResponse, ProviderError> {
        let client = Self::client_for(descriptor);
        let request = Self::build_request(descriptor, messages, options, false)?;

        debug!(model = %descriptor.id(), message_count = messages.len(), "provider invoke");

        let response = client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError {
                kind: RouterErrorKind::Other,
                message: "provider returned no choices".to_string(),
                retry_after_ms: None,
            })?;

        let msg = choice.message;
        let content = msg.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| match tc {
                ChatCompletionMessageToolCalls::Function(f) => Some(ToolCall {
                    id: f.id,
                    name: f.function.name,
                    arguments: serde_json::from_str(&f.function.arguments)
                        .unwrap_or(serde_json::Value::Null),
                }),
                ChatCompletionMessageToolCalls::Custom(_) => None,
            })
            .collect();

        let (prompt_tokens, completion_tokens) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(RouterResponse {
            model_id: descriptor.id(),
            content,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                estimated_cost_usd: descriptor.input_cost() * prompt_tokens as f64 / 1_000_000.0
                    + descriptor.output_cost() * completion_tokens as f64 / 1_000_000.0,
            },
        })
    }

    async fn invoke_stream(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        options: &ChatOptions,
        on_delta: &(dyn Fn(String) + Send + Sync),
    ) -> Result<RouterResponse, ProviderError> {
        let client = Self::client_for(descriptor);
        let request = Self::build_request(descriptor, messages, options, true)?;

        debug!(model = %descriptor.id(), message_count = messages.len(), "provider invoke_stream");

        let mut stream = client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        let mut content = String::new();
        // Tool-call argument fragments stream in by index and accumulate across chunks.
        let mut tool_call_ids: Vec<Option<String>> = Vec::new();
        let mut tool_call_names: Vec<String> = Vec::new();
        let mut tool_call_arguments: Vec<String> = Vec::new();
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_provider_error(&e.to_string()))?;
            if let Some(usage) = chunk.usage {
                prompt_tokens = usage.prompt_tokens;
                completion_tokens = usage.completion_tokens;
            }
            for choice in chunk.choices {
                if let Some(delta) = choice.delta.content {
                    if !delta.is_empty() {
                        content.push_str(&delta);
                        on_delta(delta);
                    }
                }
                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let idx = tc.index as usize;
                    while tool_call_ids.len() <= idx {
                        tool_call_ids.push(None);
                        tool_call_names.push(String::new());
                        tool_call_arguments.push(String::new());
                    }
                    if let Some(id) = tc.id {
                        tool_call_ids[idx] = Some(id);
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            tool_call_names[idx].push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            tool_call_arguments[idx].push_str(&arguments);
                        }
                    }
                }
            }
        }

        let tool_calls: Vec<ToolCall> = tool_call_ids
            .into_iter()
            .zip(tool_call_names)
            .zip(tool_call_arguments)
            .filter_map(|((id, name), arguments)| {
                id.map(|id| ToolCall {
                    id,
                    name,
                    arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect();

        Ok(RouterResponse {
            model_id: descriptor.id(),
            content,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                estimated_cost_usd: descriptor.input_cost() * prompt_tokens as f64 / 1_000_000.0
                    + descriptor.output_cost() * completion_tokens as f64 / 1_000_000.0,
            },
        })
    }
}

/// Turns an opaque provider error string into a [`ProviderError`] via
/// [`super::classify_status`], scraping an HTTP-looking status code out of the
/// message text when the client library doesn't expose one directly, and a
/// retry-after duration out of the message body when the client library
/// doesn't expose `Retry-After`/`x-ratelimit-reset*` headers directly.
fn classify_provider_error(message: &str) -> ProviderError {
    let status = extract_status_code(message).unwrap_or(0);
    ProviderError {
        kind: super::classify_status(status, message),
        message: message.to_string(),
        retry_after_ms: extract_retry_after_ms(message),
    }
}

/// Parses a retry hint out of phrasing like "Please try again in 1s" or
/// "retry after 1500ms" (design §4.3 cooldown TTL, `Retry-After` fallback).
fn extract_retry_after_ms(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    const ANCHORS: &[&str] = &["try again in", "retry after", "retry-after", "please retry in"];
    for anchor in ANCHORS {
        if let Some(pos) = lower.find(anchor) {
            if let Some(ms) = parse_leading_duration(&lower[pos + anchor.len()..]) {
                return Some(ms);
            }
        }
    }
    None
}

/// Parses a leading `<number>ms` or `<number>s`/`<number> seconds`, ignoring
/// surrounding whitespace, colons, and trailing punctuation.
fn parse_leading_duration(s: &str) -> Option<u64> {
    let s = s.trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    let digit_end = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    if digit_end == 0 {
        return None;
    }
    let number: f64 = s[..digit_end].parse().ok()?;
    let rest = s[digit_end..].trim_start();
    if rest.starts_with("ms") {
        Some(number as u64)
    } else if rest.starts_with('s') {
        Some((number * 1000.0) as u64)
    } else {
        None
    }
}

fn extract_status_code(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i].is_ascii_digit()
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
        {
            let before_ok = i == 0 || !bytes[i - 1].is_ascii_digit();
            let after_ok = i + 3 >= bytes.len() || !bytes[i + 3].is_ascii_digit();
            if before_ok && after_ok {
                if let Ok(code) = message[i..i + 3].parse::<u16>() {
                    if (400..600).contains(&code) {
                        return Some(code);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_status_code_finds_embedded_429() {
        assert_eq!(
            extract_status_code("status code 429: rate limited"),
            Some(429)
        );
        assert_eq!(extract_status_code("connection refused"), None);
    }

    #[test]
    fn classify_provider_error_uses_extracted_status() {
        let err = classify_provider_error("request failed with status 503 Service Unavailable");
        assert_eq!(err.kind, RouterErrorKind::ServerError);
    }

    #[test]
    fn classify_provider_error_falls_back_to_message_text() {
        let err = classify_provider_error("maximum context length exceeded for this model");
        assert_eq!(err.kind, RouterErrorKind::ContextOverflow);
    }

    #[test]
    fn classify_provider_error_parses_retry_after_from_message() {
        let err = classify_provider_error("Rate limit reached for requests. Please try again in 1s.");
        assert_eq!(err.retry_after_ms, Some(1000));
    }

    #[test]
    fn parse_leading_duration_handles_ms_and_seconds() {
        assert_eq!(parse_leading_duration("1500ms"), Some(1500));
        assert_eq!(parse_leading_duration(" 2.5s please"), Some(2500));
        assert_eq!(parse_leading_duration("later"), None);
    }
}
