//! Model Router: turns one logical request (a role or task name) into at most one
//! successful provider call, traversing an ordered fallback chain (design §4.3).
//!
//! Grounded on the teacher's `LlmClient` trait (`loom::llm`), generalized from a single
//! fixed client to a chain of [`ProviderClient`]s resolved per call, with cooldowns,
//! retry budgets, and cost accounting layered on top.

mod cooldown;
mod provider;

pub use cooldown::{CooldownReason, CooldownState, CooldownTable};
pub use provider::OpenAiProviderClient;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::audit::{ActionType, AuditLog, AuditStatus};
use crate::message::Message;
use crate::model::{ModelChain, ModelDescriptor, ModelRepository};
use crate::state::ToolCall;
use crate::token_meter::TokenMeter;

/// Role/task-level routing knobs (design §6 `routing.*`).
#[derive(Clone, Debug)]
pub struct RoutingPolicy {
    pub max_retries: u32,
    pub fallback_on_rate_limit: bool,
    pub fallback_on_error: bool,
    pub fallback_on_context_overflow: bool,
    pub cooldown_ms: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            fallback_on_rate_limit: true,
            fallback_on_error: false,
            fallback_on_context_overflow: true,
            cooldown_ms: 60_000,
        }
    }
}

/// The classification a provider failure is bucketed into before the router
/// decides whether to retry the same model or advance the chain (design §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterErrorKind {
    RateLimited,
    QuotaExceeded,
    ServerError,
    AuthFailure,
    Timeout,
    TransientNetwork,
    ContextOverflow,
    Other,
}

impl RouterErrorKind {
    fn is_retryable_same_model(self) -> bool {
        matches!(
            self,
            RouterErrorKind::RateLimited
                | RouterErrorKind::Timeout
                | RouterErrorKind::ServerError
                | RouterErrorKind::TransientNetwork
        )
    }
}

/// One provider call's failure, carrying enough to drive cooldown/TTL logic.
#[derive(Clone, Debug)]
pub struct ProviderError {
    pub kind: RouterErrorKind,
    pub message: String,
    /// Duration hint parsed from `Retry-After` / `x-ratelimit-reset*` headers or the
    /// message body; `None` falls back to the configured `cooldownMs`.
    pub retry_after_ms: Option<u64>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Usage + cost accounting for one completed provider call.
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub estimated_cost_usd: f64,
}

/// Successful completion of a `chat()` dispatch.
#[derive(Clone, Debug)]
pub struct RouterResponse {
    pub model_id: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Optional per-call knobs threaded through to the provider (design §4.2 step 3).
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub tool_names: Vec<String>,
    pub tier: u8,
    pub temperature: Option<f32>,
}

/// A single provider endpoint, generalized from the teacher's `LlmClient`
/// (`loom::llm::LlmClient`) to a model-agnostic call behind one descriptor.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn invoke(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<RouterResponse, ProviderError>;

    /// Streaming variant: invokes `on_delta` once per content chunk as it arrives, in
    /// the order the provider emits them, then resolves to the same aggregate
    /// response `invoke` would have returned (design §9 "lazy, finite chunk
    /// sequence"). The default forwards the whole response as one chunk, for clients
    /// (like [`MockProviderClient`]) that only support request/response.
    async fn invoke_stream(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        options: &ChatOptions,
        on_delta: &(dyn Fn(String) + Send + Sync),
    ) -> Result<RouterResponse, ProviderError> {
        let response = self.invoke(descriptor, messages, options).await?;
        if !response.content.is_empty() {
            on_delta(response.content.clone());
        }
        Ok(response)
    }
}

/// Fixed-response test double, in the spirit of the teacher's `MockLlm`.
pub struct MockProviderClient {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub fail_with: Option<ProviderError>,
}

impl MockProviderClient {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            fail_with: None,
        }
    }

    pub fn failing(err: ProviderError) -> Self {
        Self {
            content: String::new(),
            tool_calls: Vec::new(),
            fail_with: Some(err),
        }
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn invoke(
        &self,
        descriptor: &ModelDescriptor,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<RouterResponse, ProviderError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(RouterResponse {
            model_id: descriptor.id(),
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 10,
                estimated_cost_usd: 0.0,
            },
        })
    }
}

/// Emitted when every model in a chain fails after full retry (design §4.3).
/// The Scheduler and Swarm Manager treat this as an emergency stop for their consumers.
#[derive(Clone, Debug)]
pub struct CriticalFailure {
    pub role_or_task: String,
    pub errors: Vec<String>,
}

pub struct ModelRouter {
    repo: std::sync::Arc<dyn ModelRepository>,
    provider: std::sync::Arc<dyn ProviderClient>,
    cooldowns: CooldownTable,
    audit: std::sync::Arc<AuditLog>,
    meter: std::sync::Arc<TokenMeter>,
    policy: RoutingPolicy,
}

impl ModelRouter {
    pub fn new(
        repo: std::sync::Arc<dyn ModelRepository>,
        provider: std::sync::Arc<dyn ProviderClient>,
        audit: std::sync::Arc<AuditLog>,
        meter: std::sync::Arc<TokenMeter>,
        policy: RoutingPolicy,
    ) -> Self {
        Self {
            repo,
            provider,
            cooldowns: CooldownTable::new(),
            audit,
            meter,
            policy,
        }
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    /// Dispatches one logical request across the resolved fallback chain, discarding
    /// any streamed deltas (design §4.3 steps 1-6).
    pub async fn chat(
        &self,
        trace_id: &str,
        role_or_task: &str,
        messages: &[Message],
        options: ChatOptions,
    ) -> Result<RouterResponse, CriticalFailure> {
        self.chat_streaming(trace_id, role_or_task, messages, options, &|_| {})
            .await
    }

    /// Dispatches one logical request across the resolved fallback chain
    /// (design §4.3 steps 1-6), forwarding provider deltas to `on_delta` as they
    /// arrive so a caller (the Agent Runtime) can stream them onward.
    #[instrument(skip(self, messages, options, on_delta), fields(role_or_task = %role_or_task))]
    pub async fn chat_streaming(
        &self,
        trace_id: &str,
        role_or_task: &str,
        messages: &[Message],
        options: ChatOptions,
        on_delta: &(dyn Fn(String) + Send + Sync),
    ) -> Result<RouterResponse, CriticalFailure> {
        let chain = crate::model::resolve_chain(self.repo.as_ref(), role_or_task, options.tier);
        if chain.is_empty() {
            return Err(CriticalFailure {
                role_or_task: role_or_task.to_string(),
                errors: vec!["no models resolved for chain".to_string()],
            });
        }

        let mut errors = Vec::new();
        let mut context_overflowed = false;
        let mut min_window_needed = 0u32;

        for descriptor in &chain.descriptors {
            let model_id = descriptor.id();
            if self.cooldowns.is_cooling(&model_id) {
                continue;
            }

            let mut last_kind: Option<RouterErrorKind> = None;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let _ = self
                    .audit
                    .append(
                        trace_id,
                        ActionType::ModelCall,
                        serde_json::json!({"model": model_id, "attempt": attempt}),
                        AuditStatus::Pending,
                    )
                    .await;

                match self.provider.invoke_stream(descriptor, messages, &options, on_delta).await {
                    Ok(response) => {
                        self.cooldowns.clear(&model_id);
                        let _ = self
                            .meter
                            .record(&model_id, response.usage.prompt_tokens, response.usage.completion_tokens)
                            .await;
                        let _ = self
                            .audit
                            .append(
                                trace_id,
                                ActionType::ModelResponse,
                                serde_json::json!({"model": model_id}),
                                AuditStatus::Success,
                            )
                            .await;
                        return Ok(response);
                    }
                    Err(err) => {
                        warn!(model = %model_id, error = %err, "provider call failed");
                        let _ = self
                            .audit
                            .append(
                                trace_id,
                                ActionType::ModelResponse,
                                serde_json::json!({"model": model_id, "error": err.message}),
                                AuditStatus::Error,
                            )
                            .await;

                        if err.kind == RouterErrorKind::ContextOverflow {
                            context_overflowed = true;
                            min_window_needed = descriptor.context_window.unwrap_or(0);
                        }
                        if matches!(err.kind, RouterErrorKind::RateLimited | RouterErrorKind::QuotaExceeded) {
                            self.cooldowns.set_from_error(&model_id, &err, self.policy.cooldown_ms);
                        }

                        errors.push(format!("{model_id}: {err}"));
                        last_kind = Some(err.kind);

                        let retry_same = err.kind.is_retryable_same_model() && attempt < self.policy.max_retries;
                        if retry_same {
                            continue;
                        }
                        break;
                    }
                }
            }

            // Advancement is gated on the flag matching the *actual* failure kind, not
            // a blanket OR of every fallback flag (design §4.3: fallbackOnError only
            // governs errors that aren't rate-limit/quota or context-overflow).
            let should_advance = match last_kind {
                Some(RouterErrorKind::ContextOverflow) => self.policy.fallback_on_context_overflow,
                Some(RouterErrorKind::RateLimited) | Some(RouterErrorKind::QuotaExceeded) => {
                    self.policy.fallback_on_rate_limit
                }
                Some(_) => self.policy.fallback_on_error,
                None => true,
            };
            if !should_advance {
                break;
            }
        }

        if context_overflowed {
            if let Some(upgrade) = chain.smallest_sufficient_upgrade(min_window_needed, &chain.descriptors[0].provider)
            {
                if let Ok(response) = self.provider.invoke_stream(upgrade, messages, &options, on_delta).await {
                    self.cooldowns.clear(&upgrade.id());
                    return Ok(response);
                }
            }
        }

        Err(CriticalFailure {
            role_or_task: role_or_task.to_string(),
            errors,
        })
    }
}

/// Classifies a raw HTTP status/message into a [`RouterErrorKind`] (design §4.3).
pub fn classify_status(status: u16, message: &str) -> RouterErrorKind {
    let lower = message.to_lowercase();
    let is_quota_exceeded = lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
        || lower.contains("rate limit");
    let is_context_overflow = (lower.contains("context") && lower.contains("length"))
        || lower.contains("token limit")
        || lower.contains("maximum context")
        || lower.contains("too long");

    match status {
        429 if is_quota_exceeded => RouterErrorKind::QuotaExceeded,
        429 => RouterErrorKind::RateLimited,
        401 | 403 => RouterErrorKind::AuthFailure,
        408 => RouterErrorKind::Timeout,
        500..=599 => RouterErrorKind::ServerError,
        _ if is_quota_exceeded => RouterErrorKind::QuotaExceeded,
        _ if is_context_overflow => RouterErrorKind::ContextOverflow,
        _ => RouterErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InMemoryModelRepository;
    use std::sync::Arc;

    fn descriptor(provider: &str, model: &str) -> ModelDescriptor {
        ModelDescriptor {
            provider: provider.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            context_window: Some(128_000),
            input_cost_per_million: None,
            output_cost_per_million: None,
        }
    }

    async fn router_with(provider: Arc<dyn ProviderClient>, policy: RoutingPolicy) -> (ModelRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryModelRepository::new());
        repo.add_descriptor(descriptor("openai", "gpt-4o"));
        repo.set_role("thinking", vec!["openai/gpt-4o".to_string()]);
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.db")).unwrap());
        let meter = Arc::new(TokenMeter::new(dir.path().join("tokens.db")).unwrap());
        (ModelRouter::new(repo, provider, audit, meter, policy), dir)
    }

    #[tokio::test]
    async fn successful_call_returns_response_and_records_usage() {
        let provider = Arc::new(MockProviderClient::ok("hi"));
        let (router, _dir) = router_with(provider, RoutingPolicy::default()).await;
        let response = router
            .chat("t1", "thinking", &[], ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "hi");
        let summary = router.meter.summary_for("openai/gpt-4o").await.unwrap();
        assert_eq!(summary.calls, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_emits_critical_failure() {
        let provider = Arc::new(MockProviderClient::failing(ProviderError {
            kind: RouterErrorKind::AuthFailure,
            message: "bad key".into(),
            retry_after_ms: None,
        }));
        let (router, _dir) = router_with(provider, RoutingPolicy::default()).await;
        let err = router
            .chat("t1", "thinking", &[], ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.role_or_task, "thinking");
        assert!(!err.errors.is_empty());
    }

    #[test]
    fn classify_status_maps_429_to_rate_limited() {
        assert_eq!(classify_status(429, ""), RouterErrorKind::RateLimited);
        assert_eq!(classify_status(500, ""), RouterErrorKind::ServerError);
        assert_eq!(
            classify_status(400, "maximum context length exceeded"),
            RouterErrorKind::ContextOverflow
        );
    }

    #[test]
    fn classify_status_detects_quota_exceeded_phrasing() {
        assert_eq!(
            classify_status(429, "You exceeded your current quota, insufficient_quota"),
            RouterErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_status(0, "rate limit reached for requests"),
            RouterErrorKind::QuotaExceeded
        );
    }

    #[test]
    fn classify_status_detects_broader_context_overflow_phrasing() {
        assert_eq!(classify_status(400, "token limit exceeded"), RouterErrorKind::ContextOverflow);
        assert_eq!(classify_status(400, "this exceeds the maximum context"), RouterErrorKind::ContextOverflow);
        assert_eq!(classify_status(400, "your prompt is too long"), RouterErrorKind::ContextOverflow);
    }

    #[tokio::test]
    async fn non_overflow_error_only_advances_when_fallback_on_error_is_set() {
        let provider = Arc::new(MockProviderClient::failing(ProviderError {
            kind: RouterErrorKind::AuthFailure,
            message: "bad key".into(),
            retry_after_ms: None,
        }));
        let (router, _dir) = router_with(
            provider,
            RoutingPolicy {
                fallback_on_error: false,
                ..RoutingPolicy::default()
            },
        )
        .await;
        let err = router
            .chat("t1", "thinking", &[], ChatOptions::default())
            .await
            .unwrap_err();
        // Only the single model in the chain was attempted: should_advance was false,
        // so the loop broke instead of scanning past the (only) descriptor anyway.
        assert_eq!(err.errors.len(), 1);
    }
}
