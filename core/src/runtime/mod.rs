//! Agent Runtime: executes one turn for a given agent against a user prompt
//! (design §4.2).

use std::sync::Arc;

use gateway_config::ExecutionMode;
use gateway_wire::{Frame, StreamType};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::approval::{approval_expiry_ms, ApprovalGate};
use crate::audit::{ActionType, AuditLog, AuditStatus};
use crate::message::Message;
use crate::router::{ChatOptions, CriticalFailure, ModelRouter};
use crate::state::{ToolCall, ToolResult};
use crate::tools::{ToolCallContext, ToolError, ToolRegistry};
use crate::transport::SessionRegistry;

/// Turn state machine (design §4.2): `building → calling_model →
/// (streaming ⇄ tool_dispatch)* → finalized | aborted | cap_exceeded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Building,
    CallingModel,
    Streaming,
    ToolDispatch,
    Finalized,
    Aborted,
    CapExceeded,
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub state: TurnState,
    pub final_message: Option<String>,
}

/// Per-tool execution policy; `Ask` routes through the approval gate before the
/// tool runs (design §4.2 step 4).
pub struct ToolPolicy {
    pub mode: ExecutionMode,
}

const MAX_TOOL_ROUNDS: u32 = 12;

pub struct RuntimeConfig {
    pub context_soft_limit_tokens: u32,
    pub max_tool_rounds: u32,
    /// `execution.defaultCommSkillId` (design §4.4/§4.6): a tool name to notify
    /// out-of-band whenever a tool call needs approval, in addition to the in-band
    /// `approval_request` frame. `None` means no side-channel notice is sent.
    pub default_comm_skill_id: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_soft_limit_tokens: 40_000,
            max_tool_rounds: MAX_TOOL_ROUNDS,
            default_comm_skill_id: None,
        }
    }
}

pub struct AgentRuntime {
    router: Arc<ModelRouter>,
    tools: Arc<ToolRegistry>,
    approvals: Arc<ApprovalGate>,
    audit: Arc<AuditLog>,
    sessions: Arc<SessionRegistry>,
    config: RuntimeConfig,
}

impl AgentRuntime {
    pub fn new(
        router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        approvals: Arc<ApprovalGate>,
        audit: Arc<AuditLog>,
        sessions: Arc<SessionRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            router,
            tools,
            approvals,
            audit,
            sessions,
            config,
        }
    }

    /// Pushes one `stream` frame to the turn's session (design §4.2 steps 3-4). Best
    /// effort, same as every other `Session::send` in the gateway — a closed or
    /// unknown session silently drops the delta rather than failing the turn.
    fn emit_stream(&self, session_id: &str, trace_id: &str, stream_type: StreamType, delta: impl Into<String>) {
        let _ = self.sessions.send(
            session_id,
            Frame::Stream {
                session_id: session_id.to_string(),
                trace_id: trace_id.to_string(),
                stream_type,
                delta: delta.into(),
                metadata: None,
            },
        );
    }

    /// Truncates oldest user/assistant pairs (never the system slot) until the
    /// remaining history fits `contextSoftLimit` tokens (design §4.2 step 2).
    pub fn truncate_to_soft_limit(history: &[Message], limit_tokens: u32) -> Vec<Message> {
        let mut total: u32 = history.iter().map(|m| m.approx_tokens()).sum();
        let mut start = 0;
        while total > limit_tokens && start < history.len() {
            if !history[start].is_truncatable() {
                start += 1;
                continue;
            }
            total = total.saturating_sub(history[start].approx_tokens());
            start += 1;
        }
        history[start..].to_vec()
    }

    /// Builds the system prompt: soul text, tier preamble, enabled skills'
    /// instructions, and a memory recall blurb (design §4.2 step 1). Skill
    /// instructions and memory recall are supplied by the caller since both are
    /// external collaborators the core only consumes through narrow interfaces.
    pub fn build_system_prompt(
        soul_text: &str,
        tier_preamble: &str,
        skill_instructions: &[String],
        memory_recall: &[String],
    ) -> String {
        let mut sections = vec![soul_text.to_string(), tier_preamble.to_string()];
        sections.extend(skill_instructions.iter().cloned());
        if !memory_recall.is_empty() {
            sections.push(format!("Relevant memory:\n{}", memory_recall.join("\n")));
        }
        sections.join("\n\n")
    }

    /// Runs one turn to completion or abort (design §4.2 steps 3-5, state machine).
    /// `session_id` addresses the `stream`/`approval_request` frames this turn emits
    /// along the way; cron-triggered turns with no connected client pass
    /// [`gateway_wire::SENTINEL_SESSION_ID`].
    #[instrument(skip(self, history, role_or_task, policy_for), fields(agent_id = %agent_id))]
    pub async fn run_turn<F>(
        &self,
        agent_id: &str,
        session_id: &str,
        trace_id: &str,
        role_or_task: &str,
        tier: u8,
        history: &mut Vec<Message>,
        cancel: CancellationToken,
        policy_for: F,
    ) -> TurnOutcome
    where
        F: Fn(&str) -> ExecutionMode,
    {
        let mut messages = Self::truncate_to_soft_limit(history, self.config.context_soft_limit_tokens);
        let mut rounds = 0u32;
        let mut state = TurnState::Building;

        loop {
            if cancel.is_cancelled() {
                return TurnOutcome {
                    state: TurnState::Aborted,
                    final_message: None,
                };
            }

            let options = ChatOptions {
                tool_names: self.tools.specs(None).into_iter().map(|s| s.name).collect(),
                tier,
                temperature: None,
            };

            state = TurnState::CallingModel;
            tracing::debug!(?state, trace_id, "turn state transition");
            let on_delta = |delta: String| self.emit_stream(session_id, trace_id, StreamType::Response, delta);
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return TurnOutcome { state: TurnState::Aborted, final_message: None };
                }
                result = self.router.chat_streaming(trace_id, role_or_task, &messages, options, &on_delta) => result,
            };
            state = TurnState::Streaming;
            tracing::debug!(?state, trace_id, "turn state transition");

            let response = match response {
                Ok(r) => r,
                Err(CriticalFailure { errors, .. }) => {
                    let _ = self
                        .audit
                        .append(
                            trace_id,
                            ActionType::Error,
                            serde_json::json!({"errors": errors}),
                            AuditStatus::Error,
                        )
                        .await;
                    return TurnOutcome {
                        state: TurnState::Aborted,
                        final_message: None,
                    };
                }
            };

            if response.tool_calls.is_empty() {
                let mut assistant = Message::assistant(response.content.clone());
                if let Message::Assistant { tool_calls, .. } = &mut assistant {
                    *tool_calls = Vec::new();
                }
                history.push(assistant);
                let _ = self
                    .audit
                    .append(
                        trace_id,
                        ActionType::MessageSent,
                        serde_json::json!({"content": response.content}),
                        AuditStatus::Success,
                    )
                    .await;
                return TurnOutcome {
                    state: TurnState::Finalized,
                    final_message: Some(response.content),
                };
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                let explanatory = "Stopping: maximum tool rounds reached for this turn.".to_string();
                history.push(Message::assistant(explanatory.clone()));
                return TurnOutcome {
                    state: TurnState::CapExceeded,
                    final_message: Some(explanatory),
                };
            }

            let mut assistant_msg = Message::assistant(response.content.clone());
            if let Message::Assistant { tool_calls, .. } = &mut assistant_msg {
                *tool_calls = response.tool_calls.clone();
            }
            history.push(assistant_msg);
            messages = history.clone();

            state = TurnState::ToolDispatch;
            tracing::debug!(?state, trace_id, "turn state transition");
            for call in &response.tool_calls {
                self.emit_stream(
                    session_id,
                    trace_id,
                    StreamType::ToolCall,
                    format!("{}({})", call.name, call.arguments),
                );
                let result = self
                    .dispatch_tool_call(agent_id, session_id, trace_id, call, &policy_for, &cancel)
                    .await;
                if let ToolDispatchOutcome::SecurityBlockFatal(reason) = &result {
                    let _ = self
                        .audit
                        .append(
                            trace_id,
                            ActionType::SecurityEvent,
                            serde_json::json!({"call_id": call.id, "reason": reason}),
                            AuditStatus::Blocked,
                        )
                        .await;
                    return TurnOutcome {
                        state: TurnState::Aborted,
                        final_message: Some(reason.clone()),
                    };
                }
                let tool_result = result.into_tool_result();
                self.emit_stream(session_id, trace_id, StreamType::ToolResult, tool_result.content.clone());
                history.push(Message::tool(tool_result.call_id.clone(), tool_result.content.clone()));
                messages = history.clone();
            }
        }
    }

    async fn dispatch_tool_call<F>(
        &self,
        agent_id: &str,
        session_id: &str,
        trace_id: &str,
        call: &ToolCall,
        policy_for: &F,
        cancel: &CancellationToken,
    ) -> ToolDispatchOutcome
    where
        F: Fn(&str) -> ExecutionMode,
    {
        let _ = self
            .audit
            .append(
                trace_id,
                ActionType::ToolCall,
                serde_json::json!({"name": call.name, "arguments": call.arguments}),
                AuditStatus::Pending,
            )
            .await;

        let spec_exists = self.tools.get(&call.name).is_some();
        if !spec_exists {
            return ToolDispatchOutcome::Result(ToolResult::error(call.id.clone(), "SCHEMA: unknown tool"));
        }

        match policy_for(&call.name) {
            ExecutionMode::Deny => {
                return ToolDispatchOutcome::SecurityBlockFatal(format!(
                    "tool '{}' is denied by execution policy",
                    call.name
                ));
            }
            ExecutionMode::Ask => {
                let approval_id = format!("{trace_id}:{}", call.id);
                let description = format!("tool '{}' requests approval: {}", call.name, call.arguments);

                let _ = self.sessions.send(
                    session_id,
                    Frame::ApprovalRequest {
                        id: approval_id.clone(),
                        kind: "tool_execution".to_string(),
                        description: description.clone(),
                        meta: serde_json::json!({"tool": call.name, "arguments": call.arguments}),
                        expires_at: now_ms() + approval_expiry_ms(),
                        session_id: Some(session_id.to_string()),
                        workspace_id: None,
                    },
                );
                self.notify_comm_skill(agent_id, trace_id, &approval_id, &description).await;

                let approved = tokio::select! {
                    _ = cancel.cancelled() => false,
                    approved = self.approvals_request(approval_id) => approved,
                };
                if !approved {
                    return ToolDispatchOutcome::Result(ToolResult::denied(call.id.clone(), "denied"));
                }
            }
            ExecutionMode::Auto => {}
        }

        let ctx = ToolCallContext {
            agent_id: agent_id.to_string(),
            trace_id: trace_id.to_string(),
        };
        match self.tools.call(&call.name, call.arguments.clone(), &ctx).await {
            Ok(content) => {
                let _ = self
                    .audit
                    .append(
                        trace_id,
                        ActionType::ToolResult,
                        serde_json::json!({"call_id": call.id}),
                        AuditStatus::Success,
                    )
                    .await;
                ToolDispatchOutcome::Result(ToolResult::ok(call.id.clone(), content))
            }
            Err(ToolError::NotFound(_)) => {
                ToolDispatchOutcome::Result(ToolResult::error(call.id.clone(), "SCHEMA: unknown tool"))
            }
            Err(ToolError::Schema(msg)) => {
                ToolDispatchOutcome::Result(ToolResult::error(call.id.clone(), format!("SCHEMA: {msg}")))
            }
            Err(ToolError::Execution(msg)) => {
                let _ = self
                    .audit
                    .append(
                        trace_id,
                        ActionType::ToolResult,
                        serde_json::json!({"call_id": call.id, "error": msg}),
                        AuditStatus::Error,
                    )
                    .await;
                ToolDispatchOutcome::Result(ToolResult::error(call.id.clone(), msg))
            }
        }
    }

    async fn approvals_request(&self, id: String) -> bool {
        self.approvals.request(id).await
    }

    /// Pluggable side-channel notice (design §4.4/§4.6, `execution.defaultCommSkillId`):
    /// when configured, routes an approval notice through a `<skillId>_send`-shaped
    /// tool in addition to the in-band `approval_request` frame, so an operator who
    /// isn't watching the session transcript still hears about it. Best-effort —
    /// a missing or failing skill never blocks the approval flow itself.
    async fn notify_comm_skill(&self, agent_id: &str, trace_id: &str, approval_id: &str, description: &str) {
        let Some(skill_id) = &self.config.default_comm_skill_id else {
            return;
        };
        let ctx = ToolCallContext {
            agent_id: agent_id.to_string(),
            trace_id: trace_id.to_string(),
        };
        let args = serde_json::json!({"approval_id": approval_id, "description": description});
        let _ = self.tools.call(skill_id, args, &ctx).await;
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

enum ToolDispatchOutcome {
    Result(ToolResult),
    SecurityBlockFatal(String),
}

impl ToolDispatchOutcome {
    fn into_tool_result(self) -> ToolResult {
        match self {
            ToolDispatchOutcome::Result(r) => r,
            ToolDispatchOutcome::SecurityBlockFatal(reason) => ToolResult::denied("unknown", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InMemoryModelRepository, ModelDescriptor};
    use crate::router::{MockProviderClient, RoutingPolicy};
    use crate::token_meter::TokenMeter;
    use std::sync::Arc;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            base_url: None,
            api_key: None,
            context_window: Some(128_000),
            input_cost_per_million: None,
            output_cost_per_million: None,
        }
    }

    async fn build_runtime(content: &str) -> (AgentRuntime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryModelRepository::new());
        repo.add_descriptor(descriptor());
        repo.set_role("thinking", vec!["openai/gpt-4o".to_string()]);
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.db")).unwrap());
        let meter = Arc::new(TokenMeter::new(dir.path().join("tokens.db")).unwrap());
        let provider = Arc::new(MockProviderClient::ok(content));
        let router = Arc::new(ModelRouter::new(repo, provider, audit.clone(), meter, RoutingPolicy::default()));
        let tools = Arc::new(ToolRegistry::new());
        let approvals = Arc::new(ApprovalGate::new());
        let sessions = Arc::new(crate::transport::SessionRegistry::new());
        (
            AgentRuntime::new(router, tools, approvals, audit, sessions, RuntimeConfig::default()),
            dir,
        )
    }

    #[tokio::test]
    async fn turn_without_tool_calls_finalizes_immediately() {
        let (runtime, _dir) = build_runtime("final answer").await;
        let mut history = vec![Message::user("hi")];
        let outcome = runtime
            .run_turn(
                "a1",
                gateway_wire::SENTINEL_SESSION_ID,
                "t1",
                "thinking",
                1,
                &mut history,
                CancellationToken::new(),
                |_| ExecutionMode::Auto,
            )
            .await;
        assert_eq!(outcome.state, TurnState::Finalized);
        assert_eq!(outcome.final_message.unwrap(), "final answer");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_turn() {
        let (runtime, _dir) = build_runtime("final answer").await;
        let mut history = vec![Message::user("hi")];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runtime
            .run_turn(
                "a1",
                gateway_wire::SENTINEL_SESSION_ID,
                "t1",
                "thinking",
                1,
                &mut history,
                cancel,
                |_| ExecutionMode::Auto,
            )
            .await;
        assert_eq!(outcome.state, TurnState::Aborted);
    }

    #[tokio::test]
    async fn finalized_turn_streams_at_least_one_response_delta_then_one_message() {
        let (runtime, _dir) = build_runtime("hello there").await;
        let (session, mut rx) = runtime.sessions.open(gateway_wire::Channel::Chat, Some("s1".to_string()));
        let mut history = vec![Message::user("hi")];
        let outcome = runtime
            .run_turn(
                "a1",
                &session.id,
                "t1",
                "thinking",
                1,
                &mut history,
                CancellationToken::new(),
                |_| ExecutionMode::Auto,
            )
            .await;
        assert_eq!(outcome.state, TurnState::Finalized);

        let mut saw_response_stream = false;
        while let Ok(frame) = rx.try_recv() {
            if let gateway_wire::Frame::Stream { stream_type, .. } = frame {
                if stream_type == StreamType::Response {
                    saw_response_stream = true;
                }
            }
        }
        assert!(saw_response_stream, "expected at least one stream(response) delta");
    }

    #[test]
    fn soft_limit_truncation_never_drops_system_message() {
        let history = vec![
            Message::system("s".repeat(10)),
            Message::user("u".repeat(400)),
            Message::assistant("a".repeat(400)),
        ];
        let truncated = AgentRuntime::truncate_to_soft_limit(&history, 1);
        assert!(matches!(truncated[0], Message::System { .. }));
    }
}
