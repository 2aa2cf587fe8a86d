//! Gateway binary: wires the control plane (model router, swarm manager, scheduler,
//! approval/input gate, audit log, token meter) to the transport layer and starts
//! listening. This process is the whole server — there is no separate local/remote
//! execution mode to choose, unlike the teacher's multi-backend CLI.

mod log_format;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use gateway_config::{ExecutionMode, GatewaySettings};
use gateway_core::approval::{ApprovalGate, InputGate};
use gateway_core::audit::{ActionType, AuditLog, AuditStatus};
use gateway_core::message::Message;
use gateway_core::model::{InMemoryModelRepository, ModelDescriptor};
use gateway_core::router::{ModelRouter, OpenAiProviderClient, ProviderClient, RoutingPolicy};
use gateway_core::runtime::{AgentRuntime, RuntimeConfig, TurnState};
use gateway_core::scheduler::{apply_tick_outcome, JobStatus, JobStore};
use gateway_core::swarm::{SwarmManager, Sweeper};
use gateway_core::token_meter::TokenMeter;
use gateway_core::tools::ToolRegistry;
use gateway_core::transport::SessionRegistry;
use gateway_transport::{run_gateway, spawn_audit_bridge, spawn_token_bridge, GatewayHandler};
use gateway_wire::{ErrorCode, Frame};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "gateway",
    about = "Agent gateway: model router, swarm manager, scheduler, approval gate, and transport"
)]
struct Cli {
    /// Address the WebSocket server binds to.
    #[arg(long, env = "GATEWAY_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,

    /// Directory holding the audit/token/job SQLite stores.
    #[arg(long, env = "GATEWAY_DATA_DIR", default_value = "./gateway-data")]
    data_dir: PathBuf,

    /// Exit after the first connection completes; used by smoke tests.
    #[arg(long, default_value_t = false)]
    once: bool,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Seeds a single model chain from the environment. Multi-model role chains are an
/// operator-supplied config surface the gateway doesn't yet expose via env vars;
/// this gets a working default up so `thinking`/`fast` resolve to something.
fn seed_model_repository(repo: &InMemoryModelRepository) {
    let provider = std::env::var("GATEWAY_MODEL_PROVIDER").unwrap_or_else(|_| "openai".to_string());
    let model = std::env::var("GATEWAY_MODEL_NAME").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let base_url = std::env::var("GATEWAY_MODEL_BASE_URL").ok();
    let api_key = std::env::var("GATEWAY_MODEL_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let context_window = std::env::var("GATEWAY_MODEL_CONTEXT_WINDOW")
        .ok()
        .and_then(|v| v.parse().ok())
        .or(Some(128_000));
    let input_cost_per_million = std::env::var("GATEWAY_MODEL_INPUT_COST_PER_MILLION")
        .ok()
        .and_then(|v| v.parse().ok());
    let output_cost_per_million = std::env::var("GATEWAY_MODEL_OUTPUT_COST_PER_MILLION")
        .ok()
        .and_then(|v| v.parse().ok());

    let descriptor = ModelDescriptor {
        provider,
        model,
        base_url,
        api_key,
        context_window,
        input_cost_per_million,
        output_cost_per_million,
    };
    let id = descriptor.id();
    repo.add_descriptor(descriptor);
    repo.set_role("thinking", vec![id.clone()]);
    repo.set_role("fast", vec![id]);
}

/// Bridges demultiplexed wire frames into the runtime: one turn per inbound
/// `message`, the architect's history kept per session.
struct GatewayState {
    architect_id: String,
    runtime: Arc<AgentRuntime>,
    approvals: Arc<ApprovalGate>,
    inputs: Arc<InputGate>,
    sessions: Arc<SessionRegistry>,
    histories: DashMap<String, Vec<Message>>,
    execution_shell: ExecutionMode,
}

#[async_trait]
impl GatewayHandler for GatewayState {
    async fn on_message(&self, session_id: String, content: String, _metadata: Option<Value>) {
        let trace_id = Uuid::new_v4().to_string();
        let mut history = self
            .histories
            .entry(session_id.clone())
            .or_insert_with(Vec::new)
            .clone();
        history.push(Message::user(content));

        let execution_shell = self.execution_shell;
        let outcome = self
            .runtime
            .run_turn(
                &self.architect_id,
                &session_id,
                &trace_id,
                "thinking",
                1,
                &mut history,
                CancellationToken::new(),
                move |_tool_name| execution_shell,
            )
            .await;

        self.histories.insert(session_id.clone(), history);

        let frame = match outcome.final_message {
            Some(content) => Frame::Message {
                session_id: session_id.clone(),
                content,
                metadata: None,
            },
            None => Frame::error(
                ErrorCode::Fatal,
                format!("turn ended in state {:?} with no reply", outcome.state),
                Some(session_id.clone()),
            ),
        };
        let _ = self.sessions.send(&session_id, frame);
    }

    async fn on_approval_response(&self, id: String, approved: bool) {
        self.approvals.resolve(&id, approved);
    }

    async fn on_input_response(&self, id: String, value: String) {
        self.inputs.resolve(&id, value);
    }
}

/// Drives cron ticks: `gateway-core`'s scheduler module is deliberately a pure
/// data/persistence layer with no loop of its own (design §4.5 names the protocol,
/// not a driver), so the binary that owns the runtime polls for due jobs itself.
async fn run_scheduler_loop(
    job_store: Arc<JobStore>,
    runtime: Arc<AgentRuntime>,
    architect_id: String,
    audit: Arc<AuditLog>,
    execution_shell: ExecutionMode,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let jobs = match job_store.load_all().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to load cron jobs");
                continue;
            }
        };

        let now = now_ms();
        for job in jobs {
            if !job.enabled {
                continue;
            }
            let due = job.next_scheduled_ms.map(|t| t <= now).unwrap_or(false);
            if !due {
                continue;
            }

            if job.running_at_ms.is_some() {
                // Previous tick's run is still in flight; record the miss rather than
                // silently dropping it so an operator can see it in job status.
                let mut skipped = job.clone();
                skipped.last_status = Some(JobStatus::Skipped);
                let _ = job_store.upsert(&skipped).await;
                continue;
            }

            let mut running = job.clone();
            running.running_at_ms = Some(now);
            if job_store.upsert(&running).await.is_err() {
                continue;
            }

            let trace_id = Uuid::new_v4().to_string();
            let _ = audit
                .append(
                    &trace_id,
                    ActionType::CronTick,
                    serde_json::json!({"job": job.name}),
                    AuditStatus::Pending,
                )
                .await;

            let turn_cancel = CancellationToken::new();
            let timeout_guard = (job.timeout_seconds > 0).then(|| {
                let turn_cancel = turn_cancel.clone();
                let timeout = Duration::from_secs(job.timeout_seconds);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    turn_cancel.cancel();
                })
            });

            let mut history = vec![Message::user(job.instruction.clone())];
            let outcome = runtime
                .run_turn(
                    &architect_id,
                    gateway_wire::SENTINEL_SESSION_ID,
                    &trace_id,
                    "thinking",
                    1,
                    &mut history,
                    turn_cancel.clone(),
                    |_| execution_shell,
                )
                .await;
            if let Some(guard) = timeout_guard {
                guard.abort();
            }
            let timed_out = turn_cancel.is_cancelled();
            let succeeded = matches!(outcome.state, TurnState::Finalized);

            let _ = audit
                .append(
                    &trace_id,
                    ActionType::CronTick,
                    serde_json::json!({"job": job.name, "succeeded": succeeded, "timed_out": timed_out}),
                    if succeeded { AuditStatus::Success } else { AuditStatus::Error },
                )
                .await;

            // A `critical_failure` abort (the router exhausted its whole fallback chain)
            // is the only `Aborted` outcome with neither a timeout nor a final message;
            // tool denials always carry the denial reason, and timeouts set `timed_out`.
            let critical_failure = matches!(outcome.state, TurnState::Aborted) && !timed_out && outcome.final_message.is_none();
            if critical_failure {
                warn!(job = %job.name, "critical model failure during cron tick; pausing all enabled jobs");
                pause_all_jobs(&job_store).await;
            }

            let updated = apply_tick_outcome(running, 60_000, succeeded);
            let _ = job_store.upsert(&updated).await;
        }
    }
}

/// Emergency stop (design §4.5): a `critical_failure` from the model router means
/// every fallback model is exhausted, so further ticks would just fail the same way.
async fn pause_all_jobs(job_store: &JobStore) {
    let Ok(jobs) = job_store.load_all().await else {
        return;
    };
    for job in jobs.iter().filter(|j| j.enabled) {
        let _ = job_store.pause_job(&job.name).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    gateway_config::load_and_apply("gateway", None).ok();
    logging::init();

    let cli = Cli::parse();
    let settings = GatewaySettings::from_env();
    std::fs::create_dir_all(&cli.data_dir)?;

    let repo = Arc::new(InMemoryModelRepository::new());
    seed_model_repository(&repo);

    let audit = Arc::new(AuditLog::new(cli.data_dir.join("audit.db"))?);
    let meter = Arc::new(TokenMeter::new(cli.data_dir.join("tokens.db"))?);
    let job_store = Arc::new(JobStore::new(cli.data_dir.join("jobs.db"))?);

    let policy = RoutingPolicy {
        max_retries: settings.routing.max_retries,
        fallback_on_rate_limit: settings.routing.fallback_on_rate_limit,
        fallback_on_error: settings.routing.fallback_on_error,
        fallback_on_context_overflow: settings.routing.fallback_on_context_overflow,
        cooldown_ms: settings.routing.cooldown_ms,
    };
    let provider: Arc<dyn ProviderClient> = Arc::new(OpenAiProviderClient::new());
    let router = Arc::new(ModelRouter::new(
        repo.clone(),
        provider,
        audit.clone(),
        meter.clone(),
        policy,
    ));

    let swarm = Arc::new(SwarmManager::new());
    let architect = swarm.spawn_architect(
        "Run the gateway: route requests, delegate to managers, keep the swarm healthy.",
        gateway_core::soul::default_soul_text(),
        "thinking",
    );

    let tools = Arc::new(ToolRegistry::new());
    let approvals = Arc::new(ApprovalGate::new());
    let inputs = Arc::new(InputGate::new());

    let sessions = Arc::new(SessionRegistry::new());

    let runtime_config = RuntimeConfig {
        context_soft_limit_tokens: settings.context_soft_limit,
        default_comm_skill_id: settings.execution_default_comm_skill_id.clone(),
        ..RuntimeConfig::default()
    };
    let runtime = Arc::new(AgentRuntime::new(
        router,
        tools,
        approvals.clone(),
        audit.clone(),
        sessions.clone(),
        runtime_config,
    ));

    let sweeper_cancel = CancellationToken::new();
    tokio::spawn(Sweeper::new(swarm.clone()).run(sweeper_cancel.clone()));

    let scheduler_cancel = CancellationToken::new();
    tokio::spawn(run_scheduler_loop(
        job_store,
        runtime.clone(),
        architect.id.clone(),
        audit.clone(),
        settings.execution_shell,
        scheduler_cancel.clone(),
    ));

    spawn_audit_bridge(audit.clone(), sessions.clone());
    spawn_token_bridge(meter, sessions.clone());

    let handler: Arc<dyn GatewayHandler> = Arc::new(GatewayState {
        architect_id: architect.id.clone(),
        runtime,
        approvals,
        inputs,
        sessions: sessions.clone(),
        histories: DashMap::new(),
        execution_shell: settings.execution_shell,
    });

    info!(addr = %cli.addr, data_dir = %cli.data_dir.display(), "starting gateway");
    let result = run_gateway(Some(&cli.addr), sessions, handler, cli.once).await;

    sweeper_cancel.cancel();
    scheduler_cancel.cancel();
    result
}
