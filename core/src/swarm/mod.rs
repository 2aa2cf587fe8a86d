//! Swarm Manager: maintains the agent tree and mediates inter-agent work (design §4.4).
//!
//! The agent graph is an arena (id-keyed `DashMap`) rather than parent/child object
//! references, following the teacher's use of `dashmap` for shared concurrent maps and
//! the arena-by-id discipline the design calls for when porting a cyclic-reference
//! graph out of a garbage-collected language (design §9).

mod sweeper;

pub use sweeper::Sweeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use gateway_config::ExecutionMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::runtime::{AgentRuntime, TurnOutcome, TurnState};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Architect = 1,
    Manager = 2,
    Worker = 3,
}

impl Tier {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Architect,
    Manager,
    Worker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    Idle,
    Working,
    Deactivated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub tier: Tier,
    pub kind: AgentKind,
    pub parent_id: Option<String>,
    pub status: AgentStatus,
    pub birth_time_ms: u64,
    pub last_activity_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub soul_text: String,
    pub mission: String,
    pub tool_allowlist: Vec<String>,
    pub model_chain_id: String,
    pub timeout_ms: u64,
}

const DEFAULT_TIMEOUT_MS: u64 = 3_600_000;
const MAX_TIER2_QUOTA: usize = 8;
const MAX_TIER3_QUOTA: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("spawn quota exceeded for tier {0:?}")]
    Quota(Tier),
    #[error("parent tier {0:?} may not spawn {1:?}")]
    Policy(Tier, AgentKind),
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("no recipient for peer message: {0}")]
    NoRecipient(String),
}

/// Result of one delegated task, fed back to the parent as a tool_result.
#[derive(Clone, Debug)]
pub struct DelegationResult {
    pub child_id: String,
    pub content: String,
    pub is_error: bool,
}

impl DelegationResult {
    fn from_outcome(agent_id: &str, display_name: &str, outcome: TurnOutcome) -> Self {
        let is_error = !matches!(outcome.state, TurnState::Finalized) || outcome.final_message.is_none();
        let content = outcome.final_message.unwrap_or_else(|| {
            format!("'{display_name}' ended without a final message (state {:?})", outcome.state)
        });
        Self {
            child_id: agent_id.to_string(),
            content,
            is_error,
        }
    }
}

pub struct SwarmManager {
    agents: DashMap<String, Agent>,
    next_id: AtomicU64,
}

impl SwarmManager {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }

    /// Seeds the single architect at process start; not subject to quota/policy checks.
    pub fn spawn_architect(&self, mission: impl Into<String>, soul_text: impl Into<String>, model_chain_id: impl Into<String>) -> Agent {
        let id = self.fresh_id("architect");
        let now = now_ms();
        let agent = Agent {
            id: id.clone(),
            display_name: "architect".to_string(),
            tier: Tier::Architect,
            kind: AgentKind::Architect,
            parent_id: None,
            status: AgentStatus::Idle,
            birth_time_ms: now,
            last_activity_at_ms: now,
            ended_at_ms: None,
            soul_text: soul_text.into(),
            mission: mission.into(),
            tool_allowlist: Vec::new(),
            model_chain_id: model_chain_id.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };
        self.agents.insert(id, agent.clone());
        agent
    }

    /// `spawn(parentId, role, tier, mission, modelChain?)` (design §4.4).
    pub fn spawn(
        &self,
        parent_id: &str,
        display_name: impl Into<String>,
        mission: impl Into<String>,
        soul_text: impl Into<String>,
        model_chain_id: impl Into<String>,
    ) -> Result<Agent, SwarmError> {
        let parent = self
            .agents
            .get(parent_id)
            .ok_or_else(|| SwarmError::NotFound(parent_id.to_string()))?
            .clone();

        let (child_tier, child_kind) = match parent.tier {
            Tier::Architect => (Tier::Manager, AgentKind::Manager),
            Tier::Manager => (Tier::Worker, AgentKind::Worker),
            Tier::Worker => return Err(SwarmError::Policy(Tier::Worker, AgentKind::Worker)),
        };

        let quota = if child_tier == Tier::Manager { MAX_TIER2_QUOTA } else { MAX_TIER3_QUOTA };
        let current = self
            .agents
            .iter()
            .filter(|e| e.tier == child_tier && e.status != AgentStatus::Deactivated)
            .count();
        if current >= quota {
            return Err(SwarmError::Quota(child_tier));
        }

        let id = self.fresh_id(match child_tier {
            Tier::Manager => "manager",
            Tier::Worker => "worker",
            Tier::Architect => "architect",
        });
        let now = now_ms();
        let agent = Agent {
            id: id.clone(),
            display_name: display_name.into(),
            tier: child_tier,
            kind: child_kind,
            parent_id: Some(parent_id.to_string()),
            status: AgentStatus::Spawning,
            birth_time_ms: now,
            last_activity_at_ms: now,
            ended_at_ms: None,
            soul_text: soul_text.into(),
            mission: mission.into(),
            tool_allowlist: Vec::new(),
            model_chain_id: model_chain_id.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };
        self.agents.insert(id.clone(), agent.clone());
        if let Some(mut p) = self.agents.get_mut(parent_id) {
            p.last_activity_at_ms = now;
        }
        Ok(agent)
    }

    pub fn mark_idle(&self, id: &str) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.status = AgentStatus::Idle;
            agent.last_activity_at_ms = now_ms();
        }
    }

    pub fn mark_working(&self, id: &str) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.status = AgentStatus::Working;
            agent.last_activity_at_ms = now_ms();
        }
    }

    /// `terminate(id, reason)`: marks deactivated; children keep running until their own sweep.
    pub fn terminate(&self, id: &str, _reason: &str) -> Result<(), SwarmError> {
        let mut agent = self.agents.get_mut(id).ok_or_else(|| SwarmError::NotFound(id.to_string()))?;
        agent.status = AgentStatus::Deactivated;
        agent.ended_at_ms = Some(now_ms());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).map(|a| a.clone())
    }

    /// Consistent snapshot; agents mid-spawn are not returned (design §4.4 invariant).
    pub fn all_agents(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|e| e.status != AgentStatus::Spawning)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Unfiltered snapshot including agents still `spawning`; used by the sweeper,
    /// which must be able to reap agents stuck in that state.
    pub fn all_agents_including_spawning(&self) -> Vec<Agent> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    #[cfg(test)]
    pub fn debug_set_birth_time(&self, id: &str, ms: u64) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.birth_time_ms = ms;
        }
    }

    #[cfg(test)]
    pub fn debug_set_last_activity(&self, id: &str, ms: u64) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.last_activity_at_ms = ms;
        }
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Routes between active tier-3 peers by name or id (design §4.4 `sendPeerMessage`).
    pub fn find_peer(&self, from_id: &str, name_or_id: &str) -> Result<Agent, SwarmError> {
        let from = self.agents.get(from_id).ok_or_else(|| SwarmError::NotFound(from_id.to_string()))?;
        if from.tier != Tier::Worker {
            return Err(SwarmError::NoRecipient(name_or_id.to_string()));
        }
        self.agents
            .iter()
            .find(|e| {
                e.tier == Tier::Worker
                    && e.status != AgentStatus::Deactivated
                    && (e.id == name_or_id || e.display_name == name_or_id)
            })
            .map(|e| e.value().clone())
            .ok_or_else(|| SwarmError::NoRecipient(name_or_id.to_string()))
    }

    /// Builds the follow-up instruction a tier-1 spawn must inject before the
    /// architect's turn ends (design §4.4 manager mandate).
    pub fn manager_mandate(manager: &Agent) -> String {
        format!(
            "Before ending this turn, call delegate on the newly spawned manager '{}' ({})",
            manager.display_name, manager.id
        )
    }

    /// `delegate(parentId, childId, task)` (design §4.4): runs one full turn for an
    /// already-spawned child on the parent's behalf and folds the result back into a
    /// [`DelegationResult`] the parent can feed into its own history as a tool_result.
    pub async fn delegate<F>(
        &self,
        runtime: &AgentRuntime,
        parent_id: &str,
        child_id: &str,
        task: impl Into<String>,
        trace_id: &str,
        policy_for: F,
    ) -> Result<DelegationResult, SwarmError>
    where
        F: Fn(&str) -> ExecutionMode,
    {
        let child = self.agents.get(child_id).ok_or_else(|| SwarmError::NotFound(child_id.to_string()))?.clone();
        if child.parent_id.as_deref() != Some(parent_id) {
            return Err(SwarmError::NotFound(child_id.to_string()));
        }

        self.mark_working(child_id);
        let mut history = vec![Message::user(task.into())];
        let outcome = runtime
            .run_turn(
                child_id,
                gateway_wire::SENTINEL_SESSION_ID,
                trace_id,
                &child.model_chain_id,
                child.tier.as_u8(),
                &mut history,
                CancellationToken::new(),
                policy_for,
            )
            .await;
        self.mark_idle(child_id);
        if let Some(mut parent) = self.agents.get_mut(parent_id) {
            parent.last_activity_at_ms = now_ms();
        }

        Ok(DelegationResult::from_outcome(child_id, &child.display_name, outcome))
    }

    /// `sendPeerMessage(fromId, toNameOrId, content)` (design §4.4): routes a message
    /// between tier-3 peers, running one turn on the recipient with the message as its
    /// prompt. Reuses [`find_peer`] for the lookup/tier rules.
    pub async fn send_peer_message<F>(
        &self,
        runtime: &AgentRuntime,
        from_id: &str,
        to_name_or_id: &str,
        content: impl Into<String>,
        trace_id: &str,
        policy_for: F,
    ) -> Result<DelegationResult, SwarmError>
    where
        F: Fn(&str) -> ExecutionMode,
    {
        let from = self.agents.get(from_id).ok_or_else(|| SwarmError::NotFound(from_id.to_string()))?.clone();
        let target = self.find_peer(from_id, to_name_or_id)?;

        self.mark_working(&target.id);
        let mut history = vec![Message::user(format!("Message from peer '{}': {}", from.display_name, content.into()))];
        let outcome = runtime
            .run_turn(
                &target.id,
                gateway_wire::SENTINEL_SESSION_ID,
                trace_id,
                &target.model_chain_id,
                target.tier.as_u8(),
                &mut history,
                CancellationToken::new(),
                policy_for,
            )
            .await;
        self.mark_idle(&target.id);

        Ok(DelegationResult::from_outcome(&target.id, &target.display_name, outcome))
    }

    /// `notifyFailure(id, reason)` (design §4.4): deactivates the failing agent and
    /// hands back its parent id so the caller can relay the failure onward, the same
    /// way `terminate` deactivates without cascading to children.
    pub fn notify_failure(&self, id: &str, reason: &str) -> Result<Option<String>, SwarmError> {
        let mut agent = self.agents.get_mut(id).ok_or_else(|| SwarmError::NotFound(id.to_string()))?;
        agent.status = AgentStatus::Deactivated;
        agent.ended_at_ms = Some(now_ms());
        let parent_id = agent.parent_id.clone();
        drop(agent);
        tracing::warn!(agent_id = %id, reason, "agent reported failure to swarm");
        Ok(parent_id)
    }
}

impl Default for SwarmManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architect_can_only_spawn_managers() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("run the gateway", "soul", "thinking");
        let manager = swarm.spawn(&architect.id, "ops-manager", "oversee ops", "soul", "thinking").unwrap();
        assert_eq!(manager.tier, Tier::Manager);
    }

    #[test]
    fn manager_spawns_workers_worker_spawns_nothing() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "thinking");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let worker = swarm.spawn(&manager.id, "w1", "mission", "s", "fast").unwrap();
        assert_eq!(worker.tier, Tier::Worker);

        let err = swarm.spawn(&worker.id, "w2", "mission", "s", "fast").unwrap_err();
        assert!(matches!(err, SwarmError::Policy(Tier::Worker, _)));
    }

    #[test]
    fn terminate_does_not_cascade_to_children() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "thinking");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let worker = swarm.spawn(&manager.id, "w1", "mission", "s", "fast").unwrap();

        swarm.terminate(&manager.id, "done").unwrap();
        let refetched_worker = swarm.get(&worker.id).unwrap();
        assert_eq!(refetched_worker.status, AgentStatus::Spawning);
    }

    #[test]
    fn spawning_agents_are_excluded_from_snapshot() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "thinking");
        swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let snapshot = swarm.all_agents();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, architect.id);
    }

    #[test]
    fn find_peer_requires_worker_tier_on_both_ends() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "thinking");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let worker_a = swarm.spawn(&manager.id, "alice", "mission", "s", "fast").unwrap();
        swarm.mark_idle(&worker_a.id);

        let err = swarm.find_peer(&manager.id, "alice").unwrap_err();
        assert!(matches!(err, SwarmError::NoRecipient(_)));
    }

    async fn build_runtime(content: &str) -> (AgentRuntime, tempfile::TempDir) {
        use crate::approval::ApprovalGate;
        use crate::audit::AuditLog;
        use crate::model::{InMemoryModelRepository, ModelDescriptor};
        use crate::router::{MockProviderClient, ModelRouter, RoutingPolicy};
        use crate::runtime::RuntimeConfig;
        use crate::token_meter::TokenMeter;
        use crate::transport::SessionRegistry;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryModelRepository::new());
        repo.add_descriptor(ModelDescriptor {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            base_url: None,
            api_key: None,
            context_window: Some(128_000),
            input_cost_per_million: None,
            output_cost_per_million: None,
        });
        repo.set_role("fast", vec!["openai/gpt-4o".to_string()]);
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.db")).unwrap());
        let meter = Arc::new(TokenMeter::new(dir.path().join("tokens.db")).unwrap());
        let provider = Arc::new(MockProviderClient::ok(content));
        let router = Arc::new(ModelRouter::new(repo, provider, audit.clone(), meter, RoutingPolicy::default()));
        let tools = Arc::new(crate::tools::ToolRegistry::new());
        let approvals = Arc::new(ApprovalGate::new());
        let sessions = Arc::new(SessionRegistry::new());
        (
            AgentRuntime::new(router, tools, approvals, audit, sessions, RuntimeConfig::default()),
            dir,
        )
    }

    #[tokio::test]
    async fn delegate_runs_the_child_turn_and_returns_its_final_message() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "fast");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let (runtime, _dir) = build_runtime("delegated work is done").await;

        let result = swarm
            .delegate(&runtime, &architect.id, &manager.id, "do the thing", "t1", |_| ExecutionMode::Auto)
            .await
            .unwrap();

        assert_eq!(result.child_id, manager.id);
        assert_eq!(result.content, "delegated work is done");
        assert!(!result.is_error);
        assert_eq!(swarm.get(&manager.id).unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn delegate_rejects_a_child_that_does_not_belong_to_the_parent() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "fast");
        let other_architect = swarm.spawn_architect("m2", "s", "fast");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let (runtime, _dir) = build_runtime("irrelevant").await;

        let err = swarm
            .delegate(&runtime, &other_architect.id, &manager.id, "do the thing", "t1", |_| ExecutionMode::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::NotFound(_)));
    }

    #[tokio::test]
    async fn send_peer_message_runs_a_turn_on_the_recipient() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "fast");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();
        let alice = swarm.spawn(&manager.id, "alice", "mission", "s", "fast").unwrap();
        let bob = swarm.spawn(&manager.id, "bob", "mission", "s", "fast").unwrap();
        swarm.mark_idle(&alice.id);
        swarm.mark_idle(&bob.id);
        let (runtime, _dir) = build_runtime("got it, thanks").await;

        let result = swarm
            .send_peer_message(&runtime, &alice.id, "bob", "need a hand", "t1", |_| ExecutionMode::Auto)
            .await
            .unwrap();

        assert_eq!(result.child_id, bob.id);
        assert_eq!(result.content, "got it, thanks");
    }

    #[test]
    fn notify_failure_deactivates_and_returns_the_parent_id() {
        let swarm = SwarmManager::new();
        let architect = swarm.spawn_architect("m", "s", "fast");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();

        let parent = swarm.notify_failure(&manager.id, "ran out of budget").unwrap();
        assert_eq!(parent, Some(architect.id));
        assert_eq!(swarm.get(&manager.id).unwrap().status, AgentStatus::Deactivated);
    }
}
