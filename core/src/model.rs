//! Model descriptors, chains, and the repository the router resolves them from
//! (design §3 Model Descriptor / Model Chain, §4.3 chain resolution).

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A single addressable model endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub context_window: Option<u32>,
    /// USD per million input tokens.
    pub input_cost_per_million: Option<f64>,
    /// USD per million output tokens.
    pub output_cost_per_million: Option<f64>,
}

impl ModelDescriptor {
    /// The `provider/model` composite id used as the repository key and on the wire.
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    pub fn input_cost(&self) -> f64 {
        self.input_cost_per_million.unwrap_or(0.0)
    }

    pub fn output_cost(&self) -> f64 {
        self.output_cost_per_million.unwrap_or(0.0)
    }
}

/// An ordered, de-duplicated fallback sequence resolved for one `chat()` call.
#[derive(Clone, Debug)]
pub struct ModelChain {
    pub descriptors: Vec<ModelDescriptor>,
}

impl ModelChain {
    pub fn single(descriptor: ModelDescriptor) -> Self {
        Self {
            descriptors: vec![descriptor],
        }
    }

    /// Deduplicates by composite id, preserving first occurrence order, then
    /// truncates to the tier's maximum chain length (design §3: tier 3 → 3,
    /// tier 1/2 → 5).
    pub fn build(candidates: Vec<ModelDescriptor>, tier: u8) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut descriptors = Vec::new();
        for d in candidates {
            let id = d.id();
            if seen.insert(id) {
                descriptors.push(d);
            }
        }
        let max_len = if tier == 3 { 3 } else { 5 };
        descriptors.truncate(max_len);
        Self { descriptors }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The descriptor with the smallest `contextWindow` strictly greater than
    /// `min_window`, preferring the same provider as `preferred_provider` when
    /// a tie would otherwise be ambiguous (design §4.3 context-overflow escalation).
    pub fn smallest_sufficient_upgrade(
        &self,
        min_window: u32,
        preferred_provider: &str,
    ) -> Option<&ModelDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.context_window.unwrap_or(0) > min_window)
            .min_by(|a, b| {
                let a_same = a.provider == preferred_provider;
                let b_same = b.provider == preferred_provider;
                match (a_same, b_same) {
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    _ => a
                        .context_window
                        .unwrap_or(0)
                        .cmp(&b.context_window.unwrap_or(0)),
                }
            })
    }
}

/// How a role or task name resolves to a chain (design §4.3 step 1).
pub trait ModelRepository: Send + Sync {
    fn get(&self, id: &str) -> Option<ModelDescriptor>;
    fn list(&self) -> Vec<ModelDescriptor>;
    fn role_chain(&self, role: &str) -> Option<Vec<ModelDescriptor>>;
    fn task_override(&self, task: &str) -> Option<String>;
}

/// In-memory repository seeded at startup from `GatewayConfig`; the router never
/// reads model configuration from disk directly (design §4.3).
#[derive(Default)]
pub struct InMemoryModelRepository {
    descriptors: DashMap<String, ModelDescriptor>,
    roles: DashMap<String, Vec<String>>,
    task_overrides: DashMap<String, String>,
}

impl InMemoryModelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor(&self, descriptor: ModelDescriptor) {
        self.descriptors.insert(descriptor.id(), descriptor);
    }

    pub fn set_role(&self, role: impl Into<String>, model_ids: Vec<String>) {
        self.roles.insert(role.into(), model_ids);
    }

    pub fn set_task_override(&self, task: impl Into<String>, target: impl Into<String>) {
        self.task_overrides.insert(task.into(), target.into());
    }

    pub fn seed_from_map(&self, descriptors: HashMap<String, ModelDescriptor>) {
        for (_, d) in descriptors {
            self.add_descriptor(d);
        }
    }
}

impl ModelRepository for InMemoryModelRepository {
    fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.descriptors.get(id).map(|d| d.clone())
    }

    fn list(&self) -> Vec<ModelDescriptor> {
        self.descriptors.iter().map(|e| e.value().clone()).collect()
    }

    fn role_chain(&self, role: &str) -> Option<Vec<ModelDescriptor>> {
        let ids = self.roles.get(role)?;
        Some(
            ids.iter()
                .filter_map(|id| self.descriptors.get(id).map(|d| d.clone()))
                .collect(),
        )
    }

    fn task_override(&self, task: &str) -> Option<String> {
        self.task_overrides.get(task).map(|v| v.clone())
    }
}

/// Whether `override` is already a direct `provider/model` id (design §4.3 step 1).
pub fn looks_like_model_id(candidate: &str) -> bool {
    candidate.split('/').filter(|s| !s.is_empty()).count() == 2
}

/// Resolves a role-or-task name (or a direct id) to a chain (design §4.3 step 1).
pub fn resolve_chain(
    repo: &dyn ModelRepository,
    role_or_task: &str,
    tier: u8,
) -> ModelChain {
    if looks_like_model_id(role_or_task) {
        if let Some(d) = repo.get(role_or_task) {
            return ModelChain::build(vec![d], tier);
        }
    }
    if let Some(target) = repo.task_override(role_or_task) {
        if looks_like_model_id(&target) {
            if let Some(d) = repo.get(&target) {
                return ModelChain::build(vec![d], tier);
            }
        } else if let Some(chain) = repo.role_chain(&target) {
            return ModelChain::build(chain, tier);
        }
    }
    let chain = repo.role_chain(role_or_task).unwrap_or_default();
    ModelChain::build(chain, tier)
}
