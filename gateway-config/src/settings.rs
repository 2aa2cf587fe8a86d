//! Typed runtime settings recognized by the gateway core (design §6).
//!
//! All options are optional with defaults; [`GatewaySettings::from_env`] reads them from
//! the process environment after [`crate::load_and_apply`] has merged `.env`/XDG config in.

use std::env;

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// `execution.shell` policy: whether shell-capable tools run freely, require approval, or are denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    Auto,
    #[default]
    Ask,
    Deny,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "ask" => Ok(Self::Ask),
            "deny" => Ok(Self::Deny),
            _ => Err(format!("unknown execution.shell mode: {s} (use auto, ask, or deny)")),
        }
    }
}

/// Model-router specific settings.
#[derive(Clone, Debug)]
pub struct RoutingSettings {
    /// Clamped to 1..=10.
    pub max_retries: u32,
    pub fallback_on_rate_limit: bool,
    pub fallback_on_error: bool,
    pub fallback_on_context_overflow: bool,
    pub cooldown_ms: u64,
}

impl Default for RoutingSettings {
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

impl RoutingSettings {
    fn from_env() -> Self {
        let max_retries = env_u32("GATEWAY_ROUTING_MAX_RETRIES", 5).clamp(1, 10);
        Self {
            max_retries,
            fallback_on_rate_limit: env_bool("GATEWAY_ROUTING_FALLBACK_ON_RATE_LIMIT", true),
            fallback_on_error: env_bool("GATEWAY_ROUTING_FALLBACK_ON_ERROR", false),
            fallback_on_context_overflow: env_bool(
                "GATEWAY_ROUTING_FALLBACK_ON_CONTEXT_OVERFLOW",
                true,
            ),
            cooldown_ms: env_u64("GATEWAY_ROUTING_COOLDOWN_MS", 60_000),
        }
    }
}

/// Full set of options the core recognizes, loaded once at startup.
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub context_soft_limit: u32,
    pub heartbeat_interval_minutes: u64,
    pub dreamer_interval_minutes: u64,
    pub monologue_interval_minutes: u64,
    pub routing: RoutingSettings,
    pub max_tier2_agents: u32,
    pub max_tier3_agents: u32,
    pub default_retry_limit: u32,
    pub execution_shell: ExecutionMode,
    pub execution_default_channel: Option<String>,
    pub execution_default_comm_skill_id: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            context_soft_limit: 40_000,
            heartbeat_interval_minutes: 30,
            dreamer_interval_minutes: 120,
            monologue_interval_minutes: 60,
            routing: RoutingSettings::default(),
            max_tier2_agents: 4,
            max_tier3_agents: 12,
            default_retry_limit: 3,
            execution_shell: ExecutionMode::Ask,
            execution_default_channel: None,
            execution_default_comm_skill_id: None,
        }
    }
}

impl GatewaySettings {
    /// Reads every option from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let execution_shell = env::var("GATEWAY_EXECUTION_SHELL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.execution_shell);
        Self {
            context_soft_limit: env_u32("GATEWAY_CONTEXT_SOFT_LIMIT", defaults.context_soft_limit),
            heartbeat_interval_minutes: env_u64(
                "GATEWAY_HEARTBEAT_INTERVAL_MINUTES",
                defaults.heartbeat_interval_minutes,
            ),
            dreamer_interval_minutes: env_u64(
                "GATEWAY_DREAMER_INTERVAL_MINUTES",
                defaults.dreamer_interval_minutes,
            ),
            monologue_interval_minutes: env_u64(
                "GATEWAY_MONOLOGUE_INTERVAL_MINUTES",
                defaults.monologue_interval_minutes,
            ),
            routing: RoutingSettings::from_env(),
            max_tier2_agents: env_u32("GATEWAY_MAX_TIER2_AGENTS", defaults.max_tier2_agents),
            max_tier3_agents: env_u32("GATEWAY_MAX_TIER3_AGENTS", defaults.max_tier3_agents),
            default_retry_limit: env_u32(
                "GATEWAY_DEFAULT_RETRY_LIMIT",
                defaults.default_retry_limit,
            ),
            execution_shell,
            execution_default_channel: env::var("GATEWAY_EXECUTION_DEFAULT_CHANNEL").ok(),
            execution_default_comm_skill_id: env::var("GATEWAY_EXECUTION_DEFAULT_COMM_SKILL_ID")
                .ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let s = GatewaySettings::default();
        assert_eq!(s.context_soft_limit, 40_000);
        assert_eq!(s.routing.max_retries, 5);
        assert!(s.routing.fallback_on_rate_limit);
        assert!(!s.routing.fallback_on_error);
        assert!(s.routing.fallback_on_context_overflow);
        assert_eq!(s.routing.cooldown_ms, 60_000);
        assert_eq!(s.execution_shell, ExecutionMode::Ask);
    }

    #[test]
    fn max_retries_is_clamped() {
        std::env::set_var("GATEWAY_ROUTING_MAX_RETRIES", "99");
        let s = RoutingSettings::from_env();
        std::env::remove_var("GATEWAY_ROUTING_MAX_RETRIES");
        assert_eq!(s.max_retries, 10);
    }

    #[test]
    fn execution_mode_parses() {
        assert_eq!("auto".parse::<ExecutionMode>().unwrap(), ExecutionMode::Auto);
        assert_eq!("ASK".parse::<ExecutionMode>().unwrap(), ExecutionMode::Ask);
        assert_eq!("deny".parse::<ExecutionMode>().unwrap(), ExecutionMode::Deny);
        assert!("nope".parse::<ExecutionMode>().is_err());
    }
}
