//! Periodic reaper for stuck/idle agents (design §4.4 Sweeper).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{AgentStatus, SwarmManager, Tier};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STUCK_SPAWNING_MS: u64 = 10 * 60 * 1000;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Runs `sweep_once` every 60s until cancelled. The architect is exempt from reaping.
pub struct Sweeper {
    swarm: Arc<SwarmManager>,
}

impl Sweeper {
    pub fn new(swarm: Arc<SwarmManager>) -> Self {
        Self { swarm }
    }

    /// One reaping pass: terminates agents stuck in `spawning` past 10 minutes or idle
    /// past their own `timeoutMs`. Returns the ids of agents it terminated.
    pub fn sweep_once(&self) -> Vec<String> {
        let now = now_ms();
        let mut reaped = Vec::new();
        for agent in self.swarm.all_agents_including_spawning() {
            if agent.tier == Tier::Architect || agent.status == AgentStatus::Deactivated {
                continue;
            }
            let stuck_spawning = agent.status == AgentStatus::Spawning
                && now.saturating_sub(agent.birth_time_ms) > STUCK_SPAWNING_MS;
            let idle_timeout = agent.status != AgentStatus::Spawning
                && now.saturating_sub(agent.last_activity_at_ms) > agent.timeout_ms;
            if stuck_spawning || idle_timeout {
                if self.swarm.terminate(&agent.id, "sweeper_timeout").is_ok() {
                    reaped.push(agent.id);
                }
            }
        }
        reaped
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.sweep_once();
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "sweeper reaped stale agents");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_reaps_agents_stuck_spawning() {
        let swarm = Arc::new(SwarmManager::new());
        let architect = swarm.spawn_architect("m", "s", "thinking");
        let manager = swarm.spawn(&architect.id, "m1", "mission", "s", "fast").unwrap();

        // force the birth time far enough into the past to look stuck
        swarm.debug_set_birth_time(&manager.id, now_ms() - STUCK_SPAWNING_MS - 1);

        let sweeper = Sweeper::new(swarm.clone());
        let reaped = sweeper.sweep_once();
        assert_eq!(reaped, vec![manager.id]);
    }

    #[test]
    fn architect_is_exempt_from_sweeping() {
        let swarm = Arc::new(SwarmManager::new());
        let architect = swarm.spawn_architect("m", "s", "thinking");
        swarm.debug_set_birth_time(&architect.id, 0);
        swarm.debug_set_last_activity(&architect.id, 0);

        let sweeper = Sweeper::new(swarm.clone());
        let reaped = sweeper.sweep_once();
        assert!(reaped.is_empty());
    }
}
