use crate::types::{Agent, AgentStatus, ReleaseOutcome};
use crewforge_core::{CrewforgeError, CrewforgeResult, Role};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// The set of agents, their capability tags and live status.
///
/// Agents are kept in registration order, which is the final tie-break when
/// picking an idle agent.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    busy_since: HashMap<String, Instant>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. It starts `Idle` with no current task.
    pub fn register(&mut self, mut agent: Agent) -> CrewforgeResult<()> {
        if self.agents.iter().any(|a| a.id == agent.id) {
            return Err(CrewforgeError::DuplicateAgent(agent.id));
        }
        agent.status = AgentStatus::Idle;
        agent.current_task = None;
        debug!(agent = %agent.id, role = %agent.role, "Agent registered");
        self.agents.push(agent);
        Ok(())
    }

    /// Remove an agent. Refused while it holds a task.
    pub fn remove(&mut self, agent_id: &str) -> CrewforgeResult<Agent> {
        let index = self.index_of(agent_id)?;
        if self.agents[index].status == AgentStatus::Busy {
            return Err(CrewforgeError::AgentNotIdle(agent_id.to_string()));
        }
        Ok(self.agents.remove(index))
    }

    /// Toggle an agent between `Idle` and `Unavailable`.
    pub fn set_available(&mut self, agent_id: &str, available: bool) -> CrewforgeResult<()> {
        let agent = self.get_mut(agent_id)?;
        match (agent.status, available) {
            (AgentStatus::Busy, _) => Err(CrewforgeError::AgentNotIdle(agent_id.to_string())),
            (_, true) => {
                agent.status = AgentStatus::Idle;
                Ok(())
            }
            (_, false) => {
                agent.status = AgentStatus::Unavailable;
                Ok(())
            }
        }
    }

    /// An idle agent able to take a task with `role_tag`.
    ///
    /// Lowest cumulative busy time wins, then registration order. `None`
    /// matches any idle agent.
    pub fn find_idle_matching(&self, role_tag: Option<Role>) -> Option<&Agent> {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle && a.matches(role_tag))
            .min_by_key(|a| a.stats.busy_time_ms)
    }

    /// `Idle -> Busy` with `current_task = task_id`.
    pub fn reserve(&mut self, agent_id: &str, task_id: Uuid) -> CrewforgeResult<()> {
        let agent = self.get_mut(agent_id)?;
        if agent.status != AgentStatus::Idle {
            return Err(CrewforgeError::AgentNotIdle(agent_id.to_string()));
        }
        agent.status = AgentStatus::Busy;
        agent.current_task = Some(task_id);
        self.busy_since.insert(agent_id.to_string(), Instant::now());
        Ok(())
    }

    /// `Busy -> Idle`: clears the current task and updates stats.
    ///
    /// Returns the time spent on the task. Releasing an agent that is not
    /// busy changes nothing.
    pub fn release(&mut self, agent_id: &str, outcome: ReleaseOutcome) -> CrewforgeResult<Duration> {
        let elapsed = self
            .busy_since
            .remove(agent_id)
            .map(|since| since.elapsed())
            .unwrap_or_default();
        let agent = self.get_mut(agent_id)?;
        if agent.status != AgentStatus::Busy {
            debug!(agent = %agent_id, status = ?agent.status, "Release of non-busy agent ignored");
            return Ok(Duration::ZERO);
        }

        agent.status = AgentStatus::Idle;
        agent.current_task = None;
        agent.stats.busy_time_ms += u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome {
            ReleaseOutcome::Completed => agent.stats.completed += 1,
            ReleaseOutcome::Failed => agent.stats.failed += 1,
            ReleaseOutcome::Cancelled => {}
        }
        Ok(elapsed)
    }

    /// All agents in registration order.
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    fn get_mut(&mut self, agent_id: &str) -> CrewforgeResult<&mut Agent> {
        self.agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| CrewforgeError::AgentNotFound(agent_id.to_string()))
    }

    fn index_of(&self, agent_id: &str) -> CrewforgeResult<usize> {
        self.agents
            .iter()
            .position(|a| a.id == agent_id)
            .ok_or_else(|| CrewforgeError::AgentNotFound(agent_id.to_string()))
    }

    pub fn busy_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Busy)
            .count()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
