//! In-memory view of connected agents and their capacity facts.
//!
//! Entries are created on Register, refreshed by Heartbeat, and removed on
//! disconnect. An agent counts as online only while its last heartbeat is
//! within the liveness window; [`AgentRegistry::get`] and
//! [`AgentRegistry::online`] apply the filter so callers never see dead
//! entries.
//!
//! The registry-tracked `running_jobs` is the authoritative value for
//! dispatch admission: the dispatcher increments it when an assignment
//! commits and the reconciler releases it on terminal reports. The
//! heartbeat-carried count overwrites it as a sanity signal between those
//! events.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Heartbeats older than this mark an agent offline.
pub const ONLINE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub hostname: String,
    pub max_concurrency: i32,
    pub paused: bool,
    pub running_jobs: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    online_window: Duration,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_online_window(Duration::seconds(ONLINE_WINDOW_SECS))
    }

    /// Custom liveness window, used by tests to exercise expiry quickly.
    pub fn with_online_window(online_window: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            online_window,
        }
    }

    /// Upsert on Register. A reconnecting agent keeps its original
    /// connected_at only if the old entry was already removed; a fresh
    /// Register on a live entry refreshes hostname and concurrency.
    pub fn register(&self, agent_id: &str, hostname: &str, max_concurrency: i32) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        match agents.get_mut(agent_id) {
            Some(agent) => {
                agent.hostname = hostname.to_string();
                agent.max_concurrency = max_concurrency;
                agent.last_heartbeat = now;
            }
            None => {
                agents.insert(
                    agent_id.to_string(),
                    AgentInfo {
                        agent_id: agent_id.to_string(),
                        hostname: hostname.to_string(),
                        max_concurrency,
                        paused: false,
                        running_jobs: 0,
                        last_heartbeat: now,
                        connected_at: now,
                    },
                );
            }
        }
    }

    pub fn update_heartbeat(&self, agent_id: &str, paused: bool, running_jobs: i32) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.last_heartbeat = Utc::now();
            agent.paused = paused;
            agent.running_jobs = running_jobs;
        }
    }

    pub fn unregister(&self, agent_id: &str) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(agent_id);
    }

    /// Returns the entry only while the agent is online.
    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .get(agent_id)
            .filter(|a| self.is_online(a))
            .cloned()
    }

    /// Snapshot of all agents passing the liveness filter.
    pub fn online(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .values()
            .filter(|a| self.is_online(a))
            .cloned()
            .collect()
    }

    /// Capacity accounting: one increment per committed assignment.
    pub fn increment_running(&self, agent_id: &str) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.running_jobs += 1;
        }
    }

    /// Capacity accounting: one release per observed terminal status,
    /// clamped so the counter never goes negative.
    pub fn release_running(&self, agent_id: &str) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = agents.get_mut(agent_id) {
            if agent.running_jobs > 0 {
                agent.running_jobs -= 1;
            }
        }
    }

    fn is_online(&self, agent: &AgentInfo) -> bool {
        Utc::now() - agent.last_heartbeat < self.online_window
    }
}
