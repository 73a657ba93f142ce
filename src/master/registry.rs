use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;

use crate::net::ConnHandle;

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    AgentNotFound { agent_id: String },
    AgentDisconnected { agent_id: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentNotFound { agent_id } => write!(f, "agent '{agent_id}' is not registered"),
            Self::AgentDisconnected { agent_id } => {
                write!(f, "agent '{agent_id}' has no live control connection")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

struct AgentRecord {
    control: Option<Arc<ConnHandle>>,
    joined_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    healthy: bool,
    // Dropping the sender ends the agent's liveness detector.
    _liveness_stop: Sender<()>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub healthy: bool,
    pub connected: bool,
    pub peer_addr: Option<String>,
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub first_join: bool,
    pub recovered: bool,
    pub liveness_stop: Option<Receiver<()>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub registered: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub connected: usize,
}

#[derive(Default)]
pub struct AgentRegistry {
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    pub fn register_join(&self, agent_id: &str, control: Arc<ConnHandle>) -> JoinOutcome {
        let now = Utc::now();
        let mut records = self.records.write().expect("agent registry lock poisoned");

        if let Some(record) = records.get_mut(agent_id) {
            if let Some(previous) = record.control.take() {
                let _ = previous.shutdown();
            }
            let recovered = !record.healthy;
            record.control = Some(control);
            record.joined_at = now;
            record.last_active_at = now;
            record.healthy = true;
            return JoinOutcome {
                first_join: false,
                recovered,
                liveness_stop: None,
            };
        }

        let (stop_tx, stop_rx) = bounded(0);
        records.insert(
            agent_id.to_owned(),
            AgentRecord {
                control: Some(control),
                joined_at: now,
                last_active_at: now,
                healthy: true,
                _liveness_stop: stop_tx,
            },
        );
        JoinOutcome {
            first_join: true,
            recovered: false,
            liveness_stop: Some(stop_rx),
        }
    }

    pub fn touch(&self, agent_id: &str) -> bool {
        let mut records = self.records.write().expect("agent registry lock poisoned");
        let Some(record) = records.get_mut(agent_id) else {
            return false;
        };
        record.last_active_at = Utc::now();
        record.healthy = true;
        true
    }

    pub fn control(&self, agent_id: &str) -> Result<Arc<ConnHandle>, RegistryError> {
        let records = self.records.read().expect("agent registry lock poisoned");
        let record = records
            .get(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound {
                agent_id: agent_id.to_owned(),
            })?;
        record
            .control
            .clone()
            .ok_or_else(|| RegistryError::AgentDisconnected {
                agent_id: agent_id.to_owned(),
            })
    }

    // Clears the slot only if it still holds `handle`; a rejoin may have replaced it.
    pub fn release_control(&self, agent_id: &str, handle: &Arc<ConnHandle>) -> bool {
        let mut records = self.records.write().expect("agent registry lock poisoned");
        let Some(record) = records.get_mut(agent_id) else {
            return false;
        };
        if record
            .control
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            record.control = None;
            return true;
        }
        false
    }

    pub fn close(&self, agent_id: &str) -> Result<bool, RegistryError> {
        let previous = {
            let mut records = self.records.write().expect("agent registry lock poisoned");
            let record = records
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound {
                    agent_id: agent_id.to_owned(),
                })?;
            record.healthy = false;
            record.control.take()
        };
        match previous {
            Some(previous) => {
                let _ = previous.shutdown();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn disconnect(&self, agent_id: &str) -> bool {
        let previous = {
            let mut records = self.records.write().expect("agent registry lock poisoned");
            records
                .get_mut(agent_id)
                .and_then(|record| record.control.take())
        };
        match previous {
            Some(previous) => {
                let _ = previous.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, agent_id: &str) -> Result<Option<Arc<ConnHandle>>, RegistryError> {
        self.records
            .write()
            .expect("agent registry lock poisoned")
            .remove(agent_id)
            .map(|record| record.control)
            .ok_or_else(|| RegistryError::AgentNotFound {
                agent_id: agent_id.to_owned(),
            })
    }

    pub fn liveness(&self, agent_id: &str) -> Option<(DateTime<Utc>, bool)> {
        self.records
            .read()
            .expect("agent registry lock poisoned")
            .get(agent_id)
            .map(|record| (record.last_active_at, record.healthy))
    }

    // Flips healthy to unhealthy once, so a death is reported once.
    pub fn mark_dead_if_healthy(&self, agent_id: &str) -> bool {
        let mut records = self.records.write().expect("agent registry lock poisoned");
        match records.get_mut(agent_id) {
            Some(record) if record.healthy => {
                record.healthy = false;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.records
            .read()
            .expect("agent registry lock poisoned")
            .contains_key(agent_id)
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.records
            .read()
            .expect("agent registry lock poisoned")
            .get(agent_id)
            .map(|record| snapshot_of(agent_id, record))
    }

    pub fn snapshots(&self, healthy: Option<bool>) -> Vec<AgentSnapshot> {
        let records = self.records.read().expect("agent registry lock poisoned");
        let mut snapshots: Vec<AgentSnapshot> = records
            .iter()
            .filter(|(_, record)| healthy.is_none_or(|wanted| record.healthy == wanted))
            .map(|(agent_id, record)| snapshot_of(agent_id, record))
            .collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        snapshots
    }

    pub fn counts(&self) -> RegistryCounts {
        let records = self.records.read().expect("agent registry lock poisoned");
        let healthy = records.values().filter(|record| record.healthy).count();
        RegistryCounts {
            registered: records.len(),
            healthy,
            unhealthy: records.len() - healthy,
            connected: records
                .values()
                .filter(|record| record.control.is_some())
                .count(),
        }
    }
}

fn snapshot_of(agent_id: &str, record: &AgentRecord) -> AgentSnapshot {
    AgentSnapshot {
        agent_id: agent_id.to_owned(),
        joined_at: record.joined_at,
        last_active_at: record.last_active_at,
        healthy: record.healthy,
        connected: record.control.is_some(),
        peer_addr: record
            .control
            .as_ref()
            .map(|control| control.peer_addr().to_string()),
    }
}
