use std::sync::Weak;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::json;

use crate::config::ClusterConfig;
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::logging::LogLevel;

use super::MasterShared;
use super::events::{EventKind, LifecycleEvent};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FLAGGING_MULTIPLIER: u32 = 3;
pub const DEFAULT_DEAD_MULTIPLIER: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub check_interval: Duration,
    pub flagging_multiplier: u32,
    pub dead_multiplier: u32,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            flagging_multiplier: DEFAULT_FLAGGING_MULTIPLIER,
            dead_multiplier: DEFAULT_DEAD_MULTIPLIER,
        }
    }
}

impl From<&ClusterConfig> for LivenessPolicy {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            check_interval: config.liveness_check_interval(),
            flagging_multiplier: config.flagging_multiplier,
            dead_multiplier: config.dead_multiplier,
        }
    }
}

impl LivenessPolicy {
    pub fn flagging_after(&self) -> Duration {
        self.heartbeat_interval * self.flagging_multiplier
    }

    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * self.dead_multiplier
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Flagging,
    Dead,
    AlreadyDead,
}

pub fn assess(
    last_active_at: DateTime<Utc>,
    healthy: bool,
    now: DateTime<Utc>,
    policy: &LivenessPolicy,
) -> Verdict {
    if !healthy {
        return Verdict::AlreadyDead;
    }

    // Clock skew into the future counts as "just active".
    let idle = now
        .signed_duration_since(last_active_at)
        .to_std()
        .unwrap_or_default();

    if idle > policy.dead_after() {
        Verdict::Dead
    } else if idle > policy.flagging_after() {
        Verdict::Flagging
    } else {
        Verdict::Healthy
    }
}

// Runs until the registration is removed or the master is gone.
pub(super) fn spawn_detector(agent_id: String, stop: Receiver<()>, shared: Weak<MasterShared>) {
    thread::spawn(move || {
        loop {
            let Some(check_interval) = shared
                .upgrade()
                .map(|shared| shared.options.liveness.check_interval)
            else {
                break;
            };
            match stop.recv_timeout(check_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !check_once(&agent_id, &shared) {
                break;
            }
        }
    });
}

fn check_once(agent_id: &str, shared: &MasterShared) -> bool {
    let Some((last_active_at, healthy)) = shared.registry.liveness(agent_id) else {
        return false;
    };

    match assess(last_active_at, healthy, Utc::now(), &shared.options.liveness) {
        Verdict::Dead => {
            if shared.registry.mark_dead_if_healthy(agent_id) {
                shared.logger.log(
                    LogLevel::Warn,
                    Some("master::liveness"),
                    "Agent declared dead",
                    Some(json!({
                        "agent_id": agent_id,
                        "last_active_at": last_active_at.to_rfc3339(),
                    })),
                );
                shared.callbacks.run_die(agent_id, &shared.logger);
                shared
                    .events
                    .publish(LifecycleEvent::now(agent_id, EventKind::Die));
            }
        }
        Verdict::Flagging => {
            shared.logger.log(
                LogLevel::Info,
                Some("master::liveness"),
                "Agent missed heartbeats",
                Some(json!({
                    "agent_id": agent_id,
                    "last_active_at": last_active_at.to_rfc3339(),
                })),
            );
            shared
                .events
                .publish(LifecycleEvent::now(agent_id, EventKind::Flagging));
        }
        Verdict::Healthy | Verdict::AlreadyDead => {}
    }
    true
}
