use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::net::Conn;

pub type CallbackResult = Result<(), String>;
pub type JoinCallback = Arc<dyn Fn(&str, bool) -> CallbackResult + Send + Sync>;
pub type DieCallback = Arc<dyn Fn(&str) -> CallbackResult + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Join,
    Rejoin,
    Heartbeat,
    NewWorker,
    Close,
    Shutdown,
    Flagging,
    Die,
    Recovery,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Rejoin => "rejoin",
            Self::Heartbeat => "heartbeat",
            Self::NewWorker => "new-worker",
            Self::Close => "close",
            Self::Shutdown => "shutdown",
            Self::Flagging => "flagging",
            Self::Die => "die",
            Self::Recovery => "recovery",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub agent_id: String,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn now(agent_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            at: Utc::now(),
        }
    }
}

// Clones share one take-once slot; an untaken connection closes with the last clone.
#[derive(Clone)]
pub struct WorkerArrival {
    pub agent_id: String,
    pub worker_id: String,
    conn: Arc<Mutex<Option<Conn>>>,
}

impl WorkerArrival {
    pub fn new(agent_id: impl Into<String>, worker_id: impl Into<String>, conn: Conn) -> Self {
        Self {
            agent_id: agent_id.into(),
            worker_id: worker_id.into(),
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    pub fn matches(&self, agent_id: &str, worker_id: &str) -> bool {
        self.agent_id == agent_id && self.worker_id == worker_id
    }

    pub fn take(&self) -> Option<Conn> {
        self.conn
            .lock()
            .expect("worker arrival lock poisoned")
            .take()
    }

    pub fn discard(&self) {
        if let Some(conn) = self.take() {
            let _ = conn.shutdown();
        }
    }
}

impl fmt::Debug for WorkerArrival {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerArrival")
            .field("agent_id", &self.agent_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

// Runs in registration order; a failing or panicking callback is logged and skipped.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) on_join: Vec<JoinCallback>,
    pub(crate) on_die: Vec<DieCallback>,
}

impl Callbacks {
    pub(crate) fn run_join(&self, agent_id: &str, first_join: bool, logger: &Logger) {
        for (idx, callback) in self.on_join.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(agent_id, first_join)));
            report("join", idx, agent_id, result, logger);
        }
    }

    pub(crate) fn run_die(&self, agent_id: &str, logger: &Logger) {
        for (idx, callback) in self.on_die.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(agent_id)));
            report("die", idx, agent_id, result, logger);
        }
    }
}

fn report(
    kind: &str,
    idx: usize,
    agent_id: &str,
    result: std::thread::Result<CallbackResult>,
    logger: &Logger,
) {
    let message = match result {
        Ok(Ok(())) => return,
        Ok(Err(message)) => message,
        Err(_) => "callback panicked".to_owned(),
    };
    logger.log(
        LogLevel::Error,
        Some("master::callbacks"),
        "Callback failed",
        Some(json!({
            "callback": kind,
            "index": idx,
            "agent_id": agent_id,
            "error": message,
        })),
    );
}
