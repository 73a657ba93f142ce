mod status;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::AppConfig;
use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatError, HeartbeatSender};
use crate::logging::{LogLevel, Logger};
use crate::net::{self, Conn, ConnHandle, KeepaliveConfig, VirtualListener};
use crate::storage::{StorageError, StorageFacade};
use crate::wire::{CodecError, Command, FrameDecoder, write_command};

pub use status::StatusServer;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LISTENER_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Unjoined,
    Joining,
    Connected,
    Rejoining,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unjoined => "unjoined",
            Self::Joining => "joining",
            Self::Connected => "connected",
            Self::Rejoining => "rejoining",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub agent_id: String,
    pub master_addr: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub keepalive: KeepaliveConfig,
    pub listener_capacity: usize,
}

impl AgentOptions {
    pub fn new(agent_id: impl Into<String>, master_addr: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            master_addr: master_addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            keepalive: KeepaliveConfig::default(),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }

    pub fn from_config(config: &AppConfig, agent_id: impl Into<String>) -> Self {
        Self {
            connect_timeout: config.cluster.connect_timeout(),
            heartbeat_interval: config.cluster.heartbeat_interval(),
            ..Self::new(agent_id, config.agent.master_addr.clone())
        }
    }
}

#[derive(Debug)]
pub enum AgentError {
    PermanentlyShutDown {
        agent_id: String,
        since: DateTime<Utc>,
    },
    ShutdownRequested,
    NotJoined,
    Dial {
        address: String,
        source: io::Error,
    },
    Codec(CodecError),
    Storage(StorageError),
    Heartbeat(HeartbeatError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermanentlyShutDown { agent_id, since } => write!(
                f,
                "agent '{agent_id}' was permanently shut down by the master at {since}; clear the marker to rejoin"
            ),
            Self::ShutdownRequested => write!(f, "master requested a permanent shutdown"),
            Self::NotJoined => write!(f, "agent has no control connection; call join first"),
            Self::Dial { address, source } => {
                write!(f, "failed to dial master at '{address}': {source}")
            }
            Self::Codec(source) => write!(f, "control connection failed: {source}"),
            Self::Storage(source) => write!(f, "agent state storage failed: {source}"),
            Self::Heartbeat(source) => write!(f, "heartbeat failed: {source}"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial { source, .. } => Some(source),
            Self::Codec(source) => Some(source),
            Self::Storage(source) => Some(source),
            Self::Heartbeat(source) => Some(source),
            _ => None,
        }
    }
}

impl From<CodecError> for AgentError {
    fn from(source: CodecError) -> Self {
        Self::Codec(source)
    }
}

impl From<StorageError> for AgentError {
    fn from(source: StorageError) -> Self {
        Self::Storage(source)
    }
}

impl From<HeartbeatError> for AgentError {
    fn from(source: HeartbeatError) -> Self {
        Self::Heartbeat(source)
    }
}

struct AgentShared {
    agent_id: String,
    state: RwLock<AgentState>,
    control: Mutex<Option<Arc<ConnHandle>>>,
    leaving: AtomicBool,
}

impl AgentShared {
    fn set_state(&self, next: AgentState) {
        *self.state.write().expect("agent state lock poisoned") = next;
    }

    fn state(&self) -> AgentState {
        *self.state.read().expect("agent state lock poisoned")
    }

    fn replace_control(&self, next: Option<Arc<ConnHandle>>) -> Option<Arc<ConnHandle>> {
        let mut control = self.control.lock().expect("agent control lock poisoned");
        std::mem::replace(&mut *control, next)
    }
}

pub struct Agent {
    options: AgentOptions,
    storage: Arc<StorageFacade>,
    logger: Arc<Logger>,
    shared: Arc<AgentShared>,
    pending_control: Option<Conn>,
    listener: Arc<VirtualListener<Conn>>,
}

impl Agent {
    pub fn new(options: AgentOptions, storage: Arc<StorageFacade>, logger: Arc<Logger>) -> Self {
        let listener = Arc::new(VirtualListener::new(
            format!("agent:{}", options.agent_id),
            options.listener_capacity,
        ));
        let shared = Arc::new(AgentShared {
            agent_id: options.agent_id.clone(),
            state: RwLock::new(AgentState::Unjoined),
            control: Mutex::new(None),
            leaving: AtomicBool::new(false),
        });

        Self {
            options,
            storage,
            logger,
            shared,
            pending_control: None,
            listener,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.options.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.shared.state()
    }

    pub fn listener(&self) -> Arc<VirtualListener<Conn>> {
        Arc::clone(&self.listener)
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: Arc::clone(&self.shared),
            logger: Arc::clone(&self.logger),
        }
    }

    pub fn ensure_not_shut_down(&self) -> Result<(), AgentError> {
        match self.storage.shutdown_marker()? {
            Some(marker) => Err(AgentError::PermanentlyShutDown {
                agent_id: marker.agent_id,
                since: marker.shut_down_at,
            }),
            None => Ok(()),
        }
    }

    pub fn join(&mut self) -> Result<(), AgentError> {
        self.ensure_not_shut_down()?;

        let previous = self.shared.state();
        if previous != AgentState::Rejoining {
            self.shared.set_state(AgentState::Joining);
        }
        self.shared.leaving.store(false, Ordering::SeqCst);

        match self.open_control_connection() {
            Ok(conn) => {
                self.pending_control = Some(conn);
                self.logger.log(
                    LogLevel::Info,
                    Some("agent::join"),
                    "Joined master",
                    Some(json!({
                        "agent_id": self.options.agent_id,
                        "master_addr": self.options.master_addr,
                        "rejoin": previous == AgentState::Rejoining,
                    })),
                );
                Ok(())
            }
            Err(error) => {
                if previous != AgentState::Rejoining {
                    self.shared.set_state(AgentState::Unjoined);
                }
                Err(error)
            }
        }
    }

    fn open_control_connection(&self) -> Result<Conn, AgentError> {
        let stream = dial_master(&self.options, &self.logger)?;
        stream
            .set_read_timeout(None)
            .map_err(|source| self.dial_error(source))?;

        let conn = Conn::new(stream).map_err(|source| self.dial_error(source))?;
        let handle = Arc::new(conn.handle().map_err(|source| self.dial_error(source))?);
        handle.send(&Command::Join {
            agent_id: self.options.agent_id.clone(),
        })?;

        if let Some(stale) = self.shared.replace_control(Some(handle)) {
            let _ = stale.shutdown();
        }
        Ok(conn)
    }

    fn dial_error(&self, source: io::Error) -> AgentError {
        AgentError::Dial {
            address: self.options.master_addr.clone(),
            source,
        }
    }

    // Returns `Ok` only after a local `AgentHandle::leave`.
    pub fn serve_protocol(&mut self) -> Result<(), AgentError> {
        let conn = self.pending_control.take().ok_or(AgentError::NotJoined)?;
        let handle = self
            .shared
            .control
            .lock()
            .expect("agent control lock poisoned")
            .clone()
            .ok_or(AgentError::NotJoined)?;

        self.shared.set_state(AgentState::Connected);
        let mut heartbeat = HeartbeatSender::new(
            self.options.agent_id.clone(),
            self.options.heartbeat_interval,
            Arc::clone(&handle),
            Arc::clone(&self.logger),
        )?;
        heartbeat.start()?;

        let mut decoder = FrameDecoder::new(conn);
        let outcome = loop {
            let record = match decoder.decode() {
                Ok(record) => record,
                Err(error) => break Err(AgentError::Codec(error)),
            };

            let command = match Command::try_from(record) {
                Ok(command) => command,
                Err(error) => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some("agent::protocol"),
                        "Skipping invalid command record",
                        Some(json!({ "error": error.to_string() })),
                    );
                    continue;
                }
            };

            match command {
                Command::Shutdown { .. } => {
                    if let Err(error) = self
                        .storage
                        .mark_permanently_shut_down(&self.options.agent_id)
                    {
                        break Err(error.into());
                    }
                    self.logger.log(
                        LogLevel::Warn,
                        Some("agent::protocol"),
                        "Master requested permanent shutdown",
                        Some(json!({ "agent_id": self.options.agent_id })),
                    );
                    break Err(AgentError::ShutdownRequested);
                }
                Command::NewWorker { worker_id, .. } => self.spawn_worker(worker_id),
                other => {
                    self.logger.log(
                        LogLevel::Debug,
                        Some("agent::protocol"),
                        "Ignoring command not addressed to agents",
                        Some(json!({ "cmd": other.kind().as_str() })),
                    );
                }
            }
        };

        // Shut down first: a heartbeat stuck writing would block the join.
        let _ = handle.shutdown();
        let _ = heartbeat.stop();
        if let Some(current) = self.shared.replace_control(None) {
            if !Arc::ptr_eq(&current, &handle) {
                self.shared.replace_control(Some(current));
            }
        }

        match outcome {
            Err(AgentError::ShutdownRequested) => {
                self.shared.set_state(AgentState::Unjoined);
                Err(AgentError::ShutdownRequested)
            }
            Err(AgentError::Codec(_)) if self.shared.leaving.load(Ordering::SeqCst) => {
                self.shared.set_state(AgentState::Unjoined);
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(AgentState::Rejoining);
                self.logger.log(
                    LogLevel::Warn,
                    Some("agent::protocol"),
                    "Control connection lost",
                    Some(json!({
                        "agent_id": self.options.agent_id,
                        "error": error.to_string(),
                    })),
                );
                Err(error)
            }
            Ok(()) => Ok(()),
        }
    }

    fn spawn_worker(&self, worker_id: String) {
        let options = self.options.clone();
        let logger = Arc::clone(&self.logger);
        let listener = Arc::clone(&self.listener);

        thread::spawn(move || {
            let result = open_worker_connection(&options, &worker_id, &logger)
                .and_then(|conn| listener.push(conn).map_err(|error| error.to_string()));

            match result {
                Ok(()) => logger.log(
                    LogLevel::Debug,
                    Some("agent::worker"),
                    "Worker connection handed to local listener",
                    Some(json!({ "worker_id": worker_id })),
                ),
                Err(error) => logger.log(
                    LogLevel::Warn,
                    Some("agent::worker"),
                    "Failed to open worker connection",
                    Some(json!({ "worker_id": worker_id, "error": error })),
                ),
            }
        });
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.options.agent_id)
            .field("master_addr", &self.options.master_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn dial_master(options: &AgentOptions, logger: &Logger) -> Result<std::net::TcpStream, AgentError> {
    let stream = net::dial(&options.master_addr, options.connect_timeout).map_err(|source| {
        AgentError::Dial {
            address: options.master_addr.clone(),
            source,
        }
    })?;

    if let Err(error) = net::configure_keepalive(&stream, options.keepalive) {
        logger.log(
            LogLevel::Warn,
            Some("agent::net"),
            "Failed to enable TCP keepalive",
            Some(json!({ "error": error.to_string() })),
        );
    }
    Ok(stream)
}

fn open_worker_connection(
    options: &AgentOptions,
    worker_id: &str,
    logger: &Logger,
) -> Result<Conn, String> {
    let mut stream = dial_master(options, logger).map_err(|error| error.to_string())?;
    write_command(
        &mut stream,
        &Command::NewWorker {
            agent_id: options.agent_id.clone(),
            worker_id: worker_id.to_owned(),
        },
    )
    .map_err(|error| error.to_string())?;

    Conn::new(stream).map_err(|error| error.to_string())
}

#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<AgentShared>,
    logger: Arc<Logger>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.shared.state()
    }

    pub fn leave(&self) -> Result<(), AgentError> {
        self.shared.leaving.store(true, Ordering::SeqCst);
        let Some(control) = self.shared.replace_control(None) else {
            return Ok(());
        };

        let sent = control.send(&Command::Leave {
            agent_id: self.shared.agent_id.clone(),
        });
        let _ = control.shutdown();
        self.logger.log(
            LogLevel::Info,
            Some("agent::leave"),
            "Left master",
            Some(json!({ "agent_id": self.shared.agent_id })),
        );
        sent.map_err(AgentError::Codec)
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.shared.agent_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::logging::Logger;
    use crate::storage::{test_storage, unique_temp_path};
    use crate::wire::{Command, FrameDecoder, write_command};

    use super::{Agent, AgentError, AgentOptions, AgentState};

    struct Fixture {
        master: TcpListener,
        agent: Agent,
        path: String,
    }

    impl Fixture {
        fn new(label: &str) -> Self {
            let master = TcpListener::bind("127.0.0.1:0").expect("master should bind");
            let addr = master.local_addr().expect("addr should exist");
            let path = unique_temp_path(label);
            let mut options = AgentOptions::new("edge-1", addr.to_string());
            options.heartbeat_interval = Duration::from_secs(60);
            options.connect_timeout = Duration::from_secs(2);
            let agent = Agent::new(
                options,
                Arc::new(test_storage(&path)),
                Arc::new(Logger::discard()),
            );
            Self {
                master,
                agent,
                path,
            }
        }

        fn accept_join(&self) -> TcpStream {
            let (stream, _) = self.master.accept().expect("master should accept");
            let mut decoder = FrameDecoder::new(stream.try_clone().expect("clone should work"));
            let record = decoder.decode().expect("join should decode");
            assert_eq!(record.cmd, "join");
            assert_eq!(record.agent_id, "edge-1");
            stream
        }
    }

    fn cleanup(path: &str) {
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn join_reports_unreachable_master() {
        let mut fixture = Fixture::new("agent-unreachable");
        let addr = fixture.master.local_addr().expect("addr should exist");
        drop(std::mem::replace(
            &mut fixture.master,
            TcpListener::bind("127.0.0.1:0").expect("rebind should work"),
        ));
        fixture.agent.options.master_addr = addr.to_string();

        let error = fixture.agent.join().expect_err("closed port should fail");
        assert!(matches!(error, AgentError::Dial { .. }));
        assert_eq!(fixture.agent.state(), AgentState::Unjoined);
        cleanup(&fixture.path);
    }

    #[test]
    fn serve_protocol_requires_join() {
        let mut fixture = Fixture::new("agent-not-joined");
        assert!(matches!(
            fixture.agent.serve_protocol(),
            Err(AgentError::NotJoined)
        ));
        cleanup(&fixture.path);
    }

    #[test]
    fn new_worker_command_opens_reverse_connection() {
        let mut fixture = Fixture::new("agent-new-worker");
        fixture.agent.join().expect("join should work");
        let mut control = fixture.accept_join();
        let listener = fixture.agent.listener();

        let handle = fixture.agent.handle();
        let mut agent = fixture.agent;
        let server = thread::spawn(move || agent.serve_protocol());

        write_command(
            &mut control,
            &Command::NewWorker {
                agent_id: String::new(),
                worker_id: "w-42".to_owned(),
            },
        )
        .expect("new-worker should send");

        let (worker, _) = fixture.master.accept().expect("worker should dial back");
        let mut decoder = FrameDecoder::new(worker);
        let record = decoder.decode().expect("worker announcement should decode");
        assert_eq!(record.cmd, "new-worker");
        assert_eq!(record.agent_id, "edge-1");
        assert_eq!(record.worker_id, "w-42");

        let (mut master_side, leftover) = decoder.into_parts();
        assert!(leftover.is_empty());
        let mut local = listener
            .accept_timeout(Duration::from_secs(2))
            .expect("local listener should get the worker");
        master_side.write_all(b"ping").expect("write should work");
        let mut received = [0_u8; 4];
        local.read_exact(&mut received).expect("read should work");
        assert_eq!(&received, b"ping");

        handle.leave().expect("leave should work");
        let result = server.join().expect("serve thread should finish");
        assert!(result.is_ok());
        assert_eq!(handle.state(), AgentState::Unjoined);

        let mut decoder = FrameDecoder::new(control);
        let record = decoder.decode().expect("leave should decode");
        assert_eq!(record.cmd, "leave");
        cleanup(&fixture.path);
    }

    #[test]
    fn shutdown_command_persists_marker_and_blocks_rejoin() {
        let mut fixture = Fixture::new("agent-shutdown");
        fixture.agent.join().expect("join should work");
        let mut control = fixture.accept_join();

        write_command(
            &mut control,
            &Command::Shutdown {
                agent_id: "edge-1".to_owned(),
            },
        )
        .expect("shutdown should send");

        assert!(matches!(
            fixture.agent.serve_protocol(),
            Err(AgentError::ShutdownRequested)
        ));
        assert!(matches!(
            fixture.agent.join(),
            Err(AgentError::PermanentlyShutDown { .. })
        ));
        cleanup(&fixture.path);
    }

    #[test]
    fn framing_error_moves_agent_to_rejoining() {
        let mut fixture = Fixture::new("agent-bad-frame");
        fixture.agent.join().expect("join should work");
        let mut control = fixture.accept_join();

        control
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
            .expect("garbage should send");

        assert!(matches!(
            fixture.agent.serve_protocol(),
            Err(AgentError::Codec(_))
        ));
        assert_eq!(fixture.agent.state(), AgentState::Rejoining);

        fixture.agent.join().expect("rejoin should work");
        assert_eq!(fixture.agent.state(), AgentState::Rejoining);
        fixture.accept_join();
        cleanup(&fixture.path);
    }
}
