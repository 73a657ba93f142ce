mod events;
mod liveness;
mod registry;
mod tunnel;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::logging::{LogLevel, Logger};
use crate::net::{Conn, ConnHandle, ListenerError, VirtualListener};
use crate::pubsub::{
    DEFAULT_PUBLISH_TIMEOUT, DEFAULT_SUBSCRIPTION_BUFFER, Publisher, Subscription,
};
use crate::wire::{CodecError, Command, FrameDecoder};

pub use events::{
    CallbackResult, DieCallback, EventKind, JoinCallback, LifecycleEvent, WorkerArrival,
};
pub use liveness::{LivenessPolicy, Verdict, assess};
pub use registry::{AgentSnapshot, RegistryCounts, RegistryError};
pub use tunnel::{AgentHttpClient, HttpTunnelError};

use events::Callbacks;
use registry::AgentRegistry;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterOptions {
    pub dial_timeout: Duration,
    pub liveness: LivenessPolicy,
    pub publish_timeout: Duration,
    pub subscription_buffer: usize,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            liveness: LivenessPolicy::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

impl From<&ClusterConfig> for MasterOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            liveness: LivenessPolicy::from(config),
            publish_timeout: config.publish_timeout(),
            subscription_buffer: config.subscription_buffer,
        }
    }
}

#[derive(Debug)]
pub enum DialError {
    AgentNotFound { agent_id: String },
    AgentDisconnected { agent_id: String },
    Send { agent_id: String, source: CodecError },
    Timeout { agent_id: String, waited: Duration },
    Closed,
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentNotFound { agent_id } => write!(f, "agent '{agent_id}' is not registered"),
            Self::AgentDisconnected { agent_id } => {
                write!(f, "agent '{agent_id}' has no live control connection")
            }
            Self::Send { agent_id, source } => {
                write!(f, "failed to send new-worker to agent '{agent_id}': {source}")
            }
            Self::Timeout { agent_id, waited } => write!(
                f,
                "agent '{agent_id}' did not open a worker connection within {}ms",
                waited.as_millis()
            ),
            Self::Closed => write!(f, "worker bus closed while waiting for a connection"),
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Send { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<RegistryError> for DialError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::AgentNotFound { agent_id } => Self::AgentNotFound { agent_id },
            RegistryError::AgentDisconnected { agent_id } => Self::AgentDisconnected { agent_id },
        }
    }
}

struct MasterShared {
    options: MasterOptions,
    registry: AgentRegistry,
    workers: Publisher<WorkerArrival>,
    events: Publisher<LifecycleEvent>,
    callbacks: Callbacks,
    logger: Arc<Logger>,
    pending_dials: AtomicUsize,
}

pub struct MasterBuilder {
    options: MasterOptions,
    logger: Arc<Logger>,
    callbacks: Callbacks,
}

impl MasterBuilder {
    pub fn new(options: MasterOptions, logger: Arc<Logger>) -> Self {
        Self {
            options,
            logger,
            callbacks: Callbacks::default(),
        }
    }

    pub fn on_join<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, bool) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_join.push(Arc::new(callback));
        self
    }

    pub fn on_die<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.on_die.push(Arc::new(callback));
        self
    }

    pub fn build(self) -> Master {
        let options = self.options;
        let workers = Publisher::with_limits(
            "workers",
            Arc::clone(&self.logger),
            options.subscription_buffer,
            options.publish_timeout,
        );
        let events = Publisher::with_limits(
            "lifecycle",
            Arc::clone(&self.logger),
            options.subscription_buffer,
            options.publish_timeout,
        );

        Master {
            shared: Arc::new(MasterShared {
                options,
                registry: AgentRegistry::default(),
                workers,
                events,
                callbacks: self.callbacks,
                logger: self.logger,
                pending_dials: AtomicUsize::new(0),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Master {
    shared: Arc<MasterShared>,
}

impl Master {
    pub fn builder(options: MasterOptions, logger: Arc<Logger>) -> MasterBuilder {
        MasterBuilder::new(options, logger)
    }

    pub fn options(&self) -> &MasterOptions {
        &self.shared.options
    }

    pub fn serve(&self, listener: &VirtualListener<Conn>) -> Result<(), ListenerError> {
        loop {
            match listener.accept() {
                Ok(conn) => self.accept_connection(conn),
                Err(ListenerError::Closed { .. }) => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    pub fn accept_connection(&self, conn: Conn) {
        let master = self.clone();
        thread::spawn(move || master.classify(conn));
    }

    fn classify(&self, conn: Conn) {
        let peer = conn.peer_addr().to_string();
        let mut decoder = FrameDecoder::new(conn);

        let command = loop {
            let record = match decoder.decode() {
                Ok(record) => record,
                Err(error) => {
                    self.log_decode_end(&peer, None, &error);
                    return;
                }
            };
            match Command::try_from(record) {
                Ok(command) => break command,
                Err(error) => self.warn_invalid(&peer, &error.to_string()),
            }
        };

        match command {
            Command::Join { agent_id } => self.watch_control(agent_id, decoder),
            Command::NewWorker {
                agent_id,
                worker_id,
            } => self.accept_worker(agent_id, worker_id, decoder),
            Command::Leave { agent_id } => {
                let released = self.shared.registry.disconnect(&agent_id);
                self.shared.logger.log(
                    LogLevel::Info,
                    Some("master::protocol"),
                    "Agent left",
                    Some(json!({ "agent_id": agent_id, "peer": peer })),
                );
                let _ = decoder.get_ref().shutdown();
                if released {
                    self.publish_event(&agent_id, EventKind::Close);
                }
            }
            other => {
                self.shared.logger.log(
                    LogLevel::Warn,
                    Some("master::protocol"),
                    "Closing connection that opened without join",
                    Some(json!({ "peer": peer, "cmd": other.kind().as_str() })),
                );
                let _ = decoder.get_ref().shutdown();
            }
        }
    }

    fn watch_control(&self, agent_id: String, mut decoder: FrameDecoder<Conn>) {
        let handle = match decoder.get_ref().handle() {
            Ok(handle) => Arc::new(handle),
            Err(error) => {
                self.shared.logger.log(
                    LogLevel::Warn,
                    Some("master::protocol"),
                    "Cannot share control connection",
                    Some(json!({ "agent_id": agent_id, "error": error.to_string() })),
                );
                return;
            }
        };

        self.register(&agent_id, Arc::clone(&handle));

        let mut released = false;
        let outcome = loop {
            let record = match decoder.decode() {
                Ok(record) => record,
                Err(error) => break Some(error),
            };
            match Command::try_from(record) {
                Ok(Command::Heartbeat { .. }) => {
                    self.shared.registry.touch(&agent_id);
                    self.publish_event(&agent_id, EventKind::Heartbeat);
                }
                Ok(Command::Leave { .. }) => {
                    released = self.shared.registry.release_control(&agent_id, &handle);
                    self.shared.logger.log(
                        LogLevel::Info,
                        Some("master::protocol"),
                        "Agent left",
                        Some(json!({ "agent_id": agent_id })),
                    );
                    break None;
                }
                Ok(other) => self.warn_invalid(
                    &handle.peer_addr().to_string(),
                    &format!("unexpected '{}' on control connection", other.kind().as_str()),
                ),
                Err(error) => {
                    self.warn_invalid(&handle.peer_addr().to_string(), &error.to_string())
                }
            }
        };

        let _ = handle.shutdown();
        released |= self.shared.registry.release_control(&agent_id, &handle);
        if let Some(error) = outcome {
            self.log_decode_end(&handle.peer_addr().to_string(), Some(&agent_id), &error);
        }
        // A rejoin or close_agent that took the slot reports for itself.
        if released {
            self.publish_event(&agent_id, EventKind::Close);
        }
    }

    fn register(&self, agent_id: &str, handle: Arc<ConnHandle>) {
        let peer = handle.peer_addr().to_string();
        let outcome = self.shared.registry.register_join(agent_id, handle);
        let kind = if outcome.first_join {
            EventKind::Join
        } else {
            EventKind::Rejoin
        };

        self.shared.logger.log(
            LogLevel::Info,
            Some("master::registry"),
            if outcome.first_join {
                "Agent joined"
            } else {
                "Agent rejoined"
            },
            Some(json!({ "agent_id": agent_id, "peer": peer })),
        );
        self.publish_event(agent_id, kind);

        if outcome.recovered {
            self.shared.logger.log(
                LogLevel::Info,
                Some("master::registry"),
                "Agent recovered",
                Some(json!({ "agent_id": agent_id })),
            );
            self.publish_event(agent_id, EventKind::Recovery);
        }

        self.shared
            .callbacks
            .run_join(agent_id, outcome.first_join, &self.shared.logger);

        if let Some(stop) = outcome.liveness_stop {
            liveness::spawn_detector(agent_id.to_owned(), stop, Arc::downgrade(&self.shared));
        }
    }

    fn accept_worker(&self, agent_id: String, worker_id: String, decoder: FrameDecoder<Conn>) {
        let (mut conn, leftover) = decoder.into_parts();
        if agent_id.is_empty() {
            self.warn_invalid(
                &conn.peer_addr().to_string(),
                "worker connection without AgentID",
            );
            let _ = conn.shutdown();
            return;
        }
        conn.unread(leftover);

        let arrival = WorkerArrival::new(agent_id.clone(), worker_id.clone(), conn);
        if self.shared.workers.num_matching(&arrival) == 0 {
            self.shared.logger.log(
                LogLevel::Warn,
                Some("master::dial"),
                "Discarding worker connection nobody is waiting for",
                Some(json!({ "agent_id": agent_id, "worker_id": worker_id })),
            );
            arrival.discard();
            return;
        }

        self.shared.registry.touch(&agent_id);
        self.publish_event(&agent_id, EventKind::NewWorker);
        self.shared.workers.publish(arrival);
    }

    // Opens a logical connection into `agent_id` by asking it to dial back.
    pub fn dial(&self, agent_id: &str) -> Result<Conn, DialError> {
        let control = self.shared.registry.control(agent_id)?;
        let worker_id = Uuid::new_v4().to_string();

        let subscription = {
            let agent_id = agent_id.to_owned();
            let worker_id = worker_id.clone();
            self.shared
                .workers
                .subscribe_matching(move |arrival| arrival.matches(&agent_id, &worker_id))
        };

        self.shared.pending_dials.fetch_add(1, Ordering::SeqCst);
        let result = self.await_worker(agent_id, &worker_id, &control, &subscription);
        self.shared.workers.evict(&subscription);
        self.shared.pending_dials.fetch_sub(1, Ordering::SeqCst);

        // Anything that raced in after the timeout is closed here.
        while let Some(late) = subscription.try_recv() {
            late.discard();
        }
        result
    }

    fn await_worker(
        &self,
        agent_id: &str,
        worker_id: &str,
        control: &ConnHandle,
        subscription: &Subscription<WorkerArrival>,
    ) -> Result<Conn, DialError> {
        control
            .send(&Command::NewWorker {
                agent_id: agent_id.to_owned(),
                worker_id: worker_id.to_owned(),
            })
            .map_err(|source| DialError::Send {
                agent_id: agent_id.to_owned(),
                source,
            })?;

        let waited = self.shared.options.dial_timeout;
        match subscription.recv_timeout(waited) {
            Ok(arrival) => arrival.take().ok_or(DialError::Closed),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.logger.log(
                    LogLevel::Warn,
                    Some("master::dial"),
                    "Dial timed out",
                    Some(json!({
                        "agent_id": agent_id,
                        "worker_id": worker_id,
                        "timeout_ms": waited.as_millis() as u64,
                    })),
                );
                Err(DialError::Timeout {
                    agent_id: agent_id.to_owned(),
                    waited,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(DialError::Closed),
        }
    }

    // Drops the control connection; the registration stays, so a later join is a rejoin.
    pub fn close_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        let released = self.shared.registry.close(agent_id)?;
        self.shared.logger.log(
            LogLevel::Info,
            Some("master::registry"),
            "Agent closed",
            Some(json!({ "agent_id": agent_id })),
        );
        if released {
            self.publish_event(agent_id, EventKind::Close);
        }
        Ok(())
    }

    pub fn shutdown_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        if let Ok(control) = self.shared.registry.control(agent_id) {
            let sent = control.send(&Command::Shutdown {
                agent_id: agent_id.to_owned(),
            });
            if let Err(error) = sent {
                self.shared.logger.log(
                    LogLevel::Warn,
                    Some("master::registry"),
                    "Failed to deliver shutdown",
                    Some(json!({ "agent_id": agent_id, "error": error.to_string() })),
                );
            }
        }

        if let Some(control) = self.shared.registry.remove(agent_id)? {
            let _ = control.shutdown();
        }
        self.shared.logger.log(
            LogLevel::Warn,
            Some("master::registry"),
            "Agent shut down permanently",
            Some(json!({ "agent_id": agent_id })),
        );
        self.shared.callbacks.run_die(agent_id, &self.shared.logger);
        self.publish_event(agent_id, EventKind::Shutdown);
        Ok(())
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.shared.registry.snapshots(None)
    }

    pub fn healthy_agents(&self) -> Vec<AgentSnapshot> {
        self.shared.registry.snapshots(Some(true))
    }

    pub fn unhealthy_agents(&self) -> Vec<AgentSnapshot> {
        self.shared.registry.snapshots(Some(false))
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.shared.registry.snapshot(agent_id)
    }

    pub fn subscribe_events(
        &self,
        agent_id: &str,
    ) -> Result<Subscription<LifecycleEvent>, RegistryError> {
        if !self.shared.registry.contains(agent_id) {
            return Err(RegistryError::AgentNotFound {
                agent_id: agent_id.to_owned(),
            });
        }
        let agent_id = agent_id.to_owned();
        Ok(self
            .shared
            .events
            .subscribe_matching(move |event| event.agent_id == agent_id))
    }

    pub fn subscribe_all_events(&self) -> Subscription<LifecycleEvent> {
        self.shared.events.subscribe_all()
    }

    pub fn evict_events(&self, subscription: &Subscription<LifecycleEvent>) {
        self.shared.events.evict(subscription);
    }

    pub fn http_client(&self, agent_id: &str) -> AgentHttpClient {
        AgentHttpClient::new(self.clone(), agent_id)
    }

    pub fn status(&self) -> Value {
        let counts = self.shared.registry.counts();
        json!({
            "agents": counts,
            "pending_dials": self.shared.pending_dials.load(Ordering::SeqCst),
            "event_subscribers": self.shared.events.len(),
            "worker_subscribers": self.shared.workers.len(),
        })
    }

    fn publish_event(&self, agent_id: &str, kind: EventKind) {
        self.shared
            .events
            .publish(LifecycleEvent::now(agent_id, kind));
    }

    fn warn_invalid(&self, peer: &str, reason: &str) {
        self.shared.logger.log(
            LogLevel::Warn,
            Some("master::protocol"),
            "Skipping invalid command record",
            Some(json!({ "peer": peer, "reason": reason })),
        );
    }

    fn log_decode_end(&self, peer: &str, agent_id: Option<&str>, error: &CodecError) {
        let level = match error {
            CodecError::ConnectionClosed => LogLevel::Debug,
            CodecError::Io(source) if is_local_close(source) => LogLevel::Debug,
            _ => LogLevel::Warn,
        };
        self.shared.logger.log(
            level,
            Some("master::protocol"),
            "Connection ended",
            Some(json!({
                "peer": peer,
                "agent_id": agent_id,
                "error": error.to_string(),
            })),
        );
    }
}

fn is_local_close(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
    )
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("options", &self.shared.options)
            .field("agents", &self.shared.registry.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::logging::Logger;
    use crate::net::Conn;
    use crate::pubsub::Subscription;
    use crate::wire::{Command, CommandRecord, FrameDecoder, write_command};

    use super::{
        DialError, EventKind, LifecycleEvent, LivenessPolicy, Master, MasterOptions,
        RegistryError,
    };

    fn options() -> MasterOptions {
        MasterOptions {
            dial_timeout: Duration::from_secs(2),
            ..MasterOptions::default()
        }
    }

    fn front(master: &Master) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("front should bind");
        let addr = listener.local_addr().expect("addr should exist");
        let master = master.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                if let Ok(conn) = Conn::new(stream) {
                    master.accept_connection(conn);
                }
            }
        });
        addr
    }

    fn wait_for(
        events: &Subscription<LifecycleEvent>,
        agent_id: &str,
        kind: EventKind,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if event.agent_id == agent_id && event.kind == kind => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    struct FakeAgent {
        id: String,
        master: SocketAddr,
        control: TcpStream,
        decoder: FrameDecoder<TcpStream>,
    }

    impl FakeAgent {
        fn join(master: SocketAddr, id: &str) -> Self {
            let mut control = TcpStream::connect(master).expect("agent should connect");
            write_command(
                &mut control,
                &Command::Join {
                    agent_id: id.to_owned(),
                },
            )
            .expect("join should send");
            let decoder = FrameDecoder::new(control.try_clone().expect("clone should work"));
            Self {
                id: id.to_owned(),
                master,
                control,
                decoder,
            }
        }

        fn send(&mut self, command: &Command) {
            write_command(&mut self.control, command).expect("command should send");
        }

        fn heartbeat(&mut self) {
            let command = Command::Heartbeat {
                agent_id: self.id.clone(),
            };
            self.send(&command);
        }

        fn next_record(&mut self) -> CommandRecord {
            self.decoder.decode().expect("master command should decode")
        }

        fn open_worker(&self, worker_id: &str) -> TcpStream {
            let mut worker = TcpStream::connect(self.master).expect("worker should connect");
            write_command(
                &mut worker,
                &Command::NewWorker {
                    agent_id: self.id.clone(),
                    worker_id: worker_id.to_owned(),
                },
            )
            .expect("new-worker should send");
            worker
        }
    }

    #[test]
    fn join_registers_and_rejoin_replaces_control_connection() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);
        let events = master.subscribe_all_events();

        let mut first = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));
        let joined = master.agent("edge-1").expect("agent should be registered");
        assert!(joined.healthy && joined.connected);

        let _second = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Rejoin, Duration::from_secs(2)));
        assert!(first.decoder.decode().is_err());
        assert_eq!(master.agents().len(), 1);
        let rejoined = master.agent("edge-1").expect("agent should be registered");
        assert!(rejoined.last_active_at >= joined.last_active_at);
        assert!(rejoined.connected);
    }

    #[test]
    fn replaced_control_connection_does_not_report_close() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);
        let events = master.subscribe_all_events();

        let mut first = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));
        let _second = FakeAgent::join(addr, "edge-1");
        assert!(first.decoder.decode().is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_millis(300)) {
            seen.push(event.kind);
        }
        assert_eq!(seen, vec![EventKind::Rejoin]);
        assert!(master.agent("edge-1").expect("registered").connected);
    }

    #[test]
    fn connection_opening_without_join_is_closed() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);

        let mut stray = TcpStream::connect(addr).expect("stray peer should connect");
        write_command(
            &mut stray,
            &Command::Heartbeat {
                agent_id: "edge-1".to_owned(),
            },
        )
        .expect("heartbeat should send");
        stray
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");

        let mut buf = [0_u8; 1];
        assert_eq!(stray.read(&mut buf).expect("stray peer sees EOF"), 0);
        assert!(master.agents().is_empty());
    }

    #[test]
    fn dial_returns_the_announced_worker_connection() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        let dialer = {
            let master = master.clone();
            thread::spawn(move || master.dial("edge-1"))
        };

        let record = agent.next_record();
        assert_eq!(record.cmd, "new-worker");
        assert_eq!(record.agent_id, "edge-1");
        let mut worker = agent.open_worker(&record.worker_id);
        worker.write_all(b"hello").expect("worker write should work");

        let mut conn = dialer
            .join()
            .expect("dial thread should finish")
            .expect("dial should succeed");
        let mut received = [0_u8; 5];
        conn.read_exact(&mut received).expect("read should work");
        assert_eq!(&received, b"hello");

        conn.write_all(b"back").expect("write should work");
        let mut echoed = [0_u8; 4];
        worker.read_exact(&mut echoed).expect("read should work");
        assert_eq!(&echoed, b"back");
        assert_eq!(master.status()["pending_dials"], 0);
    }

    #[test]
    fn concurrent_dials_each_get_their_own_connection() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        let dialers: Vec<_> = (0..4)
            .map(|_| {
                let master = master.clone();
                thread::spawn(move || master.dial("edge-1"))
            })
            .collect();

        let mut worker_ids: Vec<String> = (0..4).map(|_| agent.next_record().worker_id).collect();
        worker_ids.reverse();
        let mut workers = Vec::new();
        for worker_id in &worker_ids {
            let mut worker = agent.open_worker(worker_id);
            worker
                .write_all(format!("{worker_id}\n").as_bytes())
                .expect("tag should send");
            workers.push(worker);
        }

        let mut seen = Vec::new();
        for dialer in dialers {
            let mut conn = dialer
                .join()
                .expect("dial thread should finish")
                .expect("dial should succeed");
            let mut tag = vec![0_u8; worker_ids[0].len() + 1];
            conn.read_exact(&mut tag).expect("tag should arrive");
            seen.push(String::from_utf8(tag).expect("tag is UTF-8").trim().to_owned());
        }
        seen.sort();
        worker_ids.sort();
        assert_eq!(seen, worker_ids);
    }

    #[test]
    fn stale_worker_connection_is_closed_after_dial_timeout() {
        let master = Master::builder(
            MasterOptions {
                dial_timeout: Duration::from_millis(100),
                ..MasterOptions::default()
            },
            Arc::new(Logger::discard()),
        )
        .build();
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        let error = master.dial("edge-1").expect_err("nobody answers in time");
        assert!(matches!(error, DialError::Timeout { .. }));

        let record = agent.next_record();
        let mut late = agent.open_worker(&record.worker_id);
        late.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");
        let mut buf = [0_u8; 1];
        assert_eq!(late.read(&mut buf).expect("stale worker sees EOF"), 0);
        assert_eq!(master.status()["worker_subscribers"], 0);
    }

    #[test]
    fn dial_reports_unknown_and_disconnected_agents() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        assert!(matches!(
            master.dial("ghost"),
            Err(DialError::AgentNotFound { .. })
        ));

        let addr = front(&master);
        let events = master.subscribe_all_events();
        let _agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));
        master.close_agent("edge-1").expect("close should work");

        assert!(matches!(
            master.dial("edge-1"),
            Err(DialError::AgentDisconnected { .. })
        ));
    }

    #[test]
    fn silent_agent_is_flagged_then_declared_dead_once() {
        let deaths = Arc::new(AtomicUsize::new(0));
        let master = {
            let deaths = Arc::clone(&deaths);
            Master::builder(
                MasterOptions {
                    liveness: LivenessPolicy {
                        heartbeat_interval: Duration::from_millis(40),
                        check_interval: Duration::from_millis(10),
                        flagging_multiplier: 3,
                        dead_multiplier: 5,
                    },
                    ..options()
                },
                Arc::new(Logger::discard()),
            )
            .on_die(move |_agent| {
                deaths.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
        };
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let _agent = FakeAgent::join(addr, "edge-1");

        assert!(wait_for(&events, "edge-1", EventKind::Flagging, Duration::from_secs(2)));
        assert!(master.agent("edge-1").expect("registered").healthy);
        assert!(wait_for(&events, "edge-1", EventKind::Die, Duration::from_secs(2)));
        assert!(!master.agent("edge-1").expect("still registered").healthy);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
        assert_eq!(master.unhealthy_agents().len(), 1);
    }

    #[test]
    fn steady_heartbeats_keep_agent_alive() {
        let master = Master::builder(
            MasterOptions {
                liveness: LivenessPolicy {
                    heartbeat_interval: Duration::from_millis(100),
                    check_interval: Duration::from_millis(20),
                    flagging_multiplier: 3,
                    dead_multiplier: 5,
                },
                ..options()
            },
            Arc::new(Logger::discard()),
        )
        .build();
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        for _ in 0..10 {
            thread::sleep(Duration::from_millis(80));
            agent.heartbeat();
        }

        assert!(master.agent("edge-1").expect("registered").healthy);
        assert_eq!(master.healthy_agents().len(), 1);
        while let Some(event) = events.try_recv() {
            assert!(!matches!(event.kind, EventKind::Flagging | EventKind::Die));
        }
    }

    #[test]
    fn rejoin_after_close_fires_recovery() {
        let joins = Arc::new(std::sync::Mutex::new(Vec::new()));
        let master = {
            let joins = Arc::clone(&joins);
            Master::builder(options(), Arc::new(Logger::discard()))
                .on_join(move |agent, first| {
                    joins.lock().expect("joins lock").push((agent.to_owned(), first));
                    Ok(())
                })
                .build()
        };
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let _agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        master.close_agent("edge-1").expect("close should work");
        assert!(wait_for(&events, "edge-1", EventKind::Close, Duration::from_secs(2)));
        assert!(!master.agent("edge-1").expect("kept").healthy);

        let _again = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Rejoin, Duration::from_secs(2)));
        assert!(wait_for(&events, "edge-1", EventKind::Recovery, Duration::from_secs(2)));
        assert!(eventually(Duration::from_secs(2), || {
            joins.lock().expect("joins lock").len() == 2
        }));
        assert_eq!(
            *joins.lock().expect("joins lock"),
            vec![("edge-1".to_owned(), true), ("edge-1".to_owned(), false)]
        );
    }

    #[test]
    fn shutdown_agent_sends_command_and_removes_registration() {
        let deaths = Arc::new(AtomicUsize::new(0));
        let master = {
            let deaths = Arc::clone(&deaths);
            Master::builder(options(), Arc::new(Logger::discard()))
                .on_die(move |_agent| {
                    deaths.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build()
        };
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));
        let scoped = master.subscribe_events("edge-1").expect("agent is registered");

        master.shutdown_agent("edge-1").expect("shutdown should work");

        let record = agent.next_record();
        assert_eq!(record.cmd, "shutdown");
        assert!(master.agent("edge-1").is_none());
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
        assert!(wait_for(&scoped, "edge-1", EventKind::Shutdown, Duration::from_secs(2)));
        master.evict_events(&scoped);
        assert!(matches!(
            master.subscribe_events("edge-1"),
            Err(RegistryError::AgentNotFound { .. })
        ));
        assert!(matches!(
            master.shutdown_agent("edge-1"),
            Err(RegistryError::AgentNotFound { .. })
        ));
    }

    #[test]
    fn leave_drops_control_but_keeps_registration() {
        let master = Master::builder(options(), Arc::new(Logger::discard())).build();
        let addr = front(&master);
        let events = master.subscribe_all_events();
        let mut agent = FakeAgent::join(addr, "edge-1");
        assert!(wait_for(&events, "edge-1", EventKind::Join, Duration::from_secs(2)));

        agent.send(&Command::Leave {
            agent_id: "edge-1".to_owned(),
        });

        assert!(wait_for(&events, "edge-1", EventKind::Close, Duration::from_secs(2)));
        let snapshot = master.agent("edge-1").expect("registration is kept");
        assert!(!snapshot.connected);
        assert!(agent.decoder.decode().is_err());
    }
}
