use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::net::ConnHandle;
use crate::wire::Command;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval,
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval => write!(f, "heartbeat interval must be greater than zero"),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::JoinFailed => write!(f, "heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

pub struct HeartbeatSender {
    pub started_at: DateTime<Utc>,
    agent_id: String,
    interval: Duration,
    conn: Arc<ConnHandle>,
    logger: Arc<Logger>,
    stop_signal: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl HeartbeatSender {
    pub fn new(
        agent_id: impl Into<String>,
        interval: Duration,
        conn: Arc<ConnHandle>,
        logger: Arc<Logger>,
    ) -> Result<Self, HeartbeatError> {
        if interval.is_zero() {
            return Err(HeartbeatError::InvalidInterval);
        }

        Ok(Self {
            started_at: Utc::now(),
            agent_id: agent_id.into(),
            interval,
            conn,
            logger,
            stop_signal: None,
            worker: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let command = Command::Heartbeat {
            agent_id: self.agent_id.clone(),
        };
        let conn = Arc::clone(&self.conn);
        let logger = Arc::clone(&self.logger);
        let interval = self.interval;

        self.started_at = Utc::now();
        self.stop_signal = Some(stop_tx);
        self.worker = Some(thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                if let Err(error) = conn.send(&command) {
                    logger.log(
                        LogLevel::Warn,
                        Some("agent::heartbeat"),
                        "heartbeat send failed; closing control connection",
                        Some(json!({
                            "agent_id": command.agent_id(),
                            "error": error.to_string(),
                        })),
                    );
                    let _ = conn.shutdown();
                    break;
                }
                logger.verbose(Some("agent::heartbeat"), "heartbeat sent");
            }
        }));

        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.take();

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.stop_signal.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::logging::Logger;
    use crate::net::{Conn, tcp_pair};
    use crate::wire::{Command, FrameDecoder};

    use super::{HeartbeatError, HeartbeatSender};

    #[test]
    fn rejects_zero_interval() {
        let (_client, server) = tcp_pair();
        let handle = Conn::new(server)
            .and_then(|conn| conn.handle())
            .expect("handle should build");

        let result = HeartbeatSender::new(
            "edge-1",
            Duration::ZERO,
            Arc::new(handle),
            Arc::new(Logger::discard()),
        );
        assert!(matches!(result, Err(HeartbeatError::InvalidInterval)));
    }

    #[test]
    fn sends_heartbeats_until_stopped() {
        let (client, server) = tcp_pair();
        let handle = Conn::new(server)
            .and_then(|conn| conn.handle())
            .expect("handle should build");

        let mut heartbeat = HeartbeatSender::new(
            "edge-1",
            Duration::from_millis(40),
            Arc::new(handle),
            Arc::new(Logger::discard()),
        )
        .expect("heartbeat should be created");
        heartbeat.start().expect("heartbeat should start");
        assert!(matches!(heartbeat.start(), Err(HeartbeatError::AlreadyRunning)));

        let mut decoder = FrameDecoder::new(client);
        for _ in 0..2 {
            let record = decoder.decode().expect("heartbeat should decode");
            assert_eq!(record.cmd, "heartbeat");
            assert_eq!(record.agent_id, "edge-1");
        }

        let started = Instant::now();
        heartbeat.stop().expect("heartbeat should stop");
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!heartbeat.is_running());
    }

    #[test]
    fn stops_promptly_once_stalled_connection_is_shut_down() {
        let (_stalled_peer, server) = tcp_pair();
        let handle = Arc::new(
            Conn::new(server)
                .and_then(|conn| conn.handle_with_write_timeout(Duration::from_secs(30)))
                .expect("handle should build"),
        );
        let filler = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let command = Command::Heartbeat {
                    agent_id: "edge-1".to_owned(),
                };
                while handle.send(&command).is_ok() {}
            })
        };

        let mut heartbeat = HeartbeatSender::new(
            "edge-1",
            Duration::from_millis(5),
            Arc::clone(&handle),
            Arc::new(Logger::discard()),
        )
        .expect("heartbeat should be created");
        heartbeat.start().expect("heartbeat should start");
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        handle.shutdown().expect("shutdown should work");
        heartbeat.stop().expect("heartbeat should stop");
        assert!(started.elapsed() < Duration::from_secs(2));
        filler.join().expect("filler thread should finish");
    }
}
