use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::config::MasterConfig;
use crate::logging::{LogLevel, Logger};
use crate::net::{Conn, KeepaliveConfig, VirtualListener, configure_keepalive};
use crate::wire::MAGIC;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);
pub const NOT_SERVING_MESSAGE: &[u8] = b"protocol not serving by tcpmuxer";
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

const SNIFF_LEN: usize = 4;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Cluster,
    Http,
    Tls,
}

impl Protocol {
    pub const ALL: [Self; 3] = [Self::Cluster, Self::Http, Self::Tls];

    pub fn classify(head: &[u8]) -> Self {
        if head.len() >= SNIFF_LEN && head[..SNIFF_LEN] == MAGIC {
            Self::Cluster
        } else if head.first() == Some(&TLS_HANDSHAKE_BYTE) {
            Self::Tls
        } else {
            Self::Http
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Http => "http",
            Self::Tls => "tls",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Cluster => 0,
            Self::Http => 1,
            Self::Tls => 2,
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxerConfig {
    pub host: String,
    pub port: u16,
    pub serve_cluster: bool,
    pub serve_http: bool,
    pub serve_tls: bool,
    pub channel_capacity: usize,
    pub sniff_timeout: Duration,
    pub keepalive: KeepaliveConfig,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 7070,
            serve_cluster: true,
            serve_http: false,
            serve_tls: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl From<&MasterConfig> for MuxerConfig {
    fn from(value: &MasterConfig) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port,
            serve_cluster: value.serve_cluster,
            serve_http: value.serve_http,
            serve_tls: value.serve_tls,
            channel_capacity: value.channel_capacity,
            sniff_timeout: Duration::from_millis(value.sniff_timeout_ms),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum MuxerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Accept { source: io::Error },
}

impl fmt::Display for MuxerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP multiplexer on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP multiplexer to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "TCP multiplexer accept failed: {source}"),
        }
    }
}

impl std::error::Error for MuxerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::SetNonBlocking { source }
            | Self::Accept { source } => Some(source),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub routed: u64,
    pub rejected: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MuxerStats {
    pub cluster: ChannelStats,
    pub http: ChannelStats,
    pub tls: ChannelStats,
    pub dropped_before_sniff: u64,
}

impl MuxerStats {
    pub fn channel(&self, protocol: Protocol) -> ChannelStats {
        match protocol {
            Protocol::Cluster => self.cluster,
            Protocol::Http => self.http,
            Protocol::Tls => self.tls,
        }
    }
}

struct Channel {
    listener: Arc<VirtualListener<Conn>>,
    routed: AtomicU64,
    rejected: AtomicU64,
}

struct MuxerShared {
    channels: [Channel; 3],
    serving: AtomicU8,
    closed: AtomicBool,
    dropped_before_sniff: AtomicU64,
    sniff_timeout: Duration,
    keepalive: KeepaliveConfig,
    logger: Arc<Logger>,
}

pub struct TcpMuxer {
    listener: TcpListener,
    shared: Arc<MuxerShared>,
}

impl TcpMuxer {
    pub fn bind(config: &MuxerConfig, logger: Arc<Logger>) -> Result<Self, MuxerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| MuxerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| MuxerError::SetNonBlocking { source })?;

        let channel = |protocol: Protocol| Channel {
            listener: Arc::new(VirtualListener::new(
                protocol.as_str(),
                config.channel_capacity,
            )),
            routed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        };

        let mut serving = 0;
        for (protocol, enabled) in [
            (Protocol::Cluster, config.serve_cluster),
            (Protocol::Http, config.serve_http),
            (Protocol::Tls, config.serve_tls),
        ] {
            if enabled {
                serving |= protocol.bit();
            }
        }

        Ok(Self {
            listener,
            shared: Arc::new(MuxerShared {
                channels: [
                    channel(Protocol::Cluster),
                    channel(Protocol::Http),
                    channel(Protocol::Tls),
                ],
                serving: AtomicU8::new(serving),
                closed: AtomicBool::new(false),
                dropped_before_sniff: AtomicU64::new(0),
                sniff_timeout: config.sniff_timeout,
                keepalive: config.keepalive,
                logger,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listener(&self, protocol: Protocol) -> Arc<VirtualListener<Conn>> {
        Arc::clone(&self.shared.channels[protocol.index()].listener)
    }

    pub fn set_serving(&self, protocol: Protocol, serving: bool) {
        if serving {
            self.shared.serving.fetch_or(protocol.bit(), Ordering::SeqCst);
        } else {
            self.shared
                .serving
                .fetch_and(!protocol.bit(), Ordering::SeqCst);
        }
    }

    pub fn is_serving(&self, protocol: Protocol) -> bool {
        self.shared.is_serving(protocol)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn serve(&self) -> Result<(), MuxerError> {
        self.shared.logger.log(
            LogLevel::Info,
            Some("muxer"),
            "TCP multiplexer serving",
            Some(json!({
                "address": self.local_addr().map(|addr| addr.to_string()).unwrap_or_default(),
                "serving": Protocol::ALL
                    .iter()
                    .filter(|protocol| self.is_serving(**protocol))
                    .map(|protocol| protocol.as_str())
                    .collect::<Vec<_>>(),
            })),
        );

        while !self.is_closed() {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let shared = Arc::clone(&self.shared);
                    thread::spawn(move || shared.route(stream, peer_addr));
                }
                Err(source) if source.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(MuxerError::Accept { source }),
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in &self.shared.channels {
            channel.listener.close();
        }
        self.shared
            .logger
            .info(Some("muxer"), "TCP multiplexer closed");
    }

    pub fn stats(&self) -> MuxerStats {
        let channel = |protocol: Protocol| {
            let channel = &self.shared.channels[protocol.index()];
            ChannelStats {
                routed: channel.routed.load(Ordering::Relaxed),
                rejected: channel.rejected.load(Ordering::Relaxed),
            }
        };
        MuxerStats {
            cluster: channel(Protocol::Cluster),
            http: channel(Protocol::Http),
            tls: channel(Protocol::Tls),
            dropped_before_sniff: self.shared.dropped_before_sniff.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for TcpMuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpMuxer")
            .field("local_addr", &self.local_addr().ok())
            .field("serving", &self.shared.serving.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxerShared {
    fn is_serving(&self, protocol: Protocol) -> bool {
        self.serving.load(Ordering::SeqCst) & protocol.bit() != 0
    }

    fn route(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let peer = peer_addr.to_string();
        // Accepted sockets inherit non-blocking mode on some platforms.
        if let Err(error) = stream.set_nonblocking(false) {
            self.drop_unsniffed(&stream, &peer, &error.to_string());
            return;
        }
        let _ = stream.set_nodelay(true);
        if let Err(error) = configure_keepalive(&stream, self.keepalive) {
            self.logger.log(
                LogLevel::Debug,
                Some("muxer"),
                "Failed to configure TCP keepalive",
                Some(json!({ "peer": peer, "error": error.to_string() })),
            );
        }

        let head = match sniff(&mut stream, self.sniff_timeout) {
            Ok(head) if !head.is_empty() => head,
            Ok(_) => {
                self.drop_unsniffed(&stream, &peer, "closed before sending any bytes");
                return;
            }
            Err(error) => {
                self.drop_unsniffed(&stream, &peer, &error.to_string());
                return;
            }
        };

        let protocol = Protocol::classify(&head);
        let channel = &self.channels[protocol.index()];

        if !self.is_serving(protocol) {
            channel.rejected.fetch_add(1, Ordering::Relaxed);
            let _ = stream.write_all(NOT_SERVING_MESSAGE);
            let _ = stream.shutdown(Shutdown::Both);
            self.logger.log(
                LogLevel::Debug,
                Some("muxer"),
                "Rejected connection for unserved protocol",
                Some(json!({ "peer": peer, "protocol": protocol.as_str() })),
            );
            return;
        }

        let conn = match Conn::with_replay(stream, head) {
            Ok(conn) => conn,
            Err(error) => {
                channel.rejected.fetch_add(1, Ordering::Relaxed);
                self.logger.log(
                    LogLevel::Debug,
                    Some("muxer"),
                    "Connection vanished before routing",
                    Some(json!({ "peer": peer, "error": error.to_string() })),
                );
                return;
            }
        };

        // A closed channel drops the connection, which closes the socket.
        match channel.listener.push(conn) {
            Ok(()) => {
                channel.routed.fetch_add(1, Ordering::Relaxed);
                self.logger.log(
                    LogLevel::Verbose,
                    Some("muxer"),
                    "Routed connection",
                    Some(json!({ "peer": peer, "protocol": protocol.as_str() })),
                );
            }
            Err(error) => {
                channel.rejected.fetch_add(1, Ordering::Relaxed);
                self.logger.log(
                    LogLevel::Debug,
                    Some("muxer"),
                    "Dropped connection for closed channel",
                    Some(json!({ "peer": peer, "error": error.to_string() })),
                );
            }
        }
    }

    fn drop_unsniffed(&self, stream: &TcpStream, peer: &str, reason: &str) {
        let _ = stream.shutdown(Shutdown::Both);
        self.dropped_before_sniff.fetch_add(1, Ordering::Relaxed);
        self.logger.log(
            LogLevel::Debug,
            Some("muxer"),
            "Dropped connection before classification",
            Some(json!({ "peer": peer, "reason": reason })),
        );
    }
}

// Reads up to four bytes; stops early on EOF or once `timeout` elapses.
fn sniff(stream: &mut TcpStream, timeout: Duration) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(timeout))?;
    let mut head = [0_u8; SNIFF_LEN];
    let mut filled = 0;

    while filled < SNIFF_LEN {
        match stream.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                break;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }

    stream.set_read_timeout(None)?;
    Ok(head[..filled].to_vec())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use crate::config::{AppConfig, DEFAULT_CONFIG_TOML};
    use crate::logging::Logger;
    use crate::wire::codec::FrameDecoder;
    use crate::wire::command::Command;
    use crate::wire::encode_command;

    use super::{
        MuxerConfig, NOT_SERVING_MESSAGE, Protocol, TLS_HANDSHAKE_BYTE, TcpMuxer,
    };

    fn test_config() -> MuxerConfig {
        MuxerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            serve_cluster: true,
            serve_http: true,
            serve_tls: false,
            channel_capacity: 8,
            sniff_timeout: Duration::from_millis(100),
            ..MuxerConfig::default()
        }
    }

    fn start(config: MuxerConfig) -> (Arc<TcpMuxer>, SocketAddr, JoinHandle<()>) {
        let muxer = Arc::new(
            TcpMuxer::bind(&config, Arc::new(Logger::discard())).expect("muxer should bind"),
        );
        let addr = muxer.local_addr().expect("local addr should exist");
        let worker = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.serve().expect("accept loop should not fail"))
        };
        (muxer, addr, worker)
    }

    fn eventually(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn stop(muxer: &TcpMuxer, worker: JoinHandle<()>) {
        muxer.close();
        worker.join().expect("accept loop should exit");
    }

    #[test]
    fn classifies_on_first_bytes() {
        assert_eq!(Protocol::classify(b"MOLE\x00\x00\x00\x10"), Protocol::Cluster);
        assert_eq!(Protocol::classify(&[TLS_HANDSHAKE_BYTE, 3, 1, 0]), Protocol::Tls);
        assert_eq!(Protocol::classify(b"GET "), Protocol::Http);
        assert_eq!(Protocol::classify(b"MOL"), Protocol::Http);
        assert_eq!(Protocol::classify(b"MOLD"), Protocol::Http);
        assert_eq!(Protocol::classify(&[TLS_HANDSHAKE_BYTE]), Protocol::Tls);
    }

    #[test]
    fn config_follows_master_section() {
        let app = AppConfig::load_from_str_with_args(DEFAULT_CONFIG_TOML, "<test>", Vec::new())
            .expect("defaults should parse");
        let config = MuxerConfig::from(&app.master);

        assert_eq!(config.port, 7070);
        assert!(config.serve_cluster);
        assert!(!config.serve_tls);
        assert_eq!(config.channel_capacity, 128);
        assert_eq!(config.sniff_timeout, Duration::from_secs(10));
    }

    #[test]
    fn cluster_connection_keeps_sniffed_bytes() {
        let (muxer, addr, worker) = start(test_config());
        let frame = encode_command(&Command::Join {
            agent_id: "edge-1".to_owned(),
        })
        .expect("join should encode");

        let mut client = TcpStream::connect(addr).expect("client should connect");
        client.write_all(&frame).expect("frame should send");

        let conn = muxer
            .listener(Protocol::Cluster)
            .accept_timeout(Duration::from_secs(2))
            .expect("cluster channel should receive the connection");
        let mut decoder = FrameDecoder::new(conn);
        let record = decoder.decode().expect("frame should decode intact");
        assert_eq!(record.cmd, "join");
        assert_eq!(record.agent_id, "edge-1");
        assert!(eventually(|| muxer.stats().cluster.routed == 1));

        stop(&muxer, worker);
    }

    #[test]
    fn short_http_request_is_routed_after_sniff_timeout() {
        let (muxer, addr, worker) = start(test_config());

        let mut client = TcpStream::connect(addr).expect("client should connect");
        client.write_all(b"G").expect("first byte should send");

        let mut conn = muxer
            .listener(Protocol::Http)
            .accept_timeout(Duration::from_secs(2))
            .expect("http channel should receive the connection");
        client.write_all(b"ET / HTTP/1.1\r\n").expect("rest should send");
        drop(client);

        let mut request = String::new();
        conn.read_to_string(&mut request).expect("request should read");
        assert_eq!(request, "GET / HTTP/1.1\r\n");

        stop(&muxer, worker);
    }

    #[test]
    fn unserved_protocol_gets_error_and_close() {
        let (muxer, addr, worker) = start(test_config());

        let mut client = TcpStream::connect(addr).expect("client should connect");
        client
            .write_all(&[TLS_HANDSHAKE_BYTE, 3, 1, 0])
            .expect("client hello should send");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout should apply");

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).expect("reply should read until close");
        assert_eq!(reply, NOT_SERVING_MESSAGE);
        assert_eq!(muxer.stats().tls.rejected, 1);
        assert_eq!(muxer.listener(Protocol::Tls).queued(), 0);

        stop(&muxer, worker);
    }

    #[test]
    fn serving_flags_can_change_at_runtime() {
        let (muxer, addr, worker) = start(test_config());
        muxer.set_serving(Protocol::Tls, true);
        muxer.set_serving(Protocol::Http, false);
        assert!(muxer.is_serving(Protocol::Tls));
        assert!(!muxer.is_serving(Protocol::Http));

        let mut client = TcpStream::connect(addr).expect("client should connect");
        client
            .write_all(&[TLS_HANDSHAKE_BYTE, 3, 3, 0])
            .expect("client hello should send");
        let mut conn = muxer
            .listener(Protocol::Tls)
            .accept_timeout(Duration::from_secs(2))
            .expect("tls channel should receive the connection");
        let mut head = [0_u8; 4];
        conn.read_exact(&mut head).expect("sniffed bytes should replay");
        assert_eq!(head, [TLS_HANDSHAKE_BYTE, 3, 3, 0]);

        stop(&muxer, worker);
    }

    #[test]
    fn silent_connection_is_dropped_without_routing() {
        let (muxer, addr, worker) = start(test_config());

        let client = TcpStream::connect(addr).expect("client should connect");
        drop(client);

        assert!(eventually(|| muxer.stats().dropped_before_sniff == 1));
        assert_eq!(muxer.stats().http.routed, 0);

        stop(&muxer, worker);
    }

    #[test]
    fn close_stops_accept_loop_and_channels() {
        let (muxer, _addr, worker) = start(test_config());
        let cluster = muxer.listener(Protocol::Cluster);
        let waiter = thread::spawn(move || cluster.accept());

        thread::sleep(Duration::from_millis(30));
        stop(&muxer, worker);

        assert!(waiter.join().expect("accept thread should finish").is_err());
        assert!(muxer.is_closed());
    }
}
