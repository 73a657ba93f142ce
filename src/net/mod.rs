pub mod http_head;
mod listener;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

use crate::wire::codec::{CodecError, LivenessProbe, write_command};
use crate::wire::command::Command;

pub use listener::{ListenerError, VirtualListener};

pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_RETRIES: u32 = 3;
pub const DEFAULT_HANDLE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: DEFAULT_KEEPALIVE_IDLE,
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            retries: DEFAULT_KEEPALIVE_RETRIES,
        }
    }
}

pub fn configure_keepalive(stream: &TcpStream, config: KeepaliveConfig) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(config.retries);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

pub fn dial(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for candidate in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address '{address}' did not resolve"),
        )
    }))
}

// TCP stream whose replay buffer (sniffed or over-read bytes) is served before the socket.
pub struct Conn {
    stream: TcpStream,
    replay: Vec<u8>,
    replay_pos: usize,
    peer_addr: SocketAddr,
}

impl Conn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Self::with_replay(stream, Vec::new())
    }

    pub fn with_replay(stream: TcpStream, replay: Vec<u8>) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            replay,
            replay_pos: 0,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn replay_remaining(&self) -> usize {
        self.replay.len() - self.replay_pos
    }

    pub fn unread(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut replay = bytes;
        replay.extend_from_slice(&self.replay[self.replay_pos..]);
        self.replay = replay;
        self.replay_pos = 0;
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn handle(&self) -> io::Result<ConnHandle> {
        self.handle_with_write_timeout(DEFAULT_HANDLE_WRITE_TIMEOUT)
    }

    pub fn handle_with_write_timeout(&self, timeout: Duration) -> io::Result<ConnHandle> {
        let writer = self.stream.try_clone()?;
        writer.set_write_timeout(Some(timeout))?;
        Ok(ConnHandle {
            peer_addr: self.peer_addr,
            writer: Mutex::new(writer),
            closer: self.stream.try_clone()?,
        })
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.replay_pos < self.replay.len() {
            let available = &self.replay[self.replay_pos..];
            let take = available.len().min(buf.len());
            buf[..take].copy_from_slice(&available[..take]);
            self.replay_pos += take;
            if self.replay_pos == self.replay.len() {
                self.replay.clear();
                self.replay_pos = 0;
            }
            return Ok(take);
        }
        self.stream.read(buf)
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl LivenessProbe for Conn {
    fn probe_alive(&self) -> io::Result<()> {
        if self.replay_remaining() > 0 {
            return Ok(());
        }
        self.stream.probe_alive()
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("peer_addr", &self.peer_addr)
            .field("replay_remaining", &self.replay_remaining())
            .finish()
    }
}

// Shared writer; shutting it down is how other threads end the owning decode loop.
pub struct ConnHandle {
    peer_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    // Shutdown must not wait behind a writer stuck on a full send buffer.
    closer: TcpStream,
}

impl ConnHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send(&self, command: &Command) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        write_command(&mut *writer, command)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.closer.shutdown(Shutdown::Both)
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    let addr = listener.local_addr().expect("local addr should exist");
    let client = TcpStream::connect(addr).expect("client should connect");
    let (server, _) = listener.accept().expect("accept should work");
    (client, server)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::wire::codec::FrameDecoder;
    use crate::wire::command::Command;

    use super::{Conn, KeepaliveConfig, configure_keepalive, dial, tcp_pair};

    fn fill_until_error(handle: &super::ConnHandle) -> bool {
        let heartbeat = Command::Heartbeat {
            agent_id: "edge-1".to_owned(),
        };
        (0..2_000_000).any(|_| handle.send(&heartbeat).is_err())
    }

    #[test]
    fn replay_bytes_are_served_before_socket_bytes() {
        let (mut client, server) = tcp_pair();
        client.write_all(b"LO WORLD").expect("client write should work");
        drop(client);

        let mut conn = Conn::with_replay(server, b"HEL".to_vec()).expect("conn should wrap");
        let mut received = String::new();
        conn.read_to_string(&mut received).expect("read should work");

        assert_eq!(received, "HELLO WORLD");
    }

    #[test]
    fn unread_prepends_to_remaining_replay() {
        let (client, server) = tcp_pair();
        drop(client);

        let mut conn = Conn::with_replay(server, b"cdef".to_vec()).expect("conn should wrap");
        let mut first = [0_u8; 2];
        conn.read_exact(&mut first).expect("replay read should work");
        conn.unread(b"ab".to_vec());

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).expect("read should work");
        assert_eq!(&first, b"cd");
        assert_eq!(rest, b"abef");
    }

    #[test]
    fn handle_writes_commands_and_shutdown_ends_reader() {
        let (client, server) = tcp_pair();
        let conn = Conn::new(server).expect("conn should wrap");
        let handle = conn.handle().expect("handle should clone stream");

        handle
            .send(&Command::Heartbeat {
                agent_id: "edge-1".to_owned(),
            })
            .expect("heartbeat should send");

        let mut decoder = FrameDecoder::new(client);
        let record = decoder.decode().expect("heartbeat should decode");
        assert_eq!(record.cmd, "heartbeat");

        handle.shutdown().expect("shutdown should work");
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn send_to_stalled_peer_fails_within_write_timeout() {
        let (_stalled_peer, server) = tcp_pair();
        let conn = Conn::new(server).expect("conn should wrap");
        let handle = conn
            .handle_with_write_timeout(Duration::from_millis(200))
            .expect("handle should clone stream");

        let started = Instant::now();
        assert!(fill_until_error(&handle));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn shutdown_does_not_wait_for_blocked_writer() {
        let (_stalled_peer, server) = tcp_pair();
        let conn = Conn::new(server).expect("conn should wrap");
        let handle = Arc::new(
            conn.handle_with_write_timeout(Duration::from_secs(30))
                .expect("handle should clone stream"),
        );
        let writer = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || fill_until_error(&handle))
        };

        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        handle.shutdown().expect("shutdown should work");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(writer.join().expect("writer thread should finish"));
    }

    #[test]
    fn keepalive_can_be_configured_on_loopback() {
        let (client, _server) = tcp_pair();
        configure_keepalive(&client, KeepaliveConfig::default()).expect("keepalive should apply");
    }

    #[test]
    fn dial_reports_refused_connections() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should exist");
        drop(listener);

        let error = dial(&addr.to_string(), Duration::from_millis(500))
            .expect_err("nothing listens on a dropped port");
        assert!(!error.to_string().is_empty());
    }
}
