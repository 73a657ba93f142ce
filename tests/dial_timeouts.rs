#![cfg(target_os = "linux")]

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mole::logging::Logger;
use mole::master::{DialError, EventKind, Master, MasterOptions};
use mole::net::Conn;
use mole::wire::{Command, FrameDecoder, write_command};

const STALE_ROUNDS: usize = 25;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("fd table should be readable")
        .count()
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

fn answer_late(addr: SocketAddr, control: &mut FrameDecoder<TcpStream>) {
    let record = control.decode().expect("new-worker should arrive");
    assert_eq!(record.cmd, "new-worker");

    let mut worker = TcpStream::connect(addr).expect("worker should connect");
    write_command(
        &mut worker,
        &Command::NewWorker {
            agent_id: record.agent_id,
            worker_id: record.worker_id,
        },
    )
    .expect("new-worker should send");
    worker
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout should apply");
    let mut buf = [0_u8; 1];
    assert_eq!(worker.read(&mut buf).expect("stale worker sees EOF"), 0);
}

fn stale_dial(master: &Master, addr: SocketAddr, control: &mut FrameDecoder<TcpStream>) {
    let error = master.dial("edge-1").expect_err("nobody answers in time");
    assert!(matches!(error, DialError::Timeout { .. }));
    answer_late(addr, control);
}

#[test]
fn repeated_dial_timeouts_do_not_leak_connections() {
    let master = Master::builder(
        MasterOptions {
            dial_timeout: Duration::from_millis(50),
            ..MasterOptions::default()
        },
        Arc::new(Logger::discard()),
    )
    .build();
    let addr = front(&master);
    let events = master.subscribe_all_events();

    let mut agent = TcpStream::connect(addr).expect("agent should connect");
    write_command(
        &mut agent,
        &Command::Join {
            agent_id: "edge-1".to_owned(),
        },
    )
    .expect("join should send");
    let joined = events
        .recv_timeout(Duration::from_secs(2))
        .expect("join event should arrive");
    assert_eq!(joined.kind, EventKind::Join);
    let mut control = FrameDecoder::new(agent.try_clone().expect("clone should work"));

    stale_dial(&master, addr, &mut control);
    thread::sleep(Duration::from_millis(100));
    let before = open_fds();

    for _ in 0..STALE_ROUNDS {
        stale_dial(&master, addr, &mut control);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut after = open_fds();
    while after > before && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        after = open_fds();
    }
    assert!(after <= before, "fds grew from {before} to {after}");
    assert_eq!(master.status()["pending_dials"], 0);
    assert_eq!(master.status()["worker_subscribers"], 0);
    assert!(master.agent("edge-1").expect("registered").connected);
}
