//! Multi-reactor handoff: acceptor, workers, and ring saturation.

use squall::framing::{read_frame, write_frame};
use squall::reactor::multi::BUSY_SENTINEL;
use squall::{Acceptor, MultiConfig, MultiReactor, Reflect, RingBuffer, TcpPeer};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

#[test]
fn workers_echo_handed_off_connections() {
    let cfg = MultiConfig {
        workers: 2,
        ring_capacity: 64,
        ..Default::default()
    };
    let peer = TcpPeer::listen("127.0.0.1", 0, &cfg.reactor).unwrap();
    let multi = MultiReactor::new(peer, Reflect, cfg).unwrap();
    let addr = multi.local_addr().unwrap();
    let stop = multi.stop_handle();
    let handle = thread::spawn(move || multi.run());

    for i in 0..32u32 {
        let payload = format!("multi-{i}").into_bytes();
        let mut stream = client(addr);
        write_frame(&mut stream, &payload).unwrap();
        assert_eq!(read_frame(&mut stream).unwrap(), payload);
    }

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn saturated_ring_refuses_with_busy_sentinel() {
    // An acceptor with no worker draining the ring: capacity 4, so the
    // fifth connection must be refused.
    let cfg = MultiConfig {
        workers: 1,
        ring_capacity: 4,
        handoff_retries: 2,
        ..Default::default()
    };
    let ring = Arc::new(RingBuffer::new(cfg.ring_capacity));
    let peer = TcpPeer::listen("127.0.0.1", 0, &cfg.reactor).unwrap();
    let mut acceptor = Acceptor::new(peer, Arc::clone(&ring), &cfg).unwrap();
    let addr = acceptor.local_addr().unwrap();
    let stop = acceptor.stop_handle();
    let handle = thread::spawn(move || acceptor.run());

    let mut queued: Vec<TcpStream> = Vec::new();
    for _ in 0..4 {
        queued.push(client(addr));
        thread::sleep(Duration::from_millis(30));
    }

    // Fifth in: the ring is full, the acceptor answers busy and closes.
    let mut fifth = client(addr);
    let refusal = read_frame(&mut fifth).unwrap();
    assert_eq!(refusal, BUSY_SENTINEL);
    let mut rest = Vec::new();
    assert_eq!(fifth.read_to_end(&mut rest).unwrap_or(0), 0);

    // "Worker resumes": drain the four queued links, then the next
    // batch is accepted again.
    let mut drained = 0;
    while ring.try_take().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 4);

    let mut next_batch: Vec<TcpStream> = Vec::new();
    for _ in 0..4 {
        next_batch.push(client(addr));
        thread::sleep(Duration::from_millis(30));
    }
    let mut queued_again = 0;
    while ring.try_take().is_some() {
        queued_again += 1;
    }
    assert_eq!(queued_again, 4);

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn multi_reactor_stops_promptly() {
    let cfg = MultiConfig {
        workers: 3,
        ring_capacity: 16,
        ..Default::default()
    };
    let peer = TcpPeer::listen("127.0.0.1", 0, &cfg.reactor).unwrap();
    let multi = MultiReactor::new(peer, Reflect, cfg).unwrap();
    let stop = multi.stop_handle();
    let handle = thread::spawn(move || multi.run());

    thread::sleep(Duration::from_millis(50));
    stop.stop();
    handle.join().unwrap().unwrap();
}
