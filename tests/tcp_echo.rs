//! End-to-end scenarios for the readiness reactor over plain TCP.

use squall::framing::{read_frame, write_frame};
use squall::{Reactor, ReactorConfig, Reflect, StopHandle, TcpPeer};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn start_echo_server(cfg: ReactorConfig) -> (StopHandle, SocketAddr, JoinHandle<squall::Result<()>>) {
    let peer = TcpPeer::listen("127.0.0.1", 0, &cfg).unwrap();
    let mut reactor = Reactor::serve(peer, Reflect, cfg).unwrap();
    let addr = reactor.local_addr().unwrap();
    let stop = reactor.stop_handle();
    let handle = thread::spawn(move || reactor.run());
    (stop, addr, handle)
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

#[test]
fn echoes_one_framed_message() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let mut stream = client(addr);
    write_frame(&mut stream, b"hello").unwrap();
    let payload = read_frame(&mut stream).unwrap();
    assert_eq!(payload, b"hello");

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn echoes_zero_length_frame() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let mut stream = client(addr);
    write_frame(&mut stream, b"").unwrap();
    // The four header bytes come back verbatim.
    let payload = read_frame(&mut stream).unwrap();
    assert!(payload.is_empty());

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn back_pressure_large_payload_in_small_writes() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let mut writer = client(addr);
    let mut reader = writer.try_clone().unwrap();

    let expected = payload.clone();
    let consumer = thread::spawn(move || {
        let echoed = read_frame(&mut reader).unwrap();
        assert_eq!(echoed.len(), expected.len());
        assert_eq!(echoed, expected);
    });

    // Length prefix, then the body dribbled out in uneven chunks.
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .unwrap();
    for (i, chunk) in payload.chunks(7919).enumerate() {
        writer.write_all(chunk).unwrap();
        if i % 16 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    writer.flush().unwrap();

    consumer.join().unwrap();
    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn many_connections_no_cross_talk() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    for i in 0..1024u32 {
        let mut payload = vec![0u8; 64];
        payload[..4].copy_from_slice(&i.to_le_bytes());
        payload[4..].fill((i % 255) as u8);

        let mut stream = client(addr);
        write_frame(&mut stream, &payload).unwrap();
        let echoed = read_frame(&mut stream).unwrap();
        assert_eq!(echoed, payload, "connection {i} got someone else's bytes");
    }

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn multiple_frames_on_one_connection() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let mut stream = client(addr);
    for i in 0..50u32 {
        let payload = format!("message-{i}").into_bytes();
        write_frame(&mut stream, &payload).unwrap();
        assert_eq!(read_frame(&mut stream).unwrap(), payload);
    }

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn crate_connect_helper_round_trips() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let mut stream =
        squall::peer::tcp::connect("127.0.0.1", addr.port(), Duration::from_secs(5)).unwrap();
    write_frame(&mut stream, b"via crate connect").unwrap();
    assert_eq!(read_frame(&mut stream).unwrap(), b"via crate connect");

    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn stop_mid_transfer_closes_cleanly() {
    let (stop, addr, handle) = start_echo_server(ReactorConfig::default());

    let payload = vec![0xabu8; 1024 * 1024];
    let mut stream = client(addr);
    write_frame(&mut stream, &payload).unwrap();

    // Take a sip of the echo, then pull the plug.
    let mut first = [0u8; 4096];
    stream.read_exact(&mut first).unwrap();
    stop.stop();
    handle.join().unwrap().unwrap();

    // The server is gone; the client observes close, not a hang.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.len() < payload.len());
}

#[test]
fn stop_returns_within_one_wait() {
    let (stop, _addr, handle) = start_echo_server(ReactorConfig::default());
    thread::sleep(Duration::from_millis(20));
    stop.stop();
    handle.join().unwrap().unwrap();
}

#[test]
fn pool_exhaustion_sheds_connections_without_crashing() {
    let cfg = ReactorConfig {
        event_pool: 2,
        ..Default::default()
    };
    let (stop, addr, handle) = start_echo_server(cfg);

    let mut a = client(addr);
    let mut b = client(addr);
    write_frame(&mut a, b"a").unwrap();
    write_frame(&mut b, b"b").unwrap();
    assert_eq!(read_frame(&mut a).unwrap(), b"a");
    assert_eq!(read_frame(&mut b).unwrap(), b"b");

    // Third connection finds the pool dry and is dropped.
    let mut c = client(addr);
    let mut buf = Vec::new();
    let n = c.read_to_end(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    // The first two still work.
    write_frame(&mut a, b"still here").unwrap();
    assert_eq!(read_frame(&mut a).unwrap(), b"still here");

    stop.stop();
    handle.join().unwrap().unwrap();
}
