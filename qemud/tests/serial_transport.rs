// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! Drives the codec and multiplexer over a real duplex byte pipe (a
//! `socketpair`) instead of an in-memory buffer, exercising them the way
//! they're actually used: one side feeding bytes in, the other draining
//! replies back out.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use qemud::{ClientHandler, ClientSender, ConnectChannel, Multiplexer, PipeHostBridge, SerialCodec, ServiceHandler};

#[derive(Debug, Default)]
struct NullBridge;

impl PipeHostBridge for NullBridge {
    fn signal_wake_read(&self, _hwpipe: u64) {}
    fn close(&self, _hwpipe: u64) {}
}

#[derive(Debug)]
struct EchoHandler;

impl ClientHandler for EchoHandler {
    fn recv(&mut self, sender: &mut dyn ClientSender, msg: &[u8]) {
        sender.send(msg);
    }
}

#[derive(Debug)]
struct EchoService;

impl ServiceHandler for EchoService {
    fn connect(&mut self, _channel: ConnectChannel, _param: Option<&str>) -> Option<Box<dyn ClientHandler>> {
        Some(Box::new(EchoHandler))
    }
}

#[test]
fn round_trip_over_a_real_socketpair() {
    let (guest_fd, daemon_fd) =
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).expect("socketpair");
    let mut guest = UnixStream::from(guest_fd);
    let mut daemon = UnixStream::from(daemon_fd);

    let mut mux = Multiplexer::new(false, NullBridge);
    mux.register_service("echo", 1, Box::new(EchoService));

    let codec = SerialCodec::new(false);
    let mut rx = SerialCodec::new(false);
    let mut buf = [0u8; 256];

    guest.write_all(&codec.encode(0, false, b"connect:echo:01")).unwrap();
    let n = daemon.read(&mut buf).unwrap();
    let reply = mux.on_serial_bytes(&buf[..n]);
    daemon.write_all(&reply).unwrap();

    let n = guest.read(&mut buf).unwrap();
    let packets = rx.on_bytes(&buf[..n]);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].channel, 0);
    assert_eq!(packets[0].payload, b"ok:connect:01");

    guest.write_all(&codec.encode(1, false, b"ping")).unwrap();
    let n = daemon.read(&mut buf).unwrap();
    let reply = mux.on_serial_bytes(&buf[..n]);
    daemon.write_all(&reply).unwrap();

    let n = guest.read(&mut buf).unwrap();
    let packets = rx.on_bytes(&buf[..n]);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].channel, 1);
    assert_eq!(packets[0].payload, b"ping");
}
