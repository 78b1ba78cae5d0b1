// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! A standalone demo host: accepts one TCP connection standing in for the
//! guest's serial transport, wires up `boot-properties` and `hw-control`,
//! and pumps bytes through a [`Multiplexer`] until the connection drops.
//!
//! Pipe connections are out of scope for this binary (see `PipeHostBridge`
//! doc comment): `NullPipeBridge` is wired in only so `Multiplexer` has
//! somewhere to send bridge callbacks that this demo never triggers.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use clap::Parser;
use log::{info, warn};

use qemud::{Multiplexer, PipeHostBridge};
use qemud_services::{BootPropertiesService, HwControlService};

#[derive(Debug, Parser)]
struct Cli {
    /// Address to accept the serial-transport stand-in connection on.
    #[arg(long, default_value = "127.0.0.1:8554")]
    bind: String,

    /// Probe for a legacy (pre-channel-header-swap) daemon on connect.
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, Default)]
struct NullPipeBridge;

impl PipeHostBridge for NullPipeBridge {
    fn signal_wake_read(&self, _hwpipe: u64) {}
    fn close(&self, _hwpipe: u64) {}
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let mut mux = Multiplexer::new(args.legacy, NullPipeBridge);
    mux.register_service("boot-properties", 1, Box::new(boot_properties()));
    mux.register_service("hw-control", 0, Box::new(HwControlService::new()));

    let listener = TcpListener::bind(&args.bind)?;
    info!("qemud-host listening on {}", args.bind);

    for stream in listener.incoming() {
        let stream = stream?;
        info!("guest connected from {:?}", stream.peer_addr());
        if let Err(e) = serve(&mut mux, stream) {
            warn!("connection ended: {e}");
        }
    }

    Ok(())
}

fn boot_properties() -> BootPropertiesService {
    let mut svc = BootPropertiesService::new();
    for (name, value) in [
        ("ro.hardware", "qemud-demo"),
        ("dalvik.vm.heapsize", "192m"),
        ("qemu.sf.lcd_density", "160"),
    ] {
        if let Err(e) = svc.add_property(name, value) {
            warn!("could not add boot property {name}: {e}");
        }
    }
    svc
}

fn serve<B: PipeHostBridge>(mux: &mut Multiplexer<B>, mut stream: TcpStream) -> std::io::Result<()> {
    if let Some(probe) = mux.legacy_probe() {
        stream.write_all(&probe)?;
    }

    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        let reply = mux.on_serial_bytes(&buf[..n]);
        if !reply.is_empty() {
            stream.write_all(&reply)?;
        }
    }
}
