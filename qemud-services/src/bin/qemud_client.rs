// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! A minimal demo client for `qemud-host`: opens one connection, performs a
//! single request/response exchange over the control + service channels,
//! and exits. Good enough to exercise the wire protocol by hand; not a
//! general-purpose qemud console.

use std::io::{Read, Write};
use std::net::TcpStream;

use clap::{Parser, Subcommand};
use log::debug;

use qemud::SerialCodec;

const REQUEST_CHANNEL: i32 = 1;

#[derive(Debug, Parser)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8554")]
    host: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List boot properties.
    ListProperties,

    /// Query an hw-control LED brightness by name.
    GetBrightness { name: String },

    /// Set an hw-control LED brightness by name.
    SetBrightness { name: String, value: u8 },
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let (service, request, framed_reply) = match &args.command {
        Command::ListProperties => ("boot-properties".to_string(), b"list".to_vec(), true),
        Command::GetBrightness { name } => (
            "hw-control".to_string(),
            format!("power:light:get-brightness:{name}").into_bytes(),
            true,
        ),
        Command::SetBrightness { name, value } => (
            "hw-control".to_string(),
            format!("power:light:brightness:{name}:{value}").into_bytes(),
            false,
        ),
    };

    let mut stream = TcpStream::connect(&args.host)?;
    let codec = SerialCodec::new(false);

    connect(&mut stream, &codec, &service, REQUEST_CHANNEL)?;
    stream.write_all(&codec.encode(REQUEST_CHANNEL, false, &request))?;

    if framed_reply {
        for line in read_framed_replies(&mut stream, &codec)? {
            println!("{}", String::from_utf8_lossy(&line));
        }
    }

    Ok(())
}

fn connect(stream: &mut TcpStream, codec: &SerialCodec, service: &str, channel: i32) -> std::io::Result<()> {
    let msg = format!("connect:{service}:{channel:02x}");
    stream.write_all(&codec.encode(0, false, msg.as_bytes()))?;

    let mut rx = SerialCodec::new(false);
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        let packets = rx.on_bytes(&buf[..n]);
        for packet in packets {
            if packet.channel != 0 {
                continue;
            }
            let reply = String::from_utf8_lossy(&packet.payload);
            if reply.starts_with("ok:connect:") {
                debug!("connected to '{service}' on channel {channel:02x}");
                return Ok(());
            }
            return Err(std::io::Error::other(format!("connect failed: {reply}")));
        }
    }
}

/// Reads framed replies on `REQUEST_CHANNEL` until a single-NUL message
/// signals the end of the list, matching `boot-properties`'s `list` reply.
fn read_framed_replies(stream: &mut TcpStream, _codec: &SerialCodec) -> std::io::Result<Vec<Vec<u8>>> {
    let mut rx = SerialCodec::new(false);
    let mut buf = [0u8; 4096];
    let mut out = Vec::new();

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        for packet in rx.on_bytes(&buf[..n]) {
            if packet.channel != REQUEST_CHANNEL {
                continue;
            }
            // strip the 4-hex-digit sub-framing header each send carries.
            let payload = if packet.payload.len() >= 4 { &packet.payload[4..] } else { &packet.payload[..] };
            if payload == [0u8] {
                return Ok(out);
            }
            out.push(payload.to_vec());
            // a non-list single reply (e.g. get-brightness) is done after one message
            if out.len() == 1 && payload.last() == Some(&0) {
                return Ok(out);
            }
        }
    }
}
