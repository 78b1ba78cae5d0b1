// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! Host-side multiplexer for talking to a single guest over one serial byte
//! pipe and/or individual pipe connections: wire codec, per-client framing,
//! the channel-0 control protocol, and the service registry client
//! connections dispatch through.

pub mod client;
pub mod codec;
pub mod error;
pub mod handle;
pub mod multiplexer;
pub mod pipe;
pub mod service;
pub mod sink;
pub mod snapshot;

pub use client::{Client, ClientHandler, ClientSender, Transport};
pub use codec::{Packet, SerialCodec};
pub use error::{Error, ProtocolError, Result, SnapshotError};
pub use handle::{ClientHandle, ServiceHandle};
pub use multiplexer::Multiplexer;
pub use pipe::{PipeHostBridge, PipePollFlags, PipeRecvResult};
pub use service::{ConnectChannel, Service, ServiceHandler, ServiceRegistry};
