// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The multiplexer: owns every live client and registered service, and is
//! the only thing that ever dispatches into handler code. Design Notes:
//! clients and services live in arenas keyed by handle rather than the
//! original's intrusive linked lists, and the channel-0 control protocol is
//! handled directly here instead of being modeled as just another dispatched
//! client, since a control handler that aliased the very arena it's
//! dispatched from would not type-check.

use crate::client::{packetize_for_pipe, Client, ClientSender, Transport};
use crate::codec::{hex2int, SerialCodec};
use crate::error::{Error, ProtocolError, Result, SnapshotError};
use crate::handle::{ClientHandle, ServiceHandle};
use crate::pipe::{PipeHostBridge, PipePollFlags, PipeRecvResult};
use crate::service::{ConnectChannel, Service, ServiceHandler, ServiceRegistry};
use crate::snapshot::{read_string, read_u32, write_string, write_u32};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};

enum ConnectOutcome {
    Connected(ClientHandle),
    UnknownService,
    ServiceBusy,
    Refused,
}

/// Owns the serial codec, every live client (serial- or pipe-backed), and
/// the registered services they connect to. `B` is the host-side pipe
/// bridge this process is embedded in; by construction nothing here is
/// shared across threads (Design Notes: thread-safety as single-owner).
pub struct Multiplexer<B: PipeHostBridge> {
    codec: SerialCodec,
    clients: HashMap<ClientHandle, Client>,
    next_handle: u64,
    channel_index: HashMap<i32, ClientHandle>,
    pipe_index: HashMap<u64, ClientHandle>,
    services: ServiceRegistry,
    bridge: B,
}

impl<B: PipeHostBridge> Multiplexer<B> {
    pub fn new(legacy: bool, bridge: B) -> Self {
        Self {
            codec: SerialCodec::new(legacy),
            clients: HashMap::new(),
            next_handle: 0,
            channel_index: HashMap::new(),
            pipe_index: HashMap::new(),
            services: ServiceRegistry::new(),
            bridge,
        }
    }

    /// Bytes that should be written to the serial transport right after
    /// construction to let a legacy daemon identify itself. `None` when
    /// this multiplexer wasn't built with legacy support.
    pub fn legacy_probe(&self) -> Option<Vec<u8>> {
        self.codec.legacy_enabled().then(SerialCodec::legacy_probe)
    }

    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        max_clients: u32,
        handler: Box<dyn ServiceHandler>,
    ) -> ServiceHandle {
        self.services.register(Service::new(name, max_clients, handler))
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Feeds bytes read off the serial transport, returning the bytes that
    /// should be written back (control replies and any service traffic
    /// produced while handling them).
    pub fn on_serial_bytes(&mut self, bytes: &[u8]) -> Vec<u8> {
        let packets = self.codec.on_bytes(bytes);
        let mut out = Vec::new();

        for packet in packets {
            if packet.channel == 0 {
                if let Some(reply) = self.handle_control_message(&packet.payload) {
                    out.extend(self.codec.encode(0, false, &reply));
                }
            } else {
                self.route_serial(packet.channel, &packet.payload, &mut out);
            }
        }

        out
    }

    fn route_serial(&mut self, channel: i32, payload: &[u8], out: &mut Vec<u8>) {
        let handle = match self.channel_index.get(&channel) {
            Some(h) => *h,
            None => {
                debug!("ignoring bytes for unknown channel {channel}");
                return;
            }
        };

        let messages = match self.clients.get_mut(&handle) {
            Some(client) => client.reassemble(payload),
            None => return,
        };

        for msg in messages {
            if !self.dispatch(handle, &msg, out) {
                break;
            }
        }
    }

    /// Delivers one reassembled message to its client's handler, detaching
    /// the client from the arena first so a handler that closes its own
    /// client (or any other client) can never alias it. Returns `false` once
    /// the client is gone, so the caller stops delivering the rest of the
    /// batch to it.
    fn dispatch(&mut self, handle: ClientHandle, msg: &[u8], out: &mut Vec<u8>) -> bool {
        let mut client = match self.clients.remove(&handle) {
            Some(c) => c,
            None => return false,
        };

        let mut close_requested = false;
        let framing = client.framing();

        match &mut client.transport {
            Transport::Serial { channel } => {
                let mut sender = SerialSender {
                    codec: &self.codec,
                    channel: *channel,
                    framing,
                    out,
                    close_requested: &mut close_requested,
                };
                client.handler.recv(&mut sender, msg);
            }
            Transport::Pipe { hwpipe, queue } => {
                let mut sender = PipeSender {
                    queue,
                    hwpipe: *hwpipe,
                    framing,
                    bridge: &self.bridge,
                    close_requested: &mut close_requested,
                };
                client.handler.recv(&mut sender, msg);
            }
        }

        if !close_requested {
            self.clients.insert(handle, client);
            return true;
        }

        if let Some(hwpipe) = client.transport.hwpipe() {
            // A pipe client can't be torn down until the guest acknowledges
            // the close; the real removal happens in
            // `pipe_close_from_guest`.
            self.bridge.close(hwpipe);
            self.clients.insert(handle, client);
            true
        } else {
            self.finish_close(handle, client, out, true);
            false
        }
    }

    /// Removes a client from every index, notifies its handler and service,
    /// and optionally echoes a `disconnect:` control message back (only
    /// meaningful for serial clients, and only when the host, not the
    /// guest, initiated the close).
    fn finish_close(&mut self, handle: ClientHandle, mut client: Client, out: &mut Vec<u8>, echo: bool) {
        if let Some(channel) = client.transport.channel() {
            self.channel_index.remove(&channel);
            if echo && channel > 0 {
                let msg = format!("disconnect:{channel:02x}");
                out.extend(self.codec.encode(0, false, msg.as_bytes()));
            }
        }
        if let Some(hwpipe) = client.transport.hwpipe() {
            self.pipe_index.remove(&hwpipe);
        }

        client.handler.close();

        if let Some(service) = client.service.take() {
            if let Some(s) = self.services.get_mut(service) {
                s.remove_client(handle);
            }
        }
    }

    fn disconnect_channel(&mut self, channel: i32, out: &mut Vec<u8>, echo: bool) {
        let handle = match self.channel_index.get(&channel) {
            Some(h) => *h,
            None => {
                debug!("disconnecting unknown channel {channel}");
                return;
            }
        };
        if let Some(client) = self.clients.remove(&handle) {
            self.finish_close(handle, client, out, echo);
        }
    }

    /// Host-initiated close of an arbitrary client (the `ClientSender::close`
    /// a handler calls from inside its own `recv` goes through `dispatch`
    /// instead; this is for closing some other client from the outside,
    /// e.g. when a service decides one of its other clients misbehaved).
    pub fn close_client(&mut self, handle: ClientHandle, out: &mut Vec<u8>) {
        let client = match self.clients.remove(&handle) {
            Some(c) => c,
            None => return,
        };
        if client.transport.is_pipe() {
            let hwpipe = client.transport.hwpipe().expect("just checked is_pipe");
            self.bridge.close(hwpipe);
            self.clients.insert(handle, client);
        } else {
            self.finish_close(handle, client, out, true);
        }
    }

    /// Disconnects every non-control serial client without echoing
    /// `disconnect:` back, matching the original's behavior when a snapshot
    /// is about to be loaded over the live state. Pipe clients are left
    /// alone: they're torn down independently by the bridge.
    pub fn disconnect_noncontrol(&mut self) {
        let handles: Vec<ClientHandle> = self
            .clients
            .iter()
            .filter(|(_, c)| matches!(&c.transport, Transport::Serial { channel } if *channel > 0))
            .map(|(h, _)| *h)
            .collect();

        let mut discard = Vec::new();
        for handle in handles {
            if let Some(client) = self.clients.remove(&handle) {
                self.finish_close(handle, client, &mut discard, false);
            }
        }
    }

    fn connect_client(
        &mut self,
        service_name: &str,
        channel: ConnectChannel,
        param: Option<&str>,
    ) -> ConnectOutcome {
        let service_handle = match self.services.find_by_name(service_name) {
            Some(h) => h,
            None => {
                debug!("no registered '{service_name}' service");
                return ConnectOutcome::UnknownService;
            }
        };

        if self.services.get(service_handle).expect("just looked up").is_full() {
            debug!("registration failed for '{service_name}' service: too many clients");
            return ConnectOutcome::ServiceBusy;
        }

        let handler = self
            .services
            .get_mut(service_handle)
            .expect("just looked up")
            .handler_mut()
            .connect(channel, param);
        let handler = match handler {
            Some(h) => h,
            None => return ConnectOutcome::Refused,
        };

        let transport = match channel {
            ConnectChannel::Serial(c) => Transport::Serial { channel: c },
            ConnectChannel::Pipe(hwpipe) => Transport::Pipe { hwpipe, queue: VecDeque::new() },
        };

        let mut client = Client::new(transport, param.map(String::from), handler);
        let framing = client.handler.wants_framing();
        client.set_framing(framing);
        client.service = Some(service_handle);

        let client_handle = ClientHandle(self.next_handle);
        self.next_handle += 1;

        match channel {
            ConnectChannel::Serial(c) => {
                self.channel_index.insert(c, client_handle);
            }
            ConnectChannel::Pipe(hwpipe) => {
                self.pipe_index.insert(hwpipe, client_handle);
            }
        }

        self.services
            .get_mut(service_handle)
            .expect("just looked up")
            .add_client(client_handle);
        self.clients.insert(client_handle, client);

        debug!("registered client channel for '{service_name}' service");
        ConnectOutcome::Connected(client_handle)
    }

    /// Implements the channel-0 control protocol: `connect:`/`disconnect:`
    /// (and, if this multiplexer was built with `legacy` support, the
    /// legacy daemon's `ok:connect:` acknowledgement). Returns the reply to
    /// send back on channel 0, if any.
    fn handle_control_message(&mut self, msg: &[u8]) -> Option<Vec<u8>> {
        if msg.len() > 8 && &msg[..8] == b"connect:" {
            return self.handle_connect_command(&msg[8..]);
        }

        if msg.len() == 13 && &msg[..11] == b"disconnect:" {
            match hex2int(&msg[11..13]) {
                Some(channel) if channel > 0 => {
                    let mut out = Vec::new();
                    self.disconnect_channel(channel, &mut out, false);
                }
                _ => debug!("{}", Error::from(ProtocolError::MalformedDisconnect)),
            }
            return None;
        }

        if self.codec.is_legacy_daemon() {
            if msg.len() > 11 && &msg[..11] == b"ok:connect:" {
                self.handle_legacy_ok_connect(&msg[11..]);
            }
            // Legacy daemons never send anything else worth replying to.
            return None;
        }

        debug!("{}", Error::from(ProtocolError::UnknownCommand));
        Some(b"ko:unknown command".to_vec())
    }

    fn handle_connect_command(&mut self, rest: &[u8]) -> Option<Vec<u8>> {
        // the channel field must start immediately after the *first* colon
        // and run to the end of the message; a service name containing a
        // colon is therefore malformed, not a longer name.
        let split = match rest.iter().position(|&b| b == b':') {
            Some(i) if i + 3 == rest.len() => i,
            _ => {
                debug!("{}", Error::from(ProtocolError::MalformedConnect));
                return None;
            }
        };
        let service_name = match std::str::from_utf8(&rest[..split]) {
            Ok(s) => s,
            Err(_) => {
                debug!("{}", Error::from(ProtocolError::MalformedConnect));
                return None;
            }
        };
        let channel = match hex2int(&rest[split + 1..]) {
            Some(c) if c > 0 => c,
            _ => {
                debug!("{}", Error::from(ProtocolError::MalformedConnect));
                return None;
            }
        };

        let reply = match self.connect_client(service_name, ConnectChannel::Serial(channel), None) {
            ConnectOutcome::Connected(_) => format!("ok:connect:{channel:02x}"),
            ConnectOutcome::UnknownService | ConnectOutcome::Refused => {
                format!("ko:connect:{channel:02x}:unknown service")
            }
            ConnectOutcome::ServiceBusy => format!("ko:connect:{channel:02x}:service busy"),
        };
        Some(reply.into_bytes())
    }

    /// A legacy daemon connects to `gsm`/`gps`/`control` up front and then
    /// reports each one back with `ok:connect:<name>:<channel>` instead of
    /// waiting to be asked; `control` arrives renamed to `hw-control` here.
    fn handle_legacy_ok_connect(&mut self, rest: &[u8]) {
        let split = match rest.iter().position(|&b| b == b':') {
            Some(i) if i + 3 == rest.len() => i,
            _ => return,
        };
        let Ok(service_name) = std::str::from_utf8(&rest[..split]) else {
            return;
        };
        let service_name = if service_name == "control" { "hw-control" } else { service_name };
        let Some(channel) = hex2int(&rest[split + 1..]).filter(|c| *c > 0) else {
            return;
        };
        self.connect_client(service_name, ConnectChannel::Serial(channel), None);
    }

    /// Sends `bytes` to every client currently connected to `service`
    /// (`qemud_service_broadcast`), returning the serial bytes that should
    /// be written back. Pipe clients are queued and woken instead of
    /// appearing in the returned buffer.
    pub fn broadcast(&mut self, service: ServiceHandle, bytes: &[u8]) -> Vec<u8> {
        let mut handles = Vec::new();
        self.services.broadcast(service, |h| handles.push(h));

        let mut out = Vec::new();
        for handle in handles {
            self.send_to_client(handle, bytes, &mut out);
        }
        out
    }

    /// Pushes `bytes` straight out to one client's transport, without going
    /// through its handler (this is host-initiated traffic, not a reply to
    /// something the client sent).
    fn send_to_client(&mut self, handle: ClientHandle, bytes: &[u8], out: &mut Vec<u8>) {
        let mut client = match self.clients.remove(&handle) {
            Some(c) => c,
            None => return,
        };

        let framing = client.framing();
        match &mut client.transport {
            Transport::Serial { channel } => {
                out.extend(self.codec.encode(*channel, framing, bytes));
            }
            Transport::Pipe { hwpipe, queue } => {
                for chunk in packetize_for_pipe(framing, bytes) {
                    queue.push_back(crate::client::PipeMessage::new(chunk));
                    self.bridge.signal_wake_read(*hwpipe);
                }
            }
        }

        self.clients.insert(handle, client);
    }

    // --- Pipe bridge contract -------------------------------------------
    // The bridge calls these; the multiplexer calls back into it through
    // `PipeHostBridge`.

    /// A guest connected a new pipe naming `service[:param]`. Returns
    /// whether the connection was accepted.
    pub fn pipe_init(&mut self, hwpipe: u64, service_and_param: &str) -> bool {
        let (service_name, param) = match service_and_param.split_once(':') {
            Some((service, param)) => (service, Some(param)),
            None => (service_and_param, None),
        };
        matches!(
            self.connect_client(service_name, ConnectChannel::Pipe(hwpipe), param),
            ConnectOutcome::Connected(_)
        )
    }

    /// The guest closed its end of the pipe; tear the client down for real.
    pub fn pipe_close_from_guest(&mut self, hwpipe: u64) {
        let handle = match self.pipe_index.get(&hwpipe) {
            Some(h) => *h,
            None => return,
        };
        if let Some(client) = self.clients.remove(&handle) {
            let mut discard = Vec::new();
            self.finish_close(handle, client, &mut discard, false);
        }
    }

    /// The guest wrote `data` into the pipe.
    pub fn pipe_send_buffers(&mut self, hwpipe: u64, data: &[u8]) {
        let handle = match self.pipe_index.get(&hwpipe) {
            Some(h) => *h,
            None => {
                debug!("send_buffers for unknown pipe {hwpipe}");
                return;
            }
        };
        let messages = match self.clients.get_mut(&handle) {
            Some(client) => client.reassemble(data),
            None => return,
        };

        let mut discard = Vec::new();
        for msg in messages {
            if !self.dispatch(handle, &msg, &mut discard) {
                break;
            }
        }
    }

    /// Drains queued service data into `buf`, for the guest's read side of
    /// the pipe.
    pub fn pipe_recv_buffers(&mut self, hwpipe: u64, buf: &mut [u8]) -> PipeRecvResult {
        let handle = match self.pipe_index.get(&hwpipe) {
            Some(h) => *h,
            None => return PipeRecvResult::Closed,
        };
        let client = match self.clients.get_mut(&handle) {
            Some(c) => c,
            None => return PipeRecvResult::Closed,
        };
        let queue = client.pipe_queue_mut().expect("pipe client always has a queue");

        let mut written = 0;
        while written < buf.len() {
            let Some(front) = queue.front_mut() else { break };
            let remaining = front.remaining();
            let take = remaining.len().min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&remaining[..take]);
            front.advance(take);
            written += take;
            if front.is_exhausted() {
                queue.pop_front();
            }
        }

        if written == 0 {
            PipeRecvResult::Again
        } else {
            PipeRecvResult::Read(written)
        }
    }

    pub fn pipe_poll(&self, hwpipe: u64) -> PipePollFlags {
        let readable = self
            .pipe_index
            .get(&hwpipe)
            .and_then(|h| self.clients.get(h))
            .and_then(|c| c.pipe_queue_ref())
            .is_some_and(|q| !q.is_empty());
        PipePollFlags { readable, writable: true }
    }

    // --- Snapshots --------------------------------------------------------

    /// Saves codec state, service state, and every non-control serial
    /// client. Pipe clients are never saved: they're recreated by the
    /// guest reconnecting its pipes after restore, matching the original's
    /// `qemud_multiplexer_save` (which only ever walks the serial client
    /// list).
    pub fn save<W: Write>(&mut self, w: &mut W) -> Result<()> {
        self.codec.save(w)?;
        self.services.save(w)?;

        let mut handles: Vec<ClientHandle> = self
            .clients
            .iter()
            .filter(|(_, c)| matches!(&c.transport, Transport::Serial { channel } if *channel > 0))
            .map(|(h, _)| *h)
            .collect();
        handles.sort();

        write_u32(w, handles.len() as u32)?;
        for handle in handles {
            let service_name = self
                .clients
                .get(&handle)
                .and_then(|c| c.service)
                .and_then(|h| self.services.get(h))
                .map(|s| s.name().to_string())
                .unwrap_or_default();
            let client = self.clients.get_mut(&handle).expect("handle from our own iteration");

            write_string(w, &service_name)?;
            write_u32(w, client.param.is_some() as u32)?;
            if let Some(param) = &client.param {
                write_string(w, param)?;
            }
            write_u32(w, client.transport.channel().expect("filtered to serial above") as u32)?;
            client.save(w)?;
        }

        Ok(())
    }

    /// Replaces all live serial client state with what's in the snapshot.
    /// Any client currently connected is disconnected first, silently
    /// (Design Notes: this is the one place a client is killed without the
    /// usual `disconnect:` echo, since the guest doesn't yet know the
    /// restored world exists).
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.codec.load(r)?;
        self.services.load(r)?;
        self.disconnect_noncontrol();

        let count = read_u32(r)?;
        for _ in 0..count {
            let service_name = read_string(r)?;
            let has_param = read_u32(r)? != 0;
            let param = if has_param { Some(read_string(r)?) } else { None };
            let channel = read_u32(r)? as i32;
            if channel == 0 {
                return Err(SnapshotError::ControlChannelSaved.into());
            }

            let handle = match self.connect_client(&service_name, ConnectChannel::Serial(channel), param.as_deref()) {
                ConnectOutcome::Connected(h) => h,
                _ => return Err(SnapshotError::UnknownService(service_name).into()),
            };
            self.clients
                .get_mut(&handle)
                .expect("just connected")
                .load(r)?;
        }

        Ok(())
    }
}

/// `ClientSender` for a serial-channel client: replies go straight through
/// the shared codec onto the accumulating outbound buffer.
struct SerialSender<'a> {
    codec: &'a SerialCodec,
    channel: i32,
    framing: bool,
    out: &'a mut Vec<u8>,
    close_requested: &'a mut bool,
}

impl<'a> ClientSender for SerialSender<'a> {
    fn send(&mut self, bytes: &[u8]) {
        self.out.extend(self.codec.encode(self.channel, self.framing, bytes));
    }

    fn close(&mut self) {
        *self.close_requested = true;
    }
}

/// `ClientSender` for a pipe client: replies are packetized and queued for
/// the guest to drain via `pipe_recv_buffers`, waking it after each chunk.
struct PipeSender<'a, B: PipeHostBridge> {
    queue: &'a mut VecDeque<crate::client::PipeMessage>,
    hwpipe: u64,
    framing: bool,
    bridge: &'a B,
    close_requested: &'a mut bool,
}

impl<'a, B: PipeHostBridge> ClientSender for PipeSender<'a, B> {
    fn send(&mut self, bytes: &[u8]) {
        for chunk in packetize_for_pipe(self.framing, bytes) {
            self.queue.push_back(crate::client::PipeMessage::new(chunk));
            self.bridge.signal_wake_read(self.hwpipe);
        }
    }

    fn close(&mut self) {
        *self.close_requested = true;
    }
}
