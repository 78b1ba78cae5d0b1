// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The service registry: named collaborators that accept new client
//! connections and persist their own state across snapshots.

use crate::client::ClientHandler;
use crate::error::{Result, SnapshotError};
use crate::handle::ClientHandle;
use crate::snapshot::{read_string, read_u32, write_string, write_u32};
use std::collections::HashSet;
use std::io::{self, Read, Write};

/// What a client is connecting over, handed to [`ServiceHandler::connect`]
/// so a service never needs to know about `Multiplexer`'s internals.
#[derive(Debug, Clone, Copy)]
pub enum ConnectChannel {
    Serial(i32),
    Pipe(u64),
}

/// Service-supplied behavior for accepting connections and persisting
/// service-wide (not per-client) state.
pub trait ServiceHandler: std::fmt::Debug {
    /// Called when a new client wants to connect. Returning `None` refuses
    /// the connection (e.g. a malformed `client_param`).
    fn connect(
        &mut self,
        channel: ConnectChannel,
        param: Option<&str>,
    ) -> Option<Box<dyn ClientHandler>>;

    fn save(&mut self, _w: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn load(&mut self, _r: &mut dyn Read) -> io::Result<()> {
        Ok(())
    }
}

/// A registered named service and the clients currently connected to it.
#[derive(Debug)]
pub struct Service {
    name: String,
    max_clients: u32,
    clients: HashSet<ClientHandle>,
    handler: Box<dyn ServiceHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>, max_clients: u32, handler: Box<dyn ServiceHandler>) -> Self {
        Self {
            name: name.into(),
            max_clients,
            clients: HashSet::new(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `0` means unlimited, matching `max_clients` in the original.
    pub fn max_clients(&self) -> u32 {
        self.max_clients
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn is_full(&self) -> bool {
        self.max_clients > 0 && self.clients.len() as u32 >= self.max_clients
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientHandle> {
        self.clients.iter()
    }

    /// Calls `send` once per client currently connected to this service
    /// (`qemud_service_broadcast`). The registry only knows the client
    /// handles; actually delivering bytes to each one is `Multiplexer`'s
    /// job, since only it owns the codec/bridge each transport needs.
    pub fn broadcast(&self, mut send: impl FnMut(ClientHandle)) {
        for &handle in &self.clients {
            send(handle);
        }
    }

    pub(crate) fn add_client(&mut self, handle: ClientHandle) {
        self.clients.insert(handle);
    }

    pub(crate) fn remove_client(&mut self, handle: ClientHandle) {
        self.clients.remove(&handle);
    }

    pub(crate) fn handler_mut(&mut self) -> &mut dyn ServiceHandler {
        self.handler.as_mut()
    }

    pub fn save<W: Write>(&mut self, w: &mut W) -> Result<()> {
        write_string(w, &self.name)?;
        write_u32(w, self.max_clients)?;
        write_u32(w, self.clients.len() as u32)?;
        self.handler.save(w)?;
        Ok(())
    }

    /// Reconfigures this (already-registered) service from snapshot data.
    /// The client count in the stream is informational only, matching the
    /// original's "cannot be verified now" comment: per-client state is
    /// restored separately as each client reconnects.
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.max_clients = read_u32(r)?;
        let _saved_num_clients = read_u32(r)?;
        self.handler.load(r)?;
        Ok(())
    }
}

/// Services registered with a `Multiplexer`, looked up by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Service) -> crate::handle::ServiceHandle {
        self.services.push(service);
        crate::handle::ServiceHandle(self.services.len() - 1)
    }

    pub fn find_by_name(&self, name: &str) -> Option<crate::handle::ServiceHandle> {
        self.services
            .iter()
            .position(|s| s.name == name)
            .map(crate::handle::ServiceHandle)
    }

    pub fn get(&self, handle: crate::handle::ServiceHandle) -> Option<&Service> {
        self.services.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: crate::handle::ServiceHandle) -> Option<&mut Service> {
        self.services.get_mut(handle.0)
    }

    /// Calls `send` once per client connected to `handle`'s service; a
    /// no-op if `handle` isn't registered.
    pub fn broadcast(&self, handle: crate::handle::ServiceHandle, send: impl FnMut(ClientHandle)) {
        if let Some(service) = self.get(handle) {
            service.broadcast(send);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.iter_mut()
    }

    pub fn save<W: Write>(&mut self, w: &mut W) -> Result<()> {
        write_u32(w, self.services.len() as u32)?;
        for service in &mut self.services {
            service.save(w)?;
        }
        Ok(())
    }

    /// Each saved service must already be registered under the same name
    /// (services are a fixed, construction-time set; unlike clients they
    /// are never created by the snapshot).
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let count = read_u32(r)?;
        for _ in 0..count {
            let name = read_string(r)?;
            let handle = self
                .find_by_name(&name)
                .ok_or_else(|| SnapshotError::UnknownService(name.clone()))?;
            self.get_mut(handle).expect("handle just looked up").load(r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullHandler;
    impl ServiceHandler for NullHandler {
        fn connect(&mut self, _channel: ConnectChannel, _param: Option<&str>) -> Option<Box<dyn ClientHandler>> {
            None
        }
    }

    #[test]
    fn find_by_name_and_client_bookkeeping() {
        let mut reg = ServiceRegistry::new();
        let handle = reg.register(Service::new("boot-properties", 1, Box::new(NullHandler)));
        assert_eq!(reg.find_by_name("boot-properties"), Some(handle));
        assert_eq!(reg.find_by_name("nope"), None);

        let client = ClientHandle(1);
        reg.get_mut(handle).unwrap().add_client(client);
        assert_eq!(reg.get(handle).unwrap().num_clients(), 1);
        assert!(reg.get(handle).unwrap().is_full());
        reg.get_mut(handle).unwrap().remove_client(client);
        assert_eq!(reg.get(handle).unwrap().num_clients(), 0);
    }

    #[test]
    fn broadcast_visits_every_connected_client() {
        let mut reg = ServiceRegistry::new();
        let handle = reg.register(Service::new("echo", 0, Box::new(NullHandler)));
        reg.get_mut(handle).unwrap().add_client(ClientHandle(1));
        reg.get_mut(handle).unwrap().add_client(ClientHandle(2));

        let mut visited = Vec::new();
        reg.broadcast(handle, |h| visited.push(h));
        visited.sort();
        assert_eq!(visited, vec![ClientHandle(1), ClientHandle(2)]);
    }
}
