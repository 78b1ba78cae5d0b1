// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The `boot-properties` service: a one-shot `list` query that hands the
//! guest every property queued for it at boot, then resets the host's
//! boot-completion bookkeeping so `qemu-props` is known to be running
//! again. Properties themselves are configured ambient state (pushed in
//! from the command line at startup), not something guests ever write.

use qemud::{ClientHandler, ClientSender, ConnectChannel, ServiceHandler};
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::rc::Rc;

const PROPERTY_MAX_NAME: usize = 32;
const PROPERTY_MAX_VALUE: usize = 92;
const PROPERTY_FORBIDDEN_CHARS: &[char] = &[' ', '=', '$', '*', '?', '\'', '"'];

#[derive(Debug)]
pub enum PropertyError {
    NameTooLong,
    ValueTooLong,
    InvalidNameChar(char),
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong => write!(f, "boot property name too long"),
            Self::ValueTooLong => write!(f, "boot property value too long"),
            Self::InvalidNameChar(c) => write!(f, "boot property name contains invalid char '{c}'"),
        }
    }
}

impl std::error::Error for PropertyError {}

/// Called once the guest has pulled the property list, mirroring the
/// original's reset of `guest_boot_completed`/`guest_data_partition_mounted`
/// globals. Those flags live outside this crate's scope; a host binding
/// them in plugs in here instead of this service reaching for globals of
/// its own.
pub trait BootResetHook: fmt::Debug {
    fn reset(&self);
}

#[derive(Debug)]
pub struct NoopBootResetHook;

impl BootResetHook for NoopBootResetHook {
    fn reset(&self) {}
}

#[derive(Debug, Default)]
struct Properties(Vec<(String, String)>);

/// Service-wide state for `boot-properties`: the queued property list is
/// shared with every client spawned from it (in practice there's only ever
/// one, since `max_clients` is 1).
#[derive(Debug)]
pub struct BootPropertiesService {
    properties: Rc<RefCell<Properties>>,
    reset_hook: Rc<dyn BootResetHook>,
}

impl BootPropertiesService {
    pub fn new() -> Self {
        Self::with_reset_hook(Rc::new(NoopBootResetHook))
    }

    pub fn with_reset_hook(reset_hook: Rc<dyn BootResetHook>) -> Self {
        Self { properties: Rc::new(RefCell::new(Properties::default())), reset_hook }
    }

    /// Queues a property to hand back on the next `list` query. Validated
    /// the same way the original's command-line `-prop name=value` option
    /// is.
    pub fn add_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
        if name.len() > PROPERTY_MAX_NAME {
            return Err(PropertyError::NameTooLong);
        }
        if value.len() > PROPERTY_MAX_VALUE {
            return Err(PropertyError::ValueTooLong);
        }
        if let Some(c) = name.chars().find(|c| PROPERTY_FORBIDDEN_CHARS.contains(c)) {
            return Err(PropertyError::InvalidNameChar(c));
        }
        self.properties.borrow_mut().0.push((name.to_string(), value.to_string()));
        Ok(())
    }
}

impl Default for BootPropertiesService {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHandler for BootPropertiesService {
    fn connect(&mut self, _channel: ConnectChannel, _param: Option<&str>) -> Option<Box<dyn ClientHandler>> {
        Some(Box::new(BootPropertiesClient {
            properties: self.properties.clone(),
            reset_hook: self.reset_hook.clone(),
        }))
    }

    fn save(&mut self, w: &mut dyn Write) -> io::Result<()> {
        let properties = self.properties.borrow();
        qemud::snapshot::write_u32(w, properties.0.len() as u32)?;
        for (key, value) in &properties.0 {
            qemud::snapshot::write_string(w, key)?;
            qemud::snapshot::write_string(w, value)?;
        }
        Ok(())
    }

    fn load(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let mut properties = self.properties.borrow_mut();
        properties.0.clear();
        let count = qemud::snapshot::read_u32(r)?;
        for _ in 0..count {
            let key = qemud::snapshot::read_string(r).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let value = qemud::snapshot::read_string(r).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            properties.0.push((key, value));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BootPropertiesClient {
    properties: Rc<RefCell<Properties>>,
    reset_hook: Rc<dyn BootResetHook>,
}

impl ClientHandler for BootPropertiesClient {
    fn recv(&mut self, sender: &mut dyn ClientSender, msg: &[u8]) {
        if msg != b"list" {
            return;
        }

        for (key, value) in &self.properties.borrow().0 {
            let line = format!("{key}={value}");
            sender.send(line.as_bytes());
        }
        // a single NUL signals the end of the list
        sender.send(&[0u8]);

        self.reset_hook.reset();
    }

    fn wants_framing(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingSender {
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    impl ClientSender for RecordingSender {
        fn send(&mut self, bytes: &[u8]) {
            self.sent.push(bytes.to_vec());
        }
        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Debug, Default)]
    struct RecordingResetHook {
        reset_count: RefCell<u32>,
    }

    impl BootResetHook for RecordingResetHook {
        fn reset(&self) {
            *self.reset_count.borrow_mut() += 1;
        }
    }

    #[test]
    fn add_property_rejects_oversize_name_and_value() {
        let mut svc = BootPropertiesService::new();
        assert!(matches!(svc.add_property(&"n".repeat(33), "v"), Err(PropertyError::NameTooLong)));
        assert!(matches!(svc.add_property("n", &"v".repeat(93)), Err(PropertyError::ValueTooLong)));
    }

    #[test]
    fn add_property_rejects_forbidden_characters() {
        let mut svc = BootPropertiesService::new();
        assert!(matches!(svc.add_property("bad name", "v"), Err(PropertyError::InvalidNameChar(' '))));
        assert!(matches!(svc.add_property("bad=name", "v"), Err(PropertyError::InvalidNameChar('='))));
    }

    #[test]
    fn list_replies_with_each_property_then_a_nul_and_resets() {
        let reset_hook = Rc::new(RecordingResetHook::default());
        let mut svc = BootPropertiesService::with_reset_hook(reset_hook.clone());
        svc.add_property("ro.hardware", "qemud-demo").unwrap();
        svc.add_property("dalvik.vm.heapsize", "192m").unwrap();

        let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();
        client.recv(&mut sender, b"list");

        assert_eq!(sender.sent[0], b"ro.hardware=qemud-demo");
        assert_eq!(sender.sent[1], b"dalvik.vm.heapsize=192m");
        assert_eq!(sender.sent[2], vec![0u8]);
        assert_eq!(*reset_hook.reset_count.borrow(), 1);
    }

    #[test]
    fn unrecognized_query_is_ignored() {
        let mut svc = BootPropertiesService::new();
        let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();
        client.recv(&mut sender, b"unknown");
        assert!(sender.sent.is_empty());
    }

    #[test]
    fn save_load_round_trips_property_list() {
        let mut svc = BootPropertiesService::new();
        svc.add_property("ro.hardware", "qemud-demo").unwrap();

        let mut buf = Vec::new();
        svc.save(&mut buf).unwrap();

        let mut restored = BootPropertiesService::new();
        let mut cursor = &buf[..];
        restored.load(&mut cursor).unwrap();

        let mut client = restored.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();
        client.recv(&mut sender, b"list");
        assert_eq!(sender.sent[0], b"ro.hardware=qemud-demo");
    }
}
