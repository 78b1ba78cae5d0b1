// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The `hw-control` service: LED brightness get/set queries used by
//! `libhardware`'s lights HAL to talk to the emulator. Brightness state is
//! service-wide (shared by every connected client), not per connection.

use log::debug;
use qemud::{ClientHandler, ClientSender, ConnectChannel, ServiceHandler};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

const SET_BRIGHTNESS_PREFIX: &str = "power:light:brightness:";
const GET_BRIGHTNESS_PREFIX: &str = "power:light:get-brightness:";

#[derive(Debug, Default, Clone, Copy)]
struct Brightness {
    lcd: u8,
    keyboard: u8,
    button: u8,
}

impl Brightness {
    fn get(&self, name: &str) -> Option<u8> {
        match name {
            "lcd_backlight" => Some(self.lcd),
            "keyboard_backlight" => Some(self.keyboard),
            "button_backlight" => Some(self.button),
            _ => None,
        }
    }

    fn set(&mut self, name: &str, value: u8) -> bool {
        match name {
            "lcd_backlight" => self.lcd = value,
            "keyboard_backlight" => self.keyboard = value,
            "button_backlight" => self.button = value,
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct HwControlService {
    state: Rc<RefCell<Brightness>>,
}

impl HwControlService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceHandler for HwControlService {
    fn connect(&mut self, _channel: ConnectChannel, _param: Option<&str>) -> Option<Box<dyn ClientHandler>> {
        Some(Box::new(HwControlClient { state: self.state.clone() }))
    }
}

#[derive(Debug)]
struct HwControlClient {
    state: Rc<RefCell<Brightness>>,
}

impl ClientHandler for HwControlClient {
    fn recv(&mut self, sender: &mut dyn ClientSender, msg: &[u8]) {
        let Ok(msg) = std::str::from_utf8(msg) else {
            debug!("hw-control: query is not valid UTF-8");
            return;
        };

        if let Some(args) = msg.strip_prefix(SET_BRIGHTNESS_PREFIX) {
            self.set_brightness(args);
        } else if let Some(name) = msg.strip_prefix(GET_BRIGHTNESS_PREFIX) {
            let value = self.state.borrow().get(name).unwrap_or_else(|| {
                debug!("hw-control: invalid power:light:get-brightness light name: {name}");
                0
            });
            let mut reply = format!("{value:03}").into_bytes();
            reply.push(0);
            sender.send(&reply);
        } else {
            debug!("hw-control: query not matched: {msg}");
        }
    }

    fn wants_framing(&self) -> bool {
        true
    }

    /// Each connected client persists the (shared) brightness state, so a
    /// snapshot taken with zero clients connected loses it — matching the
    /// original, where this is a per-client save/load callback rather than
    /// a service one.
    fn save(&mut self, w: &mut dyn Write) -> io::Result<()> {
        let state = self.state.borrow();
        qemud::snapshot::write_u32(w, state.lcd as u32)?;
        qemud::snapshot::write_u32(w, state.keyboard as u32)?;
        qemud::snapshot::write_u32(w, state.button as u32)
    }

    fn load(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let lcd = qemud::snapshot::read_u32(r)? as u8;
        let keyboard = qemud::snapshot::read_u32(r)? as u8;
        let button = qemud::snapshot::read_u32(r)? as u8;
        let mut state = self.state.borrow_mut();
        state.lcd = lcd;
        state.keyboard = keyboard;
        state.button = button;
        Ok(())
    }
}

impl HwControlClient {
    fn set_brightness(&mut self, args: &str) {
        let Some((name, value_str)) = args.split_once(':') else {
            debug!("hw-control: invalid power:light:brightness command");
            return;
        };
        let Ok(value) = value_str.parse::<u64>() else {
            debug!("hw-control: invalid power:light:brightness value: \"{value_str}\"");
            return;
        };
        let Ok(value) = u8::try_from(value) else {
            debug!("hw-control: brightness value out of range: {value}");
            return;
        };
        if !self.state.borrow_mut().set(name, value) {
            debug!("hw-control: invalid power:light:brightness light name");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingSender {
        sent: Vec<Vec<u8>>,
    }

    impl ClientSender for RecordingSender {
        fn send(&mut self, bytes: &[u8]) {
            self.sent.push(bytes.to_vec());
        }
        fn close(&mut self) {}
    }

    #[test]
    fn set_then_get_brightness_round_trips() {
        let mut svc = HwControlService::new();
        let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();

        client.recv(&mut sender, b"power:light:brightness:lcd_backlight:128");
        assert!(sender.sent.is_empty());

        client.recv(&mut sender, b"power:light:get-brightness:lcd_backlight");
        assert_eq!(sender.sent, vec![b"128\0".to_vec()]);
    }

    #[test]
    fn get_brightness_for_unknown_light_defaults_to_zero() {
        let mut svc = HwControlService::new();
        let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();

        client.recv(&mut sender, b"power:light:get-brightness:nope");
        assert_eq!(sender.sent, vec![b"000\0".to_vec()]);
    }

    #[test]
    fn out_of_range_brightness_value_is_ignored() {
        let mut svc = HwControlService::new();
        let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();

        client.recv(&mut sender, b"power:light:brightness:lcd_backlight:999");
        client.recv(&mut sender, b"power:light:get-brightness:lcd_backlight");
        assert_eq!(sender.sent, vec![b"000\0".to_vec()]);
    }

    #[test]
    fn save_load_round_trips_brightness_state() {
        let mut svc = HwControlService::new();
        {
            let mut client = svc.connect(ConnectChannel::Serial(1), None).unwrap();
            let mut sender = RecordingSender::default();
            client.recv(&mut sender, b"power:light:brightness:keyboard_backlight:42");
        }

        let mut buf = Vec::new();
        svc.save(&mut buf).unwrap();

        let mut restored = HwControlService::new();
        let mut cursor = &buf[..];
        restored.load(&mut cursor).unwrap();

        let mut client = restored.connect(ConnectChannel::Serial(1), None).unwrap();
        let mut sender = RecordingSender::default();
        client.recv(&mut sender, b"power:light:get-brightness:keyboard_backlight");
        assert_eq!(sender.sent, vec![b"042\0".to_vec()]);
    }
}
