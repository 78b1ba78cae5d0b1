// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The serial wire codec: ASCII-hex framed `<channel><length><payload>`
//! packets multiplexed over a single byte stream, plus the optional
//! sub-framing header services can ask for on top of that.

use crate::error::{Result, SnapshotError};
use crate::sink::Sink;
use crate::snapshot::{read_bytes, read_u32, write_bytes, write_u32};
use log::{debug, warn};
use std::io::{Read, Write};

const HEADER_SIZE: usize = 6;
const CHANNEL_OFFSET: usize = 0;
const CHANNEL_SIZE: usize = 2;
const LENGTH_OFFSET: usize = 2;
const LENGTH_SIZE: usize = 4;

/// Legacy daemons swap the field order: `<length><channel><payload>`.
const LEGACY_LENGTH_OFFSET: usize = 0;
const LEGACY_CHANNEL_OFFSET: usize = 4;

pub const FRAME_HEADER_SIZE: usize = 4;
pub const MAX_SERIAL_PAYLOAD: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Unknown,
    Legacy,
    Normal,
}

/// A fully reassembled packet handed back to the caller by [`SerialCodec::on_bytes`].
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    pub channel: i32,
    pub payload: Vec<u8>,
}

/// Decodes/encodes the single-byte-stream wire format described in
/// `qemud_serial_send`/`_qemud_serial_read`. Owns no transport; the caller
/// pumps raw bytes in and drains encoded bytes out.
pub struct SerialCodec {
    legacy: bool,
    version: Version,
    need_header: bool,
    overflow: usize,
    in_size: usize,
    in_channel: i32,
    header: Sink,
    payload: Sink,
}

impl SerialCodec {
    /// `legacy` is a construction-time choice (Design Notes: legacy mode as
    /// a compile/construction-time flag) that both sends the detection
    /// probe up front and accepts the swapped legacy field order.
    pub fn new(legacy: bool) -> Self {
        let mut header = Sink::new();
        header.reset(HEADER_SIZE);
        Self {
            legacy,
            version: if legacy { Version::Unknown } else { Version::Normal },
            need_header: true,
            overflow: 0,
            in_size: 0,
            in_channel: -1,
            header,
            payload: Sink::new(),
        }
    }

    pub fn is_legacy_daemon(&self) -> bool {
        self.version == Version::Legacy
    }

    /// Whether this codec was constructed to probe for/accept a legacy
    /// daemon at all (independent of whether one has actually been detected
    /// yet).
    pub fn legacy_enabled(&self) -> bool {
        self.legacy
    }

    /// The bytes that should be written to the transport immediately after
    /// construction to let a legacy daemon identify itself. Optional: a
    /// normal (non-legacy-supporting) codec never needs this.
    pub fn legacy_probe() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"000100X");
        out.extend_from_slice(b"000b00connect:gsm");
        out.extend_from_slice(b"000b00connect:gps");
        out.extend_from_slice(b"000f00connect:control");
        out.extend_from_slice(b"00c210");
        out.extend(std::iter::repeat(0u8).take(194));
        out
    }

    /// Feeds raw bytes received off the transport, returning every packet
    /// that became complete as a result (zero, one, or many).
    pub fn on_bytes(&mut self, mut from: &[u8]) -> Vec<Packet> {
        let mut out = Vec::new();

        while !from.is_empty() {
            if self.overflow > 0 {
                let avail = self.overflow.min(from.len());
                from = &from[avail..];
                self.overflow -= avail;
                continue;
            }

            if self.need_header {
                if !self.header.fill(&mut from) {
                    break;
                }

                let header_bytes = self.header.filled().to_vec();
                self.header.reset(HEADER_SIZE);

                if self.legacy && self.version == Version::Unknown {
                    if header_bytes.starts_with(b"001200") {
                        debug!("legacy qemud daemon detected");
                        self.version = Version::Legacy;
                    } else {
                        debug!("normal qemud daemon detected");
                        self.version = Version::Normal;
                    }
                }

                let (length_off, channel_off) = if self.version == Version::Legacy {
                    (LEGACY_LENGTH_OFFSET, LEGACY_CHANNEL_OFFSET)
                } else {
                    (LENGTH_OFFSET, CHANNEL_OFFSET)
                };

                let size = hex2int(&header_bytes[length_off..length_off + LENGTH_SIZE]);
                let channel = hex2int(&header_bytes[channel_off..channel_off + CHANNEL_SIZE]);

                match (size, channel) {
                    (Some(size), Some(channel)) if size > 0 && channel >= 0 => {
                        if size as usize > MAX_SERIAL_PAYLOAD {
                            warn!(
                                "ignoring huge serial packet: length={size} channel={channel}"
                            );
                            self.overflow = size as usize;
                            continue;
                        }
                        self.in_size = size as usize;
                        self.in_channel = channel;
                        self.need_header = false;
                        self.payload.reset(self.in_size);
                    }
                    _ => {
                        debug!("bad header: {:?}", String::from_utf8_lossy(&header_bytes));
                        continue;
                    }
                }
            }

            if !self.payload.fill(&mut from) {
                break;
            }

            out.push(Packet {
                channel: self.in_channel,
                payload: self.payload.filled().to_vec(),
            });
            self.need_header = true;
        }

        out
    }

    /// Encodes `msg` for `channel`, packetizing it to [`MAX_SERIAL_PAYLOAD`]
    /// chunks and prefixing each with a wire header. When `framing` is set
    /// a 4-hex-digit total-length sub-header precedes the first chunk, to be
    /// stripped back out by the receiving [`crate::client::Client`].
    pub fn encode(&self, channel: i32, framing: bool, msg: &[u8]) -> Vec<u8> {
        if msg.is_empty() || channel < 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut len = msg.len() + if framing { FRAME_HEADER_SIZE } else { 0 };
        let mut msg = msg;
        let mut framing = framing;

        while len > 0 {
            let mut avail = len.min(MAX_SERIAL_PAYLOAD);

            let mut header = [0u8; HEADER_SIZE];
            let (length_off, channel_off) = if self.version == Version::Legacy {
                (LEGACY_LENGTH_OFFSET, LEGACY_CHANNEL_OFFSET)
            } else {
                (LENGTH_OFFSET, CHANNEL_OFFSET)
            };
            int2hex(&mut header[length_off..length_off + LENGTH_SIZE], avail);
            int2hex(&mut header[channel_off..channel_off + CHANNEL_SIZE], channel as usize);
            out.extend_from_slice(&header);

            if framing {
                let mut frame = [0u8; FRAME_HEADER_SIZE];
                int2hex(&mut frame, msg.len());
                out.extend_from_slice(&frame);
                avail -= FRAME_HEADER_SIZE;
                len -= FRAME_HEADER_SIZE;
                framing = false;
            }

            out.extend_from_slice(&msg[..avail]);
            msg = &msg[avail..];
            len -= avail;
        }

        out
    }

    /// Persists the in-progress header/payload sinks by value, not just
    /// their used/size counters, so a snapshot taken mid-packet can
    /// reconstruct the exact bytes already received (matching
    /// `qemud_serial_save`, which writes the full `data0` buffer).
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u32(w, self.need_header as u32)?;
        write_u32(w, self.overflow as u32)?;
        write_u32(w, self.in_size as u32)?;
        write_u32(w, self.in_channel as u32)?;
        write_u32(w, self.version as u32)?;
        write_u32(w, self.header.size() as u32)?;
        write_bytes(w, self.header.used_slice())?;
        write_u32(w, self.payload.size() as u32)?;
        write_bytes(w, self.payload.used_slice())?;
        Ok(())
    }

    /// Rejects a snapshot whose header/payload buffer sizes don't match
    /// this build's limits instead of silently truncating or zero-filling
    /// them, matching `qemud_serial_load`'s `-EIO` on a size mismatch.
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.need_header = read_u32(r)? != 0;
        self.overflow = read_u32(r)? as usize;
        self.in_size = read_u32(r)? as usize;
        self.in_channel = read_u32(r)? as i32;
        self.version = match read_u32(r)? {
            1 => Version::Legacy,
            2 => Version::Normal,
            _ => Version::Unknown,
        };

        let header_size = read_u32(r)? as usize;
        let header_bytes = read_bytes(r)?;
        if header_size != HEADER_SIZE {
            return Err(SnapshotError::LengthOutOfRange { what: "serial header", len: header_size as u32 }.into());
        }
        self.header.reset(header_size);
        let mut slice = &header_bytes[..];
        self.header.fill(&mut slice);

        let payload_size = read_u32(r)? as usize;
        let payload_bytes = read_bytes(r)?;
        if payload_size > MAX_SERIAL_PAYLOAD {
            return Err(SnapshotError::LengthOutOfRange { what: "serial payload", len: payload_size as u32 }.into());
        }
        self.payload.reset(payload_size);
        let mut slice = &payload_bytes[..];
        self.payload.fill(&mut slice);

        Ok(())
    }
}

/// Parses exactly `bytes.len()` ASCII hex characters. Returns `None` on any
/// non-hex-digit, mirroring the original's "negative on error" convention.
pub(crate) fn hex2int(bytes: &[u8]) -> Option<i32> {
    let s = std::str::from_utf8(bytes).ok()?;
    i32::from_str_radix(s, 16).ok()
}

/// Writes `value` as `buf.len()` zero-padded lowercase hex digits.
pub(crate) fn int2hex(buf: &mut [u8], value: usize) {
    let s = format!("{:0width$x}", value, width = buf.len());
    let s = &s.as_bytes()[s.len() - buf.len()..];
    buf.copy_from_slice(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_packet() {
        let codec = SerialCodec::new(false);
        let wire = codec.encode(3, false, b"hello");
        assert_eq!(wire, b"000305hello");

        let mut rx = SerialCodec::new(false);
        let packets = rx.on_bytes(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel, 3);
        assert_eq!(packets[0].payload, b"hello");
    }

    #[test]
    fn splits_oversize_payload_across_packets() {
        let codec = SerialCodec::new(false);
        let msg = vec![b'x'; MAX_SERIAL_PAYLOAD + 10];
        let wire = codec.encode(1, false, &msg);

        let mut rx = SerialCodec::new(false);
        let packets = rx.on_bytes(&wire);
        let total: usize = packets.iter().map(|p| p.payload.len()).sum();
        assert_eq!(total, msg.len());
        assert!(packets.iter().all(|p| p.channel == 1));
    }

    #[test]
    fn feeding_bytes_one_at_a_time_still_reassembles() {
        let codec = SerialCodec::new(false);
        let wire = codec.encode(7, false, b"qemud");

        let mut rx = SerialCodec::new(false);
        let mut packets = Vec::new();
        for b in &wire {
            packets.extend(rx.on_bytes(std::slice::from_ref(b)));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"qemud");
    }

    #[test]
    fn overflow_is_skipped_silently() {
        let mut rx = SerialCodec::new(false);
        // header claims MAX_SERIAL_PAYLOAD + 1 bytes on channel 0
        let mut wire = Vec::new();
        wire.extend_from_slice(format!("{:02x}{:04x}", 0, MAX_SERIAL_PAYLOAD + 1).as_bytes());
        wire.extend(std::iter::repeat(b'z').take(MAX_SERIAL_PAYLOAD + 1));
        wire.extend_from_slice(b"000305abc"); // legit follow-up packet
        let packets = rx.on_bytes(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"abc");
    }

    #[test]
    fn legacy_probe_matches_known_bytes() {
        let probe = SerialCodec::legacy_probe();
        assert!(probe.starts_with(b"000100X000b00connect:gsm"));
        assert_eq!(probe.len(), 7 + 18 + 18 + 22 + 6 + 194);
    }

    #[test]
    fn legacy_daemon_is_detected_from_first_header() {
        let mut rx = SerialCodec::new(true);
        let packets = rx.on_bytes(b"001200");
        assert!(packets.is_empty());
        assert!(rx.is_legacy_daemon());
    }

    #[test]
    fn snapshot_round_trip_preserves_partial_payload() {
        let mut codec = SerialCodec::new(false);
        // header complete, payload only partially received
        codec.on_bytes(b"000305he");

        let mut buf = Vec::new();
        codec.save(&mut buf).unwrap();

        let mut restored = SerialCodec::new(false);
        let mut cursor = &buf[..];
        restored.load(&mut cursor).unwrap();

        let packets = restored.on_bytes(b"llo");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel, 3);
        assert_eq!(packets[0].payload, b"hello");
    }

    #[test]
    fn load_rejects_payload_size_over_max() {
        let mut codec = SerialCodec::new(false);
        let mut buf = Vec::new();
        write_u32(&mut buf, 1).unwrap(); // need_header
        write_u32(&mut buf, 0).unwrap(); // overflow
        write_u32(&mut buf, 0).unwrap(); // in_size
        write_u32(&mut buf, 0).unwrap(); // in_channel
        write_u32(&mut buf, 2).unwrap(); // version: Normal
        write_u32(&mut buf, HEADER_SIZE as u32).unwrap();
        write_bytes(&mut buf, &[0u8; HEADER_SIZE]).unwrap();
        write_u32(&mut buf, (MAX_SERIAL_PAYLOAD + 1) as u32).unwrap();
        write_bytes(&mut buf, &[0u8; 0]).unwrap();

        let mut cursor = &buf[..];
        assert!(codec.load(&mut cursor).is_err());
    }
}
