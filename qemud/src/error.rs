// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

use std::fmt;

/// Errors that can arise while decoding or replaying multiplexer state.
#[derive(Debug)]
pub enum Error {
    /// A malformed header, frame, or control message. These are never fatal:
    /// the caller logs and drops the offending bytes/packet.
    Protocol(ProtocolError),

    /// A snapshot stream did not contain what the current code expects
    /// (wrong length, unknown service, truncated record).
    Snapshot(SnapshotError),

    /// Errors returned by I/O failures while reading or writing a snapshot
    /// stream.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Snapshot(e) => write!(f, "snapshot error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<SnapshotError> for Error {
    fn from(e: SnapshotError) -> Self {
        Self::Snapshot(e)
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// A control channel message didn't match any known command grammar.
    UnknownCommand,

    /// `connect:` message missing the trailing `:<channel>` or malformed.
    MalformedConnect,

    /// `disconnect:` message's channel id wasn't a valid 2-hex-digit value.
    MalformedDisconnect,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::UnknownCommand => "unknown control command",
                Self::MalformedConnect => "malformed connect: message",
                Self::MalformedDisconnect => "malformed disconnect: message",
            }
        )
    }
}

#[derive(Debug)]
pub enum SnapshotError {
    /// A saved payload/string length exceeds what this build is willing to
    /// allocate.
    LengthOutOfRange { what: &'static str, len: u32 },

    /// A service named in the snapshot is not registered in this process.
    UnknownService(String),

    /// The control channel (0) was found in the saved client list, which
    /// should never happen: it is never persisted.
    ControlChannelSaved,

    /// A string that was supposed to be NUL-terminated wasn't.
    StringNotNulTerminated,
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthOutOfRange { what, len } => {
                write!(f, "{what} length {len} out of range")
            }
            Self::UnknownService(name) => write!(f, "unknown service \"{name}\""),
            Self::ControlChannelSaved => write!(f, "control channel client found in snapshot"),
            Self::StringNotNulTerminated => write!(f, "string in snapshot is not NUL-terminated"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
