// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! Big-endian primitives used to save/load multiplexer state, in the shape
//! of `rpc_protocol`'s own `stream_record_mark`/`update_record_mark` helpers:
//! small free functions over a generic stream rather than a trait object.

use crate::error::{Result, SnapshotError};
use std::io::{Read, Write};

/// Caps how large a single saved string/buffer we're willing to allocate on
/// load. Saved state comes from this same process, so anything beyond this
/// indicates a corrupt or foreign snapshot.
const MAX_SNAPSHOT_ITEM: u32 = 16 * 1024 * 1024;

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_bytes<W: Write>(w: &mut W, buf: &[u8]) -> std::io::Result<()> {
    write_u32(w, buf.len() as u32)?;
    w.write_all(buf)
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)?;
    if len > MAX_SNAPSHOT_ITEM {
        return Err(SnapshotError::LengthOutOfRange { what: "buffer", len }.into());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a NUL-terminated string, length-prefixed including the
/// terminator, matching `stream_put_string`/`qemud_service_save_name`.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    let len = s.len() as u32 + 1;
    write_u32(w, len)?;
    w.write_all(s.as_bytes())?;
    w.write_all(&[0u8])
}

/// Reads back a string written by [`write_string`], dropping the trailing
/// NUL.
pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u32(r)?;
    if len == 0 || len > MAX_SNAPSHOT_ITEM {
        return Err(SnapshotError::LengthOutOfRange { what: "string", len }.into());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    if buf.pop() != Some(0) {
        return Err(SnapshotError::StringNotNulTerminated.into());
    }
    String::from_utf8(buf).map_err(|_| SnapshotError::StringNotNulTerminated.into())
}
