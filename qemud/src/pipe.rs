// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! The contract between the multiplexer and the host-side pipe bridge.
//!
//! A real `AndroidPipe` implementation is outside this crate's scope (the
//! guest-side pipe bridge is a Non-goal); what belongs here is the pair of
//! interfaces the two sides use to talk to each other. The bridge *calls*
//! `Multiplexer::pipe_init`/`pipe_close_from_guest`/`pipe_send_buffers`/
//! `pipe_recv_buffers`/`pipe_poll` (so those are inherent methods on
//! `Multiplexer`, not part of a trait here); the multiplexer calls back
//! into the bridge through [`PipeHostBridge`].

/// Outbound calls the multiplexer makes into the host pipe bridge.
pub trait PipeHostBridge {
    /// Tell the bridge that queued data became available for `hwpipe`, so
    /// it should wake up any guest thread blocked reading it.
    fn signal_wake_read(&self, hwpipe: u64);

    /// Tell the bridge to tear down `hwpipe` (the client side initiated
    /// the close, not the guest).
    fn close(&self, hwpipe: u64);
}

/// Result of draining queued data into a guest-supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRecvResult {
    /// `n` bytes were copied into the caller's buffer.
    Read(usize),
    /// Nothing is queued right now; the guest should retry later.
    Again,
    /// The client closed from the host side; no more data will ever come.
    Closed,
}

/// Readiness flags returned by `Multiplexer::pipe_poll`, mirroring
/// `PIPE_POLL_IN`/`PIPE_POLL_OUT` in the original pipe API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipePollFlags {
    pub readable: bool,
    pub writable: bool,
}
