// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! Stable handles used instead of the original's intrusive linked-list
//! pointers: the `Multiplexer` is the single owner of both arenas, and
//! everything else refers to entries by handle. See Design Notes on
//! arena/handle-based ownership replacing cyclic references.

/// Identifies a live [`crate::client::Client`] inside a `Multiplexer`.
/// Never reused within a process's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(pub(crate) u64);

/// Identifies a registered service inside a `ServiceRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub(crate) usize);
