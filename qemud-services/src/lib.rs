// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

//! Reference service implementations for the `qemud` multiplexer: the two
//! services shipped with the original daemon, `boot-properties` and
//! `hw-control`.

pub mod boot_properties;
pub mod hw_control;

pub use boot_properties::{BootPropertiesService, BootResetHook, NoopBootResetHook, PropertyError};
pub use hw_control::HwControlService;
