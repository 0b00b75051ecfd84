// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A standalone acquisition sidecar bridging a host orchestrator to a
//! population of [Modbus](https://en.wikipedia.org/wiki/Modbus) devices,
//! based on [tokio](https://tokio.rs).
//!
//! The sidecar exposes a line-delimited JSON control protocol over TCP:
//! the orchestrator pushes a configuration describing the device link and
//! the register set to poll, and receives the sampled data points,
//! periodic liveness heartbeats, and on-demand status/metrics snapshots
//! in return. The device link survives read failures and reconnects
//! transparently, paced by the polling interval.

pub mod codec;
pub mod decode;
pub mod device;
mod error;
pub mod message;
pub mod metrics;
pub mod server;

pub use self::error::Error;

/// Result alias used by all fallible sidecar operations.
pub type Result<T> = std::result::Result<T, Error>;
