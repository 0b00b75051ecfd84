// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{io, time::Duration};

use thiserror::Error;

use tokio_modbus::ExceptionCode;

/// Error type for all sidecar operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration payload could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configured link mode is neither `tcp` nor `rtu`.
    #[error("unsupported link mode: {0:?}")]
    UnsupportedMode(String),

    /// Establishing the device link failed.
    #[error("failed to connect device link: {0}")]
    Connect(#[source] io::Error),

    /// Re-establishing a broken device link failed.
    ///
    /// Reconnect attempts are paced by the polling interval, so this is
    /// reported once per cycle while the device stays unreachable.
    #[error("reconnect failed: {0}")]
    Reconnect(#[source] Box<Error>),

    /// A register transaction failed on the transport level.
    #[error("register read failed: {0}")]
    Read(#[from] tokio_modbus::Error),

    /// A register transaction exceeded the configured timeout.
    #[error("register read timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered with a _Modbus_ exception.
    #[error("device exception: {0}")]
    Exception(ExceptionCode),

    /// The response carried fewer bytes than the declared register type needs.
    #[error("short read for type {kind:?}: got {actual} bytes, need {needed}")]
    ShortRead {
        /// Declared register type.
        kind: &'static str,
        /// Bytes the type requires.
        needed: usize,
        /// Bytes actually received.
        actual: usize,
    },

    /// The register declares a function code outside `1..=4`.
    #[error("unsupported function code: {0}")]
    UnsupportedFunction(u8),

    /// A session delivered a byte sequence that cannot be framed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The device connection was shut down; no further reads are accepted.
    #[error("device connection closed")]
    Closed,

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
