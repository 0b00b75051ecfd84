// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device link management: one long-lived _Modbus_ connection shared by
//! all polled registers.

use std::{fmt, io, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_modbus::{client::Context, prelude::*};

use crate::{
    decode,
    message::{ConfigPayload, RegisterConfig, Value},
    Error, Result,
};

/// Transport-specific constructor for the underlying _Modbus_ connection.
///
/// Selected once per configuration by the `mode` field; the connection
/// manager calls it again whenever the link has to be re-established.
#[async_trait]
trait DeviceLink: fmt::Debug + Send + Sync {
    async fn connect(&self) -> Result<Context>;
}

#[derive(Debug)]
struct TcpLink {
    address: String,
    timeout: Option<Duration>,
}

#[async_trait]
impl DeviceLink for TcpLink {
    async fn connect(&self) -> Result<Context> {
        let connecting = TcpStream::connect(&self.address);
        let stream = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| {
                    Error::Connect(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer from {} within {limit:?}", self.address),
                    ))
                })?,
            None => connecting.await,
        }
        .map_err(Error::Connect)?;
        Ok(tcp::attach(stream))
    }
}

#[cfg(feature = "rtu")]
#[derive(Debug)]
struct RtuLink {
    device: String,
    baud_rate: u32,
}

#[cfg(feature = "rtu")]
#[async_trait]
impl DeviceLink for RtuLink {
    async fn connect(&self) -> Result<Context> {
        // 8E1 is the Modbus line default
        let builder = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One);
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|err| Error::Connect(io::Error::new(io::ErrorKind::Other, err)))?;
        Ok(rtu::attach(stream))
    }
}

fn build_link(config: &ConfigPayload, timeout: Option<Duration>) -> Result<Box<dyn DeviceLink>> {
    match config.mode.as_str() {
        "tcp" => Ok(Box::new(TcpLink {
            address: config.address.clone(),
            timeout,
        })),
        #[cfg(feature = "rtu")]
        "rtu" => Ok(Box::new(RtuLink {
            device: config.address.clone(),
            baud_rate: config.baud_rate,
        })),
        other => Err(Error::UnsupportedMode(other.to_owned())),
    }
}

#[derive(Debug, Default)]
struct LinkState {
    context: Option<Context>,
    closed: bool,
}

/// A single long-lived connection to the _Modbus_ device population.
///
/// All reads are serialized through one mutex since the underlying
/// transports are not safe for concurrent transactions. A transport
/// failure marks the link disconnected and the next call performs exactly
/// one reconnect attempt, so recovery is paced by the polling interval
/// rather than by an internal retry loop.
#[derive(Debug)]
pub struct DeviceConnection {
    link: Box<dyn DeviceLink>,
    timeout: Option<Duration>,
    state: Mutex<LinkState>,
}

impl DeviceConnection {
    /// Builds the mode-specific link and performs the initial connect.
    pub async fn open(config: &ConfigPayload) -> Result<Self> {
        let timeout = match config.timeout_ms {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        };
        let link = build_link(config, timeout)?;
        let context = link.connect().await?;
        log::info!(
            "device link established: mode={} address={}",
            config.mode,
            config.address
        );
        Ok(Self {
            link,
            timeout,
            state: Mutex::new(LinkState {
                context: Some(context),
                closed: false,
            }),
        })
    }

    /// Reads and decodes one configured register.
    ///
    /// Holds the connection lock for the whole reconnect-read-decode
    /// sequence.
    pub async fn read_register(&self, reg: &RegisterConfig) -> Result<Value> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        let context = match state.context.take() {
            Some(context) => state.context.insert(context),
            None => {
                let context = self
                    .link
                    .connect()
                    .await
                    .map_err(|err| Error::Reconnect(Box::new(err)))?;
                log::info!("device link re-established");
                state.context.insert(context)
            }
        };

        context.set_slave(Slave(reg.device_id));
        match self.transact(context, reg).await {
            Ok(raw) => decode::decode_register(&raw, reg),
            Err(err) => {
                if matches!(err, Error::Read(_) | Error::Timeout(_)) {
                    // next call will attempt a reconnect
                    state.context = None;
                    log::warn!("device link lost: {err}");
                }
                Err(err)
            }
        }
    }

    /// Issues the function-code-specific read and returns the raw PDU data
    /// bytes.
    async fn transact(&self, context: &mut Context, reg: &RegisterConfig) -> Result<Vec<u8>> {
        match reg.function {
            1 => {
                let coils = self
                    .bounded(context.read_coils(reg.address, reg.quantity))
                    .await??
                    .map_err(Error::Exception)?;
                Ok(decode::pack_coils(&coils))
            }
            2 => {
                let inputs = self
                    .bounded(context.read_discrete_inputs(reg.address, reg.quantity))
                    .await??
                    .map_err(Error::Exception)?;
                Ok(decode::pack_coils(&inputs))
            }
            3 => {
                let words = self
                    .bounded(context.read_holding_registers(reg.address, reg.quantity))
                    .await??
                    .map_err(Error::Exception)?;
                Ok(decode::pack_words(&words))
            }
            4 => {
                let words = self
                    .bounded(context.read_input_registers(reg.address, reg.quantity))
                    .await??
                    .map_err(Error::Exception)?;
                Ok(decode::pack_words(&words))
            }
            other => Err(Error::UnsupportedFunction(other)),
        }
    }

    async fn bounded<T>(&self, transaction: impl std::future::Future<Output = T>) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, transaction)
                .await
                .map_err(|_| Error::Timeout(limit)),
            None => Ok(transaction.await),
        }
    }

    /// Whether the link is currently live.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.context.is_some()
    }

    /// Tears down the link. Safe to call more than once; all subsequent
    /// reads fail with [`Error::Closed`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        if let Some(mut context) = state.context.take() {
            if let Err(err) = context.disconnect().await {
                log::debug!("device link teardown: {err}");
            }
        }
    }
}
