// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures: an in-process stub Modbus device and a minimal
//! orchestrator session.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context as _, Result};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::oneshot,
    time::timeout,
};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server as ModbusServer},
};

use modbus_sidecar::{
    message::{DataPayload, IspMessage, MessageType, MetricsPayload, ResponsePayload},
    server::Server,
};

/// Aborts the wrapped server task when dropped.
pub struct TaskGuard {
    abort: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TaskGuard {
    /// Stops the task and waits for its orderly shutdown.
    pub async fn stop(mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
        self.task.abort();
    }
}

/// Holding registers served by the stub device; reads of absent addresses
/// answer with an illegal-data-address exception.
#[derive(Clone)]
pub struct StubDevice {
    holdings: Arc<Mutex<HashMap<u16, u16>>>,
}

impl StubDevice {
    pub fn new(holdings: &[(u16, u16)]) -> Self {
        Self {
            holdings: Arc::new(Mutex::new(holdings.iter().copied().collect())),
        }
    }

    pub fn set(&self, address: u16, value: u16) {
        self.holdings.lock().unwrap().insert(address, value);
    }
}

impl tokio_modbus::server::Service for StubDevice {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                let holdings = self.holdings.lock().unwrap();
                (addr..addr.saturating_add(cnt))
                    .map(|a| {
                        holdings
                            .get(&a)
                            .copied()
                            .ok_or(ExceptionCode::IllegalDataAddress)
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Response::ReadHoldingRegisters)
            }
            Request::ReadCoils(_, cnt) => Ok(Response::ReadCoils(vec![true; cnt as usize])),
            _ => Err(ExceptionCode::IllegalFunction),
        };
        future::ready(res)
    }
}

/// Runs the stub device on `address` (`"127.0.0.1:0"` for any port) until
/// the returned guard is stopped or dropped.
pub async fn spawn_stub_device(
    address: &str,
    device: StubDevice,
) -> Result<(SocketAddr, TaskGuard)> {
    let listener = TcpListener::bind(address).await?;
    let address = listener.local_addr()?;
    let (abort_tx, abort_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let server = ModbusServer::new(listener);
        let on_connected = move |stream, socket_addr| {
            let device = device.clone();
            async move {
                accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                    Ok(Some(device.clone()))
                })
            }
        };
        let on_process_error = |err| {
            eprintln!("stub device error: {err}");
        };
        let abort_signal = Box::pin(async move {
            abort_rx.await.ok();
        });
        let _ = server
            .serve_until(&on_connected, on_process_error, abort_signal)
            .await;
    });
    Ok((address, TaskGuard {
        abort: Some(abort_tx),
        task,
    }))
}

/// Runs a sidecar on an ephemeral port until the returned guard is stopped
/// or dropped.
pub async fn spawn_sidecar() -> Result<(SocketAddr, TaskGuard)> {
    spawn_sidecar_with(|server| server).await
}

pub async fn spawn_sidecar_with(
    configure: impl FnOnce(Server) -> Server,
) -> Result<(SocketAddr, TaskGuard)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let server = configure(Server::new(listener));
    let (abort_tx, abort_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = server
            .serve_until(async move {
                abort_rx.await.ok();
            })
            .await;
    });
    Ok((address, TaskGuard {
        abort: Some(abort_tx),
        task,
    }))
}

/// A minimal orchestrator: one TCP session speaking line-delimited JSON.
pub struct Orchestrator {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Orchestrator {
    pub async fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn send(&mut self, message: &serde_json::Value) -> Result<()> {
        self.send_line(&message.to_string()).await
    }

    /// The next message of any kind.
    pub async fn recv(&mut self, deadline: Duration) -> Result<IspMessage> {
        let mut line = String::new();
        let read = timeout(deadline, self.reader.read_line(&mut line))
            .await
            .context("read timed out")??;
        if read == 0 {
            bail!("connection closed");
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Skips messages until one of `kind` arrives.
    pub async fn recv_kind(&mut self, kind: MessageType, deadline: Duration) -> Result<IspMessage> {
        let started = std::time::Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                bail!("no {kind} message within {deadline:?}");
            }
            let message = self.recv(deadline - elapsed).await?;
            if message.kind == kind {
                return Ok(message);
            }
        }
    }

    /// Sends a request and returns the correlated response payload.
    pub async fn request(&mut self, message: &serde_json::Value) -> Result<ResponsePayload> {
        self.send(message).await?;
        let id = message["id"].as_str().unwrap_or_default().to_owned();
        let started = std::time::Instant::now();
        let deadline = Duration::from_secs(5);
        loop {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                bail!("no response for request {id:?}");
            }
            let response = self
                .recv_kind(MessageType::Response, deadline - elapsed)
                .await?;
            if response.id == id {
                return response_payload(&response);
            }
        }
    }
}

pub fn config_message(
    id: &str,
    device_address: SocketAddr,
    interval_ms: u64,
    registers: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "type": "CONFIG",
        "id": id,
        "timestamp": 1,
        "payload": {
            "mode": "tcp",
            "address": device_address.to_string(),
            "timeout_ms": 1000,
            "interval_ms": interval_ms,
            "registers": registers,
        }
    })
}

pub fn response_payload(message: &IspMessage) -> Result<ResponsePayload> {
    Ok(serde_json::from_value(
        message.payload.clone().context("missing payload")?,
    )?)
}

pub fn data_payload(message: &IspMessage) -> Result<DataPayload> {
    Ok(serde_json::from_value(
        message.payload.clone().context("missing payload")?,
    )?)
}

pub fn metrics_data(response: &ResponsePayload) -> Result<MetricsPayload> {
    Ok(serde_json::from_value(
        response.data.clone().context("missing data")?,
    )?)
}
