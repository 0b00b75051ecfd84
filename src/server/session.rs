// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session read loop and inbound message routing.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};

use crate::{
    codec::IspCodec,
    device::DeviceConnection,
    message::{
        self, ConfigPayload, IspMessage, MessageType, ResponsePayload, StatusData,
    },
    server::State,
    Error, Result,
};

/// A session that stays silent longer than this is dropped. Generously
/// longer than the heartbeat cadence, so an orchestrator that does nothing
/// but answer heartbeats with its own keeps the session alive.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Registers the session and spawns its reader and writer tasks.
pub(crate) fn spawn(state: Arc<State>, session_id: String, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state.registry.insert(session_id.clone(), outbound_tx);
    tokio::spawn(write_loop(session_id.clone(), write_half, outbound_rx));
    tokio::spawn(read_loop(state, session_id, read_half));
}

/// Drains the outbound queue onto the socket. Ends when the session is
/// unregistered or the peer stops accepting writes.
async fn write_loop(
    session_id: String,
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<IspMessage>,
) {
    let mut framed = tokio_util::codec::FramedWrite::new(write_half, IspCodec::default());
    while let Some(message) = outbound.recv().await {
        if let Err(err) = framed.send(&message).await {
            log::warn!("session {session_id}: send failed: {err}");
            break;
        }
    }
}

async fn read_loop(state: Arc<State>, session_id: String, read_half: OwnedReadHalf) {
    let mut framed = tokio_util::codec::FramedRead::new(read_half, IspCodec::default());
    let mut shutdown = state.shutdown_signal();

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(SESSION_IDLE_TIMEOUT, framed.next()) => next,
        };
        match next {
            Err(_) => {
                log::info!(
                    "session {session_id}: idle for {}s, dropping",
                    SESSION_IDLE_TIMEOUT.as_secs()
                );
                break;
            }
            Ok(None) => {
                log::info!("session {session_id}: closed by peer");
                break;
            }
            Ok(Some(Err(err))) => {
                log::warn!("session {session_id}: {err}");
                break;
            }
            Ok(Some(Ok(message))) => dispatch(&state, &session_id, message).await,
        }
    }

    state.registry.remove(&session_id);
    log::info!("session {session_id}: unregistered");
}

/// Routes one inbound message by its declared type.
async fn dispatch(state: &Arc<State>, session_id: &str, message: IspMessage) {
    match message.kind {
        MessageType::Config => handle_config(state, session_id, &message).await,
        MessageType::Status => handle_status(state, session_id, &message).await,
        MessageType::Metrics => handle_metrics(state, session_id, &message),
        MessageType::Heartbeat => log::debug!("session {session_id}: heartbeat"),
        ref other => {
            log::warn!("session {session_id}: ignoring unexpected {other} message");
        }
    }
}

async fn handle_config(state: &Arc<State>, session_id: &str, message: &IspMessage) {
    let config = match parse_config(message) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            log::warn!("session {session_id}: {err}");
            state.registry.send_to(
                session_id,
                IspMessage::response(&message.id, ResponsePayload::failure(err.to_string())),
            );
            return;
        }
    };

    state.store_config(Arc::clone(&config));

    let connection = match DeviceConnection::open(&config).await {
        Ok(connection) => Arc::new(connection),
        Err(err) => {
            log::error!("device link setup failed: {err}");
            state.registry.send_to(
                session_id,
                IspMessage::response(
                    &message.id,
                    ResponsePayload::failure(format!("device link setup failed: {err}")),
                ),
            );
            return;
        }
    };
    state.install_device(connection).await;

    state.start_polling(Duration::from_millis(config.interval_ms));
    state.start_heartbeat();

    log::info!(
        "session {session_id}: configured mode={} address={} registers={} interval={}ms",
        config.mode,
        config.address,
        config.registers.len(),
        config.interval_ms
    );
    state.registry.send_to(
        session_id,
        IspMessage::response(&message.id, ResponsePayload::success("configuration accepted")),
    );
}

fn parse_config(message: &IspMessage) -> Result<ConfigPayload> {
    let payload = message
        .payload
        .clone()
        .ok_or_else(|| Error::Config("missing payload".to_owned()))?;
    let config: ConfigPayload =
        serde_json::from_value(payload).map_err(|err| Error::Config(err.to_string()))?;
    if config.interval_ms == 0 {
        return Err(Error::Config("interval_ms must be greater than zero".to_owned()));
    }
    Ok(config)
}

async fn handle_status(state: &Arc<State>, session_id: &str, message: &IspMessage) {
    let connected = match state.device() {
        Some(device) => device.is_connected().await,
        None => false,
    };
    let status = StatusData {
        name: message::DATA_SOURCE.to_owned(),
        running: state.is_running(),
        connected,
        health: "healthy".to_owned(),
        config: state.config().map(|config| (*config).clone()),
    };
    state.registry.send_to(
        session_id,
        IspMessage::response(&message.id, ResponsePayload::success(status)),
    );
}

fn handle_metrics(state: &Arc<State>, session_id: &str, message: &IspMessage) {
    let snapshot = state.metrics.snapshot();
    log::debug!(
        "session {session_id}: metrics requested, points={} errors={}",
        snapshot.data_points_collected,
        snapshot.errors_count
    );
    state.registry.send_to(
        session_id,
        IspMessage::response(&message.id, ResponsePayload::success(snapshot)),
    );
}
