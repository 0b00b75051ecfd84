// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP acceptor, server-wide state, and the acquisition schedulers.

mod registry;
mod session;

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use crate::{
    device::DeviceConnection,
    message::{self, ConfigPayload, DataPoint, IspMessage},
    metrics::Metrics,
};

use self::registry::ClientRegistry;

/// Cadence of the liveness message fanned out to every session.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The reason why [`Server::serve_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    /// The accept loop finished on its own.
    Finished,
    /// The abort future resolved and the server shut down orderly.
    Aborted,
}

/// Accepts ISP sessions on a bound listener and drives the sidecar.
///
/// All mutable state lives behind [`State`], so several servers can
/// coexist in one process (and in one test).
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    state: Arc<State>,
}

impl Server {
    /// Attaches a server to an already bound listener.
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(State::new(HEARTBEAT_INTERVAL)),
        }
    }

    /// Overrides the heartbeat cadence (optional).
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.state = Arc::new(State::new(interval));
        self
    }

    /// Serves sessions until the process dies.
    pub async fn serve(self) -> io::Result<()> {
        self.serve_until(std::future::pending()).await?;
        Ok(())
    }

    /// Serves sessions until `abort` resolves, then performs an orderly
    /// shutdown: schedulers stopped, device link closed, sessions dropped.
    pub async fn serve_until<A>(self, abort: A) -> io::Result<Terminated>
    where
        A: Future<Output = ()> + Send,
    {
        let Self { listener, state } = self;
        state.running.store(true, Ordering::SeqCst);
        if let Ok(address) = listener.local_addr() {
            log::info!("accepting ISP sessions on {address}");
        }

        tokio::pin!(abort);
        let terminated = tokio::select! {
            () = &mut abort => Terminated::Aborted,
            () = accept_loop(&listener, &state) => Terminated::Finished,
        };

        state.shutdown().await;
        Ok(terminated)
    }
}

/// Accepts sessions forever. A single failed accept is logged and must
/// not bring the server down.
async fn accept_loop(listener: &TcpListener, state: &Arc<State>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::error!("accept failed: {err}");
                continue;
            }
        };
        let session_id = format!("client-{}", message::now_nanos());
        log::info!("session {session_id}: connected from {peer}");
        session::spawn(Arc::clone(state), session_id, stream);
    }
}

/// Shared state of one sidecar instance: the active configuration and
/// device connection, the session registry, the metrics, and the two
/// scheduler tasks.
#[derive(Debug)]
pub(crate) struct State {
    config: RwLock<Option<Arc<ConfigPayload>>>,
    device: Mutex<Option<Arc<DeviceConnection>>>,
    registry: ClientRegistry,
    metrics: Metrics,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_interval: Duration,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl State {
    fn new(heartbeat_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: RwLock::new(None),
            device: Mutex::new(None),
            registry: ClientRegistry::default(),
            metrics: Metrics::new(),
            poll_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            heartbeat_interval,
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn config(&self) -> Option<Arc<ConfigPayload>> {
        self.config.read().clone()
    }

    pub(crate) fn device(&self) -> Option<Arc<DeviceConnection>> {
        self.device.lock().clone()
    }

    /// Replaces the active configuration wholesale.
    pub(crate) fn store_config(&self, config: Arc<ConfigPayload>) {
        *self.config.write() = Some(config);
    }

    /// Swaps in a freshly opened device connection and closes the previous
    /// one, so at most one link to the device population exists at a time.
    pub(crate) async fn install_device(&self, connection: Arc<DeviceConnection>) {
        let previous = self.device.lock().replace(connection);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// (Re)starts the polling scheduler. Any previous cadence is stopped
    /// first; cycles never overlap and a replaced configuration fully
    /// replaces the old schedule.
    pub(crate) fn start_polling(self: &Arc<Self>, interval: Duration) {
        let state = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                // re-armed only after the cycle completes, a slow cycle
                // delays rather than compounds the schedule
                tokio::time::sleep(interval).await;
                state.poll_cycle().await;
            }
        });
        if let Some(previous) = self.poll_task.lock().replace(task) {
            previous.abort();
        }
        log::info!("polling started: interval={}ms", interval.as_millis());
    }

    /// (Re)starts the heartbeat scheduler, independent of the polling
    /// cadence.
    pub(crate) fn start_heartbeat(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let interval = self.heartbeat_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let recipients = state.registry.len();
                state.registry.broadcast(&IspMessage::heartbeat());
                if recipients > 0 {
                    log::debug!("heartbeat sent to {recipients} sessions");
                }
            }
        });
        if let Some(previous) = self.heartbeat_task.lock().replace(task) {
            previous.abort();
        }
        log::info!("heartbeat started: interval={}s", interval.as_secs());
    }

    /// One pass over the configured register set, in declaration order.
    async fn poll_cycle(&self) {
        let Some(config) = self.config() else { return };
        let Some(device) = self.device() else { return };

        let cycle_started = Instant::now();
        let timestamp = message::now_nanos();
        let mut points = Vec::with_capacity(config.registers.len());

        for reg in &config.registers {
            let read_started = Instant::now();
            match device.read_register(reg).await {
                Ok(value) => {
                    self.metrics
                        .add_response_time(read_started.elapsed().as_secs_f64() * 1_000.0);
                    points.push(DataPoint {
                        key: reg.key.clone(),
                        source: message::DATA_SOURCE.to_owned(),
                        timestamp,
                        value,
                        kind: reg.kind.clone(),
                        quality: 1,
                        tags: reg.tags.clone(),
                    });
                }
                Err(err) => {
                    // one bad register never blocks the rest of the cycle
                    self.metrics.record_error(&err.to_string());
                    log::warn!("register {} (address {}): {err}", reg.key, reg.address);
                }
            }
        }

        if !points.is_empty() {
            self.metrics.add_data_points(points.len() as i64);
            log::debug!(
                "cycle complete: {} points in {:.1}ms",
                points.len(),
                cycle_started.elapsed().as_secs_f64() * 1_000.0
            );
            self.registry.broadcast(&IspMessage::data(points));
        }
    }

    /// Orderly shutdown: stop the schedulers, close the device link, end
    /// every session.
    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks = [self.poll_task.lock().take(), self.heartbeat_task.lock().take()];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        let device = self.device.lock().take();
        if let Some(device) = device {
            device.close().await;
        }
        let _ = self.shutdown_tx.send(true);
        self.registry.clear();
        log::info!("server stopped");
    }
}
