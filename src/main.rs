// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sidecar entry point: bind the ISP listener, serve until interrupted.

use std::{env, io};

use tokio::net::TcpListener;

use modbus_sidecar::server::Server;

/// TCP port used when `ISP_PORT` is not set.
const DEFAULT_PORT: &str = "50052";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let port = env::var("ISP_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_owned());
    let address = format!("0.0.0.0:{port}");

    let listener = TcpListener::bind(&address).await?;
    log::info!("modbus sidecar listening on {address}");

    Server::new(listener).serve_until(shutdown_signal()).await?;

    log::info!("modbus sidecar stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = interrupt => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            log::warn!("cannot install SIGTERM handler: {err}");
            let _ = interrupt.await;
        }
    }
    log::info!("shutdown signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received");
}
