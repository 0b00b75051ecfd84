// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session registry and outbound fan-out.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::message::IspMessage;

/// All currently connected control sessions, keyed by session id.
///
/// Fan-out takes the read lock so data broadcasts and heartbeats may
/// proceed concurrently; registration and removal take the write lock.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    sessions: RwLock<HashMap<String, UnboundedSender<IspMessage>>>,
}

impl ClientRegistry {
    pub(crate) fn insert(&self, id: String, outbound: UnboundedSender<IspMessage>) {
        self.sessions.write().insert(id, outbound);
    }

    pub(crate) fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Delivers `message` to every session. A failed delivery is logged
    /// and never affects the remaining sessions.
    pub(crate) fn broadcast(&self, message: &IspMessage) {
        let sessions = self.sessions.read();
        for (id, outbound) in sessions.iter() {
            if outbound.send(message.clone()).is_err() {
                log::warn!("session {id}: dropping {} message, writer is gone", message.kind);
            }
        }
    }

    /// Delivers `message` to a single session, if it is still registered.
    pub(crate) fn send_to(&self, id: &str, message: IspMessage) {
        let sessions = self.sessions.read();
        match sessions.get(id) {
            Some(outbound) => {
                if outbound.send(message).is_err() {
                    log::warn!("session {id}: dropping response, writer is gone");
                }
            }
            None => log::debug!("session {id}: gone before response delivery"),
        }
    }

    /// Drops every outbound handle, which ends all writer tasks and closes
    /// their sockets.
    pub(crate) fn clear(&self) {
        self.sessions.write().clear();
    }
}
