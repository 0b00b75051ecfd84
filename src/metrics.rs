// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Acquisition metrics: monotonic counters and a bounded window of recent
//! per-register read latencies.

use std::{collections::VecDeque, time::Instant};

use parking_lot::RwLock;

use crate::message::{self, MetricsPayload};

/// Number of most recent latency samples retained for averaging.
pub const RESPONSE_TIME_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct Counters {
    data_points: i64,
    errors: i64,
    last_error: String,
    response_times: VecDeque<f64>,
    average_response_time: f64,
}

/// Counters shared between the polling cycle and concurrent metrics
/// requests from sessions.
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    start_nanos: i64,
    counters: RwLock<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            start_nanos: message::now_nanos(),
            counters: RwLock::new(Counters {
                response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
                ..Counters::default()
            }),
        }
    }

    pub fn add_data_points(&self, count: i64) {
        self.counters.write().data_points += count;
    }

    pub fn record_error(&self, message: &str) {
        let mut counters = self.counters.write();
        counters.errors += 1;
        counters.last_error = message.to_owned();
    }

    /// Appends a latency sample in milliseconds, evicting the oldest sample
    /// beyond the window, and refreshes the running average.
    pub fn add_response_time(&self, millis: f64) {
        let mut counters = self.counters.write();
        counters.response_times.push_back(millis);
        if counters.response_times.len() > RESPONSE_TIME_WINDOW {
            counters.response_times.pop_front();
        }
        counters.average_response_time =
            counters.response_times.iter().sum::<f64>() / counters.response_times.len() as f64;
    }

    /// An immutable point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsPayload {
        let counters = self.counters.read();
        MetricsPayload {
            data_points_collected: counters.data_points,
            errors_count: counters.errors,
            connection_uptime: self.started_at.elapsed().as_secs() as i64,
            last_error: counters.last_error.clone(),
            average_response_time: counters.average_response_time,
            start_time: self.start_nanos,
            last_data_time: message::now_nanos(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
