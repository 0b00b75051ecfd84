// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ISP wire protocol: the message envelope and payload shapes exchanged
//! with the host orchestrator, one JSON document per line.

use std::{collections::HashMap, fmt};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// `source` value stamped on every emitted data point.
pub const DATA_SOURCE: &str = "modbus-sidecar";

/// Wall clock in nanoseconds since the Unix epoch, the timestamp unit of
/// the protocol.
pub(crate) fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Discriminates the role of an [`IspMessage`].
///
/// Unknown type strings are preserved verbatim so the router can log and
/// ignore them without dropping the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Config,
    Data,
    Response,
    Status,
    Heartbeat,
    Metrics,
    Other(String),
}

impl From<String> for MessageType {
    fn from(from: String) -> Self {
        match from.as_str() {
            "CONFIG" => Self::Config,
            "DATA" => Self::Data,
            "RESPONSE" => Self::Response,
            "STATUS" => Self::Status,
            "HEARTBEAT" => Self::Heartbeat,
            "METRICS" => Self::Metrics,
            _ => Self::Other(from),
        }
    }
}

impl From<MessageType> for String {
    fn from(from: MessageType) -> Self {
        match from {
            MessageType::Config => "CONFIG".to_owned(),
            MessageType::Data => "DATA".to_owned(),
            MessageType::Response => "RESPONSE".to_owned(),
            MessageType::Status => "STATUS".to_owned(),
            MessageType::Heartbeat => "HEARTBEAT".to_owned(),
            MessageType::Metrics => "METRICS".to_owned(),
            MessageType::Other(other) => other,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// Envelope of every ISP exchange.
///
/// `id` correlates a request with its response and stays empty on
/// fire-and-forget messages (data, heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IspMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl IspMessage {
    /// An unsolicited data batch.
    pub fn data(points: Vec<DataPoint>) -> Self {
        Self {
            kind: MessageType::Data,
            id: String::new(),
            timestamp: now_nanos(),
            payload: encode_payload(&DataPayload { points }),
        }
    }

    /// The periodic liveness signal; carries no payload.
    pub fn heartbeat() -> Self {
        Self {
            kind: MessageType::Heartbeat,
            id: String::new(),
            timestamp: now_nanos(),
            payload: None,
        }
    }

    /// A reply correlated to the request that carried `id`.
    pub fn response(id: &str, payload: ResponsePayload) -> Self {
        Self {
            kind: MessageType::Response,
            id: id.to_owned(),
            timestamp: now_nanos(),
            payload: encode_payload(&payload),
        }
    }
}

/// Serialization of our own payload types cannot fail for any value the
/// sidecar produces; if it ever does, the message goes out bare rather
/// than not at all.
fn encode_payload<T: Serialize>(payload: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            log::error!("failed to encode payload: {err}");
            None
        }
    }
}

/// Device-link descriptor pushed by the orchestrator.
///
/// A later config message replaces the whole descriptor; there is no
/// partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub mode: String,
    pub address: String,
    #[serde(default, alias = "timeoutMS")]
    pub timeout_ms: u64,
    #[serde(default, alias = "intervalMS")]
    pub interval_ms: u64,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
    /// Serial line speed, only meaningful for `rtu` links.
    #[serde(default = "default_baud_rate", alias = "baudRate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    19_200
}

/// One polled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub address: u16,
    #[serde(default)]
    pub quantity: u16,
    /// Declared value type; echoed verbatim on every data point, even when
    /// unrecognized (unrecognized types decode like `uint16`).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// _Modbus_ function code: 1 = coils, 2 = discrete inputs,
    /// 3 = holding registers, 4 = input registers.
    #[serde(default)]
    pub function: u8,
    #[serde(default)]
    pub scale: f64,
    #[serde(default, alias = "deviceID")]
    pub device_id: u8,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

/// One sampled value, created fresh every poll cycle and discarded after
/// broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub key: String,
    pub source: String,
    pub timestamp: i64,
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub quality: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

/// Payload of a `DATA` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    pub points: Vec<DataPoint>,
}

/// Payload of a `RESPONSE` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponsePayload {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            success: true,
            error: String::new(),
            data: encode_payload(&data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            data: None,
        }
    }
}

/// Data carried by the reply to a `STATUS` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub name: String,
    pub running: bool,
    pub connected: bool,
    pub health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigPayload>,
}

/// Point-in-time metrics snapshot carried by the reply to a `METRICS`
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub data_points_collected: i64,
    pub errors_count: i64,
    /// Seconds since the server started.
    pub connection_uptime: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// Arithmetic mean over the retained latency window, in milliseconds.
    pub average_response_time: f64,
    pub start_time: i64,
    pub last_data_time: i64,
}
