//! JSON envelope for the simulator's streaming WebSocket API.
//!
//! Every frame in either direction is a JSON object discriminated by a
//! `type` field:
//!
//! ```text
//! {"type": "...", "req_id": N, "params": {...}}   outbound request
//! {"type": "result", "req_id": N, "success": b}   acknowledgment
//! {"type": "...", "data": {...}}                  pushed update
//! ```
//!
//! Outbound requests are fire-and-forget: the `req_id` correlates the
//! later `result` frame for logging only, never for retry. Pushed updates
//! key their `data` map by remote id rendered as a decimal string.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

// ── Request payload entries ───────────────────────────────────────────────────

/// One `{id, index?}` entry in a subscribe or unsubscribe request.
///
/// A bare `id` streams the whole value (scalar or full array); `index`
/// narrows an array to the listed elements. The simulator then pushes a
/// dense array matching the subscribed index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatarefSubscription {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Vec<usize>>,
}

impl DatarefSubscription {
    /// Entry covering the whole value.
    pub fn whole(id: u64) -> Self {
        Self { id, index: None }
    }

    /// Entry covering selected array elements.
    pub fn elements(id: u64, index: Vec<usize>) -> Self {
        Self {
            id,
            index: Some(index),
        }
    }
}

/// One `{id, value, index?}` entry in a set request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatarefWrite {
    pub id: u64,
    /// Raw wire value; string-typed remote values are base64-encoded by
    /// the caller before they get here.
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// One `{id}` entry in a command subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRef {
    pub id: u64,
}

/// One `{id, is_active, duration?}` entry in a command activation request.
///
/// Plain execution sends `is_active: true` with `duration: 0.0`; a
/// long-press pair sends `is_active: true` then `is_active: false`, both
/// without a duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandActivation {
    pub id: u64,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// `params` of a dataref subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub datarefs: Vec<DatarefSubscription>,
}

/// `params` of a dataref set request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteParams {
    pub datarefs: Vec<DatarefWrite>,
}

/// `params` of a command subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParams {
    pub commands: Vec<CommandRef>,
}

/// `params` of a command activation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationParams {
    pub commands: Vec<CommandActivation>,
}

// ── Outbound requests ─────────────────────────────────────────────────────────

/// All frames this client sends over the streaming connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    DatarefSubscribeValues { req_id: u64, params: SubscribeParams },
    DatarefUnsubscribeValues { req_id: u64, params: SubscribeParams },
    DatarefSetValues { req_id: u64, params: WriteParams },
    CommandSubscribeIsActive { req_id: u64, params: CommandParams },
    CommandUnsubscribeIsActive { req_id: u64, params: CommandParams },
    CommandSetIsActive { req_id: u64, params: ActivationParams },
}

impl StreamRequest {
    pub fn subscribe_datarefs(req_id: u64, datarefs: Vec<DatarefSubscription>) -> Self {
        StreamRequest::DatarefSubscribeValues {
            req_id,
            params: SubscribeParams { datarefs },
        }
    }

    pub fn unsubscribe_datarefs(req_id: u64, datarefs: Vec<DatarefSubscription>) -> Self {
        StreamRequest::DatarefUnsubscribeValues {
            req_id,
            params: SubscribeParams { datarefs },
        }
    }

    pub fn set_datarefs(req_id: u64, datarefs: Vec<DatarefWrite>) -> Self {
        StreamRequest::DatarefSetValues {
            req_id,
            params: WriteParams { datarefs },
        }
    }

    pub fn subscribe_commands(req_id: u64, ids: impl IntoIterator<Item = u64>) -> Self {
        StreamRequest::CommandSubscribeIsActive {
            req_id,
            params: CommandParams {
                commands: ids.into_iter().map(|id| CommandRef { id }).collect(),
            },
        }
    }

    pub fn unsubscribe_commands(req_id: u64, ids: impl IntoIterator<Item = u64>) -> Self {
        StreamRequest::CommandUnsubscribeIsActive {
            req_id,
            params: CommandParams {
                commands: ids.into_iter().map(|id| CommandRef { id }).collect(),
            },
        }
    }

    pub fn activate_command(req_id: u64, id: u64, is_active: bool, duration: Option<f64>) -> Self {
        StreamRequest::CommandSetIsActive {
            req_id,
            params: ActivationParams {
                commands: vec![CommandActivation {
                    id,
                    is_active,
                    duration,
                }],
            },
        }
    }

    /// The correlation id this request was sent with.
    pub fn req_id(&self) -> u64 {
        match self {
            StreamRequest::DatarefSubscribeValues { req_id, .. }
            | StreamRequest::DatarefUnsubscribeValues { req_id, .. }
            | StreamRequest::DatarefSetValues { req_id, .. }
            | StreamRequest::CommandSubscribeIsActive { req_id, .. }
            | StreamRequest::CommandUnsubscribeIsActive { req_id, .. }
            | StreamRequest::CommandSetIsActive { req_id, .. } => *req_id,
        }
    }

    /// The wire `type` string, for request logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamRequest::DatarefSubscribeValues { .. } => "dataref_subscribe_values",
            StreamRequest::DatarefUnsubscribeValues { .. } => "dataref_unsubscribe_values",
            StreamRequest::DatarefSetValues { .. } => "dataref_set_values",
            StreamRequest::CommandSubscribeIsActive { .. } => "command_subscribe_is_active",
            StreamRequest::CommandUnsubscribeIsActive { .. } => "command_unsubscribe_is_active",
            StreamRequest::CommandSetIsActive { .. } => "command_set_is_active",
        }
    }
}

// ── Inbound replies ───────────────────────────────────────────────────────────

/// All frames the simulator pushes over the streaming connection.
///
/// Unknown `type` strings fail deserialization; the receiver logs and
/// drops such frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamReply {
    /// Acknowledgment of an earlier request, correlated by `req_id`.
    Result {
        #[serde(default)]
        req_id: Option<u64>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// New values for subscribed datarefs. A scalar subscription maps to
    /// a plain value, an array subscription to a dense value list in
    /// subscribed index order.
    DatarefUpdateValues {
        #[serde(deserialize_with = "id_keyed_map")]
        data: HashMap<u64, serde_json::Value>,
    },
    /// Active-state transitions for subscribed commands.
    CommandUpdateIsActive {
        #[serde(deserialize_with = "id_keyed_map")]
        data: HashMap<u64, bool>,
    },
}

/// Deserializes a map whose keys are remote ids rendered as decimal
/// strings. Internally-tagged enums buffer their content, which bypasses
/// serde_json's own string-to-integer key handling, so the parse is done
/// here.
fn id_keyed_map<'de, D, V>(deserializer: D) -> Result<HashMap<u64, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    let raw = HashMap::<String, V>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            key.parse::<u64>()
                .map(|id| (id, value))
                .map_err(|_| serde::de::Error::custom(format!("non-numeric remote id `{key}`")))
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
