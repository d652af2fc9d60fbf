//! Wire-format types shared by both transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One protocol message, in either direction.
///
/// `id` is the sender's own sequence number. `requestId`, when set, names
/// the `id` of the earlier message this one answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Sender-assigned sequence number.
    pub id: u64,
    /// Id of the message being answered, if any.
    #[serde(default)]
    pub request_id: Option<u64>,
    /// Method name (e.g. `nodeChannelWatch`).
    pub method: String,
    /// Method parameters.
    #[serde(default = "empty_params")]
    pub params: Value,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(id: u64, request_id: Option<u64>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            request_id,
            method: method.into(),
            params,
        }
    }
}

/// Params of an `error` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `CHANNEL_NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Method of the request that failed.
    pub method: String,
}

/// Successful answer produced by a handler, sent back with
/// `requestId` set to the request's `id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Method name of the answer.
    pub method: &'static str,
    /// Answer payload.
    pub params: Value,
}

impl Reply {
    /// Build a reply.
    pub fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }
}
