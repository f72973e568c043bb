//! Self-describing JSON wire envelope.
//!
//! Every datagram carries one message: a `type` tag plus a small payload
//! of primitive fields. Unknown `type` tags must be dropped by the
//! receiver rather than treated as a decode error, so decoding is
//! two-phase: peek the tag out of a generic [`serde_json::Value`], then
//! deserialize the matching variant. A recognized tag with a missing or
//! ill-typed required field is a genuine [`ConcordError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConcordError, Pid};

/// Round numbers are a monotonically nondecreasing counter owned by the
/// leader and mirrored by followers.
pub type Round = u64;

/// One decoded protocol message. Field names match the wire table in the
/// external-interfaces section verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "HELLO")]
    Hello { from: Pid },

    #[serde(rename = "HELLO_ACK")]
    HelloAck {
        from: Pid,
        leader: Pid,
        round: Round,
    },

    #[serde(rename = "ELECTION")]
    Election { from: Pid },

    #[serde(rename = "OK")]
    Ok { from: Pid },

    #[serde(rename = "LEADER")]
    Leader {
        from: Pid,
        pid: Pid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<Round>,
    },

    #[serde(rename = "HB")]
    Heartbeat { from: Pid },

    #[serde(rename = "ROUND_QUERY")]
    RoundQuery { from: Pid },

    #[serde(rename = "ROUND_RESPONSE")]
    RoundResponse { from: Pid, round: Round },

    #[serde(rename = "ROUND_UPDATE")]
    RoundUpdate { from: Pid, round: Round },

    #[serde(rename = "START_CONSENSUS")]
    StartConsensus {
        from: Pid,
        round: Round,
        leader: Pid,
    },

    #[serde(rename = "VALUE")]
    Value {
        from: Pid,
        round: Round,
        value: u64,
    },

    #[serde(rename = "RESPONSE")]
    Response {
        from: Pid,
        round: Round,
        response: u64,
    },
}

impl Message {
    /// The sender PID carried by every message variant.
    pub fn from_pid(&self) -> Pid {
        match self {
            Message::Hello { from }
            | Message::HelloAck { from, .. }
            | Message::Election { from }
            | Message::Ok { from }
            | Message::Leader { from, .. }
            | Message::Heartbeat { from }
            | Message::RoundQuery { from }
            | Message::RoundResponse { from, .. }
            | Message::RoundUpdate { from, .. }
            | Message::StartConsensus { from, .. }
            | Message::Value { from, .. }
            | Message::Response { from, .. } => *from,
        }
    }

    /// The wire type tag, for logging.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::HelloAck { .. } => "HELLO_ACK",
            Message::Election { .. } => "ELECTION",
            Message::Ok { .. } => "OK",
            Message::Leader { .. } => "LEADER",
            Message::Heartbeat { .. } => "HB",
            Message::RoundQuery { .. } => "ROUND_QUERY",
            Message::RoundResponse { .. } => "ROUND_RESPONSE",
            Message::RoundUpdate { .. } => "ROUND_UPDATE",
            Message::StartConsensus { .. } => "START_CONSENSUS",
            Message::Value { .. } => "VALUE",
            Message::Response { .. } => "RESPONSE",
        }
    }
}

/// Known wire type tags, used only to tell "unrecognized type, drop
/// silently" apart from "recognized type, malformed payload".
const KNOWN_TYPES: &[&str] = &[
    "HELLO",
    "HELLO_ACK",
    "ELECTION",
    "OK",
    "LEADER",
    "HB",
    "ROUND_QUERY",
    "ROUND_RESPONSE",
    "ROUND_UPDATE",
    "START_CONSENSUS",
    "VALUE",
    "RESPONSE",
];

/// Encodes a message to its wire bytes. Never fails for a valid
/// [`Message`] value.
pub fn encode(msg: &Message) -> Vec<u8> {
    serde_json::to_vec(msg).expect("Message serialization is infallible")
}

/// Decodes one datagram. `Ok(None)` means the datagram parsed as JSON
/// but carries an unrecognized `type` tag and must be silently dropped
/// (forward compatibility). `Err` means the JSON itself was malformed,
/// or a recognized type is missing a required field.
pub fn decode(bytes: &[u8]) -> Result<Option<Message>, ConcordError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ConcordError::transient(format!("malformed datagram: {}", e)))?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ConcordError::transient("message missing type tag"))?;

    if !KNOWN_TYPES.contains(&tag) {
        return Ok(None);
    }

    let msg: Message = serde_json::from_value(value)
        .map_err(|e| ConcordError::transient(format!("malformed {} message: {}", tag, e)))?;
    Ok(Some(msg))
}
