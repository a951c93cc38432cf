//! the envelope every signaling message travels in
//!
//! `{"type": "offer"|"answer"|"candidate"|"hello"|"bye", "from": id, "target": id, "payload": ...}`
//!
//! The payload is whatever the link transport wants to say (a link description or a
//! candidate); signaling never looks inside it.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::common::box_error::BoxError;

/// target that means "everybody in the room"
pub const BROADCAST_TARGET: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
    /// presence: "I am in the room"
    Hello,
    /// presence: "I am leaving"
    Bye,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::Candidate => "candidate",
            SignalType::Hello => "hello",
            SignalType::Bye => "bye",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub from: String,
    pub target: String,
    #[serde(default)]
    pub payload: Value,
}

impl SignalMessage {
    pub fn new(kind: SignalType, from: &str, target: &str, payload: Value) -> SignalMessage {
        SignalMessage {
            kind,
            from: from.to_string(),
            target: target.to_string(),
            payload,
        }
    }
    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }
    pub fn from_string(data: &str) -> Result<SignalMessage, BoxError> {
        Ok(serde_json::from_str(data)?)
    }
    pub fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for SignalMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ type: {}, from: {}, target: {}, payload: {} }}",
            self.kind, self.from, self.target, self.payload
        )
    }
}
