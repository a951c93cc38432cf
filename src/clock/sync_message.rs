//! control messages used to measure round trip time and clock offset
//!
//! These travel as small json datagrams on the same link as the midi frames.  A
//! frame is always exactly 13 bytes and these are always longer, so the receiver can
//! tell them apart by size.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{box_error::BoxError, midi_packet::FRAME_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// follower -> master, t0 is the follower's local clock at send
    #[serde(rename = "SYNC_PING")]
    Ping { t0: f64 },
    /// master -> follower, t0 echoed back, t1 is the master's clock at reply
    #[serde(rename = "SYNC_PONG")]
    Pong { t0: f64, t1: f64 },
}

impl SyncMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(self)?)
    }
    pub fn from_bytes(data: &[u8]) -> Result<SyncMessage, BoxError> {
        if data.len() <= FRAME_SIZE {
            simple_error::bail!("too short for a sync message: {} bytes", data.len());
        }
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncMessage::Ping { t0 } => write!(f, "{{ SYNC_PING t0: {:.3} }}", t0),
            SyncMessage::Pong { t0, t1 } => {
                write!(f, "{{ SYNC_PONG t0: {:.3}, t1: {:.3} }}", t0, t1)
            }
        }
    }
}
