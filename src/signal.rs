//! Signaling: the reliable, ordered side channel used to set up data links
//!
//! The session only needs two things from it: deliver a small json message to a named
//! endpoint in the room, and tell us who is in the room.  The production version rides
//! a websocket chat room ([`websocket::RoomSignaling`]); [`local_hub::LocalSignalHub`]
//! does the same thing inside one process.
use crate::common::box_error::BoxError;

#[cfg(test)]
use mockall::automock;

pub mod local_hub;
pub mod room;
pub mod signal_message;
pub mod websocket;

use signal_message::SignalMessage;

/// what comes out of a signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    PeerJoined(String),
    PeerLeft(String),
    Message(SignalMessage),
}

#[cfg_attr(test, automock)]
pub trait SignalingChannel: Send {
    /// deliver a message to `msg.target` (or everyone for [`signal_message::BROADCAST_TARGET`])
    fn send(&mut self, msg: SignalMessage) -> Result<(), BoxError>;
    /// next event if there is one.  Never blocks.
    fn try_recv(&mut self) -> Option<SignalEvent>;
    /// everybody else currently in the room
    fn members(&self) -> Vec<String>;
}
