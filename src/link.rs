//! Data links: one unreliable, unordered datagram channel per remote peer
//!
//! A [`LinkTransport`] knows how to make links and negotiate them (offer, answer,
//! candidates).  The payloads it moves are opaque bytes.  [`peer_manager::PeerLinkManager`]
//! owns the links and runs the per-peer state machine on top.
//!
//! Two transports ship with the crate:
//! - [`udp_link::UdpTransport`] plain UDP sockets, the one used on a real network
//! - [`loopback::LoopbackNetwork`] links inside one process
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::common::box_error::BoxError;

pub mod loopback;
pub mod peer_manager;
pub mod udp_link;

static LINK_IDS: AtomicU64 = AtomicU64::new(1);

/// id for a new link object, unique in this process
pub fn next_link_id() -> u64 {
    LINK_IDS.fetch_add(1, Ordering::Relaxed)
}

/// `negotiating -> open -> closed`.  A closed peer is removed right after it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Negotiating,
    Open,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LinkState::Negotiating => "negotiating",
            LinkState::Open => "open",
            LinkState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// things a link reports when polled
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// the link can carry data now
    Open,
    Data(Vec<u8>),
    /// a local candidate the remote side should hear about (goes out over signaling)
    LocalCandidate(Value),
    /// the link failed or the far end went away
    Closed(String),
}

/// one end of a data link
pub trait DataLink: Send {
    /// unique (per process) id of this link object
    fn link_id(&self) -> u64;
    /// best effort send.  Errors when the link is not open.
    fn send(&mut self, payload: &[u8]) -> Result<(), BoxError>;
    /// apply the remote side's offer or answer
    fn set_remote_description(&mut self, description: &Value) -> Result<(), BoxError>;
    fn has_remote_description(&self) -> bool;
    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<(), BoxError>;
    /// drive the link.  Never blocks.
    fn poll(&mut self, now_ms: f64) -> Vec<LinkEvent>;
    fn close(&mut self);
}

/// makes and negotiates links
pub trait LinkTransport: Send {
    fn name(&self) -> &str;
    /// initiator side: a new link plus the offer to signal to `peer_id`
    fn create_offer(&mut self, peer_id: &str) -> Result<(Box<dyn DataLink>, Value), BoxError>;
    /// callee side: a new link built from `offer` plus the answer to signal back
    fn accept_offer(
        &mut self,
        peer_id: &str,
        offer: &Value,
    ) -> Result<(Box<dyn DataLink>, Value), BoxError>;
}
