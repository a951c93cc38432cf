//! rtjam_midi - Real Time Jam for midi
//!
//! provides library elements to build an endpoint that plays midi with other endpoints
//! over direct peer to peer links.  One endpoint in a room is the master.  Followers keep
//! their clocks in step with it and every received event is held in a jitter buffer so
//! the timing between players survives the network.
//!
//! The pieces, bottom up:
//! - [`common::midi_packet`] the 13 byte wire frame
//! - [`signal`] the room used to find peers and negotiate links
//! - [`link`] the data links and the per peer state machine
//! - [`clock`] clock offset estimation
//! - [`playback`] the jitter buffer
//! - [`session`] the facade the UI talks to
extern crate json;
#[macro_use]
extern crate num_derive;

pub mod clock;
pub mod common;
pub mod link;
pub mod playback;
pub mod session;
pub mod signal;
pub mod utils;
