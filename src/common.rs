//! These modules are shared by every part of the session: the wire codec, config,
//! error alias and the small timing helpers.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod config;
pub mod midi_packet;
pub mod role;
pub mod stream_time_stat;

/// microseconds since the unix epoch
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// milliseconds since the unix epoch, with sub-millisecond precision
///
/// Every timestamp that goes on the wire is in this unit.
pub fn get_milli_time() -> f64 {
    get_micro_time() as f64 / 1000.0
}
