//! estimate the offset between a follower's clock and the master's clock
//!
//! Followers probe the master with a SYNC_PING every couple of seconds.  The master
//! answers straight away with a SYNC_PONG carrying its own clock reading.  With the
//! three timestamps the follower computes
//!
//! ```text
//! rtt    = t3 - t0
//! offset = t1 - (t0 + rtt / 2)
//! ```
//!
//! which assumes the delay is the same in both directions.  The first sample, or any
//! sample that disagrees with the running value by more than the skew threshold, is
//! taken as is (a clock jump).  Everything else is smoothed so normal network noise
//! does not make playback wobble.
//!
//! The master never applies an offset to itself.
use log::{debug, info, warn};
use serde::Serialize;
use std::{fmt, sync::Arc};

use super::{sync_message::SyncMessage, Clock};
use crate::common::{role::Role, stream_time_stat::{IntervalTimer, StreamTimeStat}};

pub const DEFAULT_PING_INTERVAL_MS: f64 = 2000.0;
pub const DEFAULT_SKEW_THRESHOLD_MS: f64 = 1000.0;
/// weight given to the running estimate when a new sample arrives
pub const DEFAULT_HISTORY_WEIGHT: f64 = 0.8;
// number of rtt samples the jitter average spans
const JITTER_WINDOW: u64 = 16;

/// tunables for the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    pub ping_interval_ms: f64,
    pub skew_threshold_ms: f64,
    pub history_weight: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            skew_threshold_ms: DEFAULT_SKEW_THRESHOLD_MS,
            history_weight: DEFAULT_HISTORY_WEIGHT,
        }
    }
}

/// one ping/pong exchange.  Consumed as soon as it is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSyncSample {
    pub t0: f64,
    pub t1: f64,
    pub t3: f64,
}

impl ClockSyncSample {
    pub fn rtt(&self) -> f64 {
        self.t3 - self.t0
    }
    pub fn offset_estimate(&self) -> f64 {
        self.t1 - (self.t0 + self.rtt() / 2.0)
    }
}

/// running state.  An offset of 0 with `synced == false` means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockSyncState {
    pub role: Role,
    pub offset_ms: f64,
    pub rtt_ms: f64,
    pub synced: bool,
}

/// what the observer gets after every accepted sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncStats {
    pub rtt_ms: f64,
    pub offset_ms: f64,
    pub jitter_ms: f64,
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ rtt: {:.2}, offset: {:.2}, jitter: {:.2} }}",
            self.rtt_ms, self.offset_ms, self.jitter_ms
        )
    }
}

/// result of feeding a control message to the engine
#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    /// send this back to the peer the message came from
    Reply(SyncMessage),
    /// a new sample was folded in
    Updated(SyncStats),
    Ignored,
}

pub struct ClockSyncEngine {
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    state: ClockSyncState,
    rtt_stats: StreamTimeStat,
    // the master link we are probing (followers only)
    probe_target: Option<String>,
    ping_timer: IntervalTimer,
}

impl ClockSyncEngine {
    pub fn new(role: Role, clock: Arc<dyn Clock>, config: SyncConfig) -> ClockSyncEngine {
        let now = clock.now_ms();
        ClockSyncEngine {
            clock,
            config,
            state: ClockSyncState {
                role,
                offset_ms: 0.0,
                rtt_ms: 0.0,
                synced: false,
            },
            rtt_stats: StreamTimeStat::new(JITTER_WINDOW),
            probe_target: None,
            ping_timer: IntervalTimer::expired_at(now, config.ping_interval_ms),
        }
    }
    pub fn role(&self) -> Role {
        self.state.role
    }
    pub fn state(&self) -> ClockSyncState {
        self.state
    }
    pub fn offset_ms(&self) -> f64 {
        self.state.offset_ms
    }
    pub fn rtt_ms(&self) -> f64 {
        self.state.rtt_ms
    }
    pub fn is_synced(&self) -> bool {
        self.state.synced
    }
    pub fn probe_target(&self) -> Option<&str> {
        self.probe_target.as_deref()
    }
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            rtt_ms: self.state.rtt_ms,
            offset_ms: self.state.offset_ms,
            jitter_ms: self.rtt_stats.get_sigma(),
        }
    }
    /// the local clock
    pub fn local_now(&self) -> f64 {
        self.clock.now_ms()
    }
    /// estimate of the master's clock right now
    pub fn get_now(&self) -> f64 {
        self.local_now() + self.state.offset_ms
    }

    /// start probing a freshly opened link to the master.  No-op on the master.
    pub fn start_probing(&mut self, peer_id: &str) {
        if self.state.role.is_master() {
            return;
        }
        info!("clock_sync::start_probing - probing {}", peer_id);
        self.probe_target = Some(peer_id.to_string());
        // first ping goes out on the next poll
        self.ping_timer =
            IntervalTimer::expired_at(self.local_now(), self.config.ping_interval_ms);
    }
    /// link to the master went away.  The last estimate is kept but not updated.
    pub fn stop_probing(&mut self, peer_id: &str) {
        if self.probe_target.as_deref() == Some(peer_id) {
            info!("clock_sync::stop_probing - stopped probing {}", peer_id);
            self.probe_target = None;
        }
    }

    /// returns a ping to send (and to whom) when one is due
    pub fn poll(&mut self) -> Option<(String, SyncMessage)> {
        let target = self.probe_target.as_ref()?;
        let now = self.local_now();
        if !self.ping_timer.expired(now) {
            return None;
        }
        self.ping_timer.reset(now);
        Some((target.clone(), SyncMessage::Ping { t0: now }))
    }

    /// handle a control message from a peer
    pub fn handle_message(&mut self, from: &str, msg: &SyncMessage) -> SyncOutcome {
        match (self.state.role, msg) {
            (Role::Master, SyncMessage::Ping { t0 }) => SyncOutcome::Reply(SyncMessage::Pong {
                t0: *t0,
                t1: self.local_now(),
            }),
            (Role::Follower, SyncMessage::Pong { t0, t1 }) => {
                if self.probe_target.as_deref() != Some(from) {
                    debug!("clock_sync::handle_message - pong from {} ignored, not probing it", from);
                    return SyncOutcome::Ignored;
                }
                let sample = ClockSyncSample {
                    t0: *t0,
                    t1: *t1,
                    t3: self.local_now(),
                };
                match self.apply_sample(sample) {
                    Some(stats) => SyncOutcome::Updated(stats),
                    None => SyncOutcome::Ignored,
                }
            }
            (role, m) => {
                debug!("clock_sync::handle_message - {} ignored by {} (from {})", m, role, from);
                SyncOutcome::Ignored
            }
        }
    }

    /// fold one sample into the running estimate
    ///
    /// Samples with a negative round trip (pong older than its ping) are dropped.
    pub fn apply_sample(&mut self, sample: ClockSyncSample) -> Option<SyncStats> {
        if self.state.role.is_master() {
            return None;
        }
        let rtt = sample.rtt();
        if !rtt.is_finite() || rtt < 0.0 || !sample.t1.is_finite() {
            warn!("clock_sync::apply_sample - discarding bad sample: {:?}", sample);
            return None;
        }
        let estimate = sample.offset_estimate();
        if !self.state.synced {
            debug!("clock_sync::apply_sample - first offset {:.3}", estimate);
            self.state.offset_ms = estimate;
            self.state.synced = true;
        } else if (estimate - self.state.offset_ms).abs() > self.config.skew_threshold_ms {
            warn!(
                "clock_sync::apply_sample - clock jump, snapping offset {:.3} -> {:.3}",
                self.state.offset_ms, estimate
            );
            self.state.offset_ms = estimate;
        } else {
            let w = self.config.history_weight;
            self.state.offset_ms = w * self.state.offset_ms + (1.0 - w) * estimate;
        }
        self.state.rtt_ms = rtt;
        self.rtt_stats.add_sample(rtt);
        Some(self.stats())
    }
}

impl fmt::Display for ClockSyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ role: {}, synced: {}, offset: {:.3}, rtt: {:.3}, target: {:?} }}",
            self.state.role,
            self.state.synced,
            self.state.offset_ms,
            self.state.rtt_ms,
            self.probe_target
        )
    }
}
