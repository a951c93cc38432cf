//! jitter buffer for midi events
//!
//! Each frame carries the sender's synchronized clock reading.  With our own estimate
//! of the master clock we know how long the frame spent getting here, and we hold it
//! until `buffer_ms` after it was sent.  That keeps the spacing between events from
//! different senders intact even though the network delay wobbles.
//!
//! Two safety valves:
//! - a frame that is already later than the buffer plays immediately (never in the past)
//! - a wait longer than the skew ceiling almost always means the clock offset is wrong,
//!   so the frame plays immediately and we complain in the log
use log::{debug, warn};
use serde::Serialize;
use simple_error::bail;
use std::{cmp::Ordering, collections::BinaryHeap, fmt};

use crate::common::{box_error::BoxError, midi_packet::MidiFrame};

pub const DEFAULT_BUFFER_MS: f64 = 150.0;
pub const DEFAULT_SKEW_CEILING_MS: f64 = 1000.0;

/// read for every scheduled event, replaced wholesale when the operator changes it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulerConfig {
    pub buffer_ms: f64,
    pub skew_ceiling_ms: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            buffer_ms: DEFAULT_BUFFER_MS,
            skew_ceiling_ms: DEFAULT_SKEW_CEILING_MS,
        }
    }
}

impl SchedulerConfig {
    /// copy of this config with a new buffer
    pub fn with_buffer_ms(&self, buffer_ms: f64) -> Result<SchedulerConfig, BoxError> {
        if !buffer_ms.is_finite() || buffer_ms < 0.0 {
            bail!("invalid buffer: {}", buffer_ms);
        }
        Ok(SchedulerConfig {
            buffer_ms,
            skew_ceiling_ms: self.skew_ceiling_ms,
        })
    }
}

/// how a frame got scheduled
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayDecision {
    /// wait this many msec
    Buffered(f64),
    /// arrived after its buffer window, play now
    Late(f64),
    /// wait would have been this long, which smells like a sync fault.  Play now.
    SkewClamped(f64),
}

impl PlayDecision {
    /// the delay actually applied
    pub fn delay_ms(&self) -> f64 {
        match self {
            PlayDecision::Buffered(ms) => *ms,
            PlayDecision::Late(_) | PlayDecision::SkewClamped(_) => 0.0,
        }
    }
}

/// `buffer - (now - origin)` with the clamps applied
///
/// `master_now` is our estimate of the master's clock (local clock + offset).
pub fn time_to_play(master_now: f64, origin_timestamp_ms: f64, config: &SchedulerConfig) -> PlayDecision {
    let network_latency = master_now - origin_timestamp_ms;
    let time_to_play = config.buffer_ms - network_latency;
    if time_to_play.is_nan() {
        // garbage timestamp, don't hold it
        return PlayDecision::SkewClamped(time_to_play);
    }
    if time_to_play < 0.0 {
        return PlayDecision::Late(time_to_play);
    }
    if time_to_play > config.skew_ceiling_ms {
        return PlayDecision::SkewClamped(time_to_play);
    }
    PlayDecision::Buffered(time_to_play)
}

/// an event waiting for its presentation time
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub peer_id: String,
    pub frame: MidiFrame,
    /// local clock msec
    pub play_at_ms: f64,
    order: u64,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    // reversed so the BinaryHeap pops the earliest event first, ties in arrival order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .play_at_ms
            .total_cmp(&self.play_at_ms)
            .then_with(|| other.order.cmp(&self.order))
    }
}

pub struct PlaybackScheduler {
    config: SchedulerConfig,
    queue: BinaryHeap<ScheduledEvent>,
    next_order: u64,
    late: u64,
    clamped: u64,
}

impl PlaybackScheduler {
    pub fn new(config: SchedulerConfig) -> PlaybackScheduler {
        PlaybackScheduler {
            config,
            queue: BinaryHeap::new(),
            next_order: 0,
            late: 0,
            clamped: 0,
        }
    }
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }
    pub fn set_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
    pub fn get_late(&self) -> u64 {
        self.late
    }
    pub fn get_clamped(&self) -> u64 {
        self.clamped
    }
    /// local time of the next presentation, if anything is waiting
    pub fn next_due_ms(&self) -> Option<f64> {
        self.queue.peek().map(|e| e.play_at_ms)
    }

    /// queue a frame.  `master_now` is the synchronized clock, `local_now` the local one.
    pub fn schedule(
        &mut self,
        peer_id: &str,
        frame: MidiFrame,
        master_now: f64,
        local_now: f64,
    ) -> PlayDecision {
        let decision = time_to_play(master_now, frame.origin_timestamp_ms, &self.config);
        match decision {
            PlayDecision::Late(ms) => {
                self.late += 1;
                debug!("scheduler::schedule - {} late by {:.2}ms, playing now", peer_id, -ms);
            }
            PlayDecision::SkewClamped(ms) => {
                self.clamped += 1;
                warn!(
                    "scheduler::schedule - {} wants to wait {:.2}ms, clock sync looks off. playing now",
                    peer_id, ms
                );
            }
            PlayDecision::Buffered(_) => {}
        }
        self.queue.push(ScheduledEvent {
            peer_id: peer_id.to_string(),
            frame,
            play_at_ms: local_now + decision.delay_ms(),
            order: self.next_order,
        });
        self.next_order += 1;
        decision
    }

    /// everything whose time has come, earliest first
    pub fn pop_due(&mut self, local_now: f64) -> Vec<ScheduledEvent> {
        let mut due = vec![];
        while let Some(next) = self.queue.peek() {
            if next.play_at_ms > local_now {
                break;
            }
            if let Some(event) = self.queue.pop() {
                due.push(event);
            }
        }
        due
    }

    /// all notes off: throw away everything pending.  Returns how many were dropped.
    pub fn panic(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            warn!("scheduler::panic - dropped {} pending events", dropped);
        }
        dropped
    }
}

impl fmt::Display for PlaybackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ buffer: {:.1}, pending: {}, late: {}, clamped: {} }}",
            self.config.buffer_ms,
            self.queue.len(),
            self.late,
            self.clamped
        )
    }
}

#[cfg(test)]
mod test_scheduler {
    use super::*;

    fn frame(origin: f64, note: u8) -> MidiFrame {
        MidiFrame {
            sequence_id: 0,
            origin_timestamp_ms: origin,
            status: 0x90,
            data1: note,
            data2: 100,
        }
    }

    #[test]
    fn buffered_delay() {
        let config = SchedulerConfig::default();
        // 50ms on the wire with a 150 buffer leaves 100 to wait
        assert_eq!(time_to_play(1050.0, 1000.0, &config), PlayDecision::Buffered(100.0));
    }
    #[test]
    fn late_frames_clamp_to_now() {
        let config = SchedulerConfig::default().with_buffer_ms(150.0).unwrap();
        let d = time_to_play(1500.0, 1000.0, &config);
        assert_eq!(d, PlayDecision::Late(-350.0));
        assert_eq!(d.delay_ms(), 0.0);
    }
    #[test]
    fn huge_waits_clamp_to_now() {
        let config = SchedulerConfig::default();
        // origin 5 seconds in the future: offset is broken
        let d = time_to_play(1000.0, 6000.0, &config);
        assert_eq!(d, PlayDecision::SkewClamped(5150.0));
        assert_eq!(d.delay_ms(), 0.0);
        let d = time_to_play(1000.0, f64::NAN, &config);
        assert_eq!(d.delay_ms(), 0.0);
    }
    #[test]
    fn edge_of_the_ceiling_still_waits() {
        let config = SchedulerConfig::default();
        let d = time_to_play(1000.0, 1850.0, &config);
        assert_eq!(d, PlayDecision::Buffered(1000.0));
    }
    #[test]
    fn bad_buffer_rejected() {
        let config = SchedulerConfig::default();
        assert!(config.with_buffer_ms(-1.0).is_err());
        assert!(config.with_buffer_ms(f64::INFINITY).is_err());
        assert_eq!(config.with_buffer_ms(250.0).unwrap().buffer_ms, 250.0);
    }
    #[test]
    fn schedule_and_pop_in_time_order() {
        let mut sched = PlaybackScheduler::new(SchedulerConfig::default());
        // local and master clocks agree here
        sched.schedule("a", frame(1000.0, 60), 1020.0, 1020.0); // plays at 1150
        sched.schedule("b", frame(1010.0, 62), 1020.0, 1020.0); // plays at 1160
        sched.schedule("c", frame(500.0, 64), 1020.0, 1020.0); // late, plays at 1020
        assert_eq!(sched.pending(), 3);
        assert_eq!(sched.next_due_ms(), Some(1020.0));
        let now = sched.pop_due(1020.0);
        assert_eq!(now.len(), 1);
        assert_eq!(now[0].peer_id, "c");
        assert!(sched.pop_due(1149.0).is_empty());
        let rest = sched.pop_due(1160.0);
        let notes: Vec<u8> = rest.iter().map(|e| e.frame.data1).collect();
        assert_eq!(notes, vec![60, 62]);
        assert_eq!(sched.get_late(), 1);
    }
    #[test]
    fn ties_keep_arrival_order() {
        let mut sched = PlaybackScheduler::new(SchedulerConfig::default());
        for note in 0..5 {
            sched.schedule("a", frame(1000.0, note), 1000.0, 1000.0);
        }
        let notes: Vec<u8> = sched.pop_due(2000.0).iter().map(|e| e.frame.data1).collect();
        assert_eq!(notes, vec![0, 1, 2, 3, 4]);
    }
    #[test]
    fn local_clock_drives_play_time() {
        // follower clock is 30 behind the master
        let mut sched = PlaybackScheduler::new(SchedulerConfig::default());
        let d = sched.schedule("m", frame(1000.0, 60), 1040.0, 1010.0);
        assert_eq!(d, PlayDecision::Buffered(110.0));
        assert_eq!(sched.next_due_ms(), Some(1120.0));
    }
    #[test]
    fn panic_drops_everything() {
        let mut sched = PlaybackScheduler::new(SchedulerConfig::default());
        sched.schedule("a", frame(1000.0, 60), 1000.0, 1000.0);
        sched.schedule("a", frame(1000.0, 61), 1000.0, 1000.0);
        assert_eq!(sched.panic(), 2);
        assert_eq!(sched.pending(), 0);
        assert!(sched.pop_due(10_000.0).is_empty());
        println!("sched: {}", sched);
    }
}
