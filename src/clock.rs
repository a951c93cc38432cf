//! Clocks and the clock synchronization between followers and the master
//!
//! Everything here works in milliseconds as f64.  A [`Clock`] is the local time
//! source, [`clock_sync::ClockSyncEngine`] turns it into an estimate of the
//! master's clock.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::common::get_micro_time;

pub mod clock_sync;
pub mod sync_message;

/// source of local time in msec
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        get_micro_time() as f64 / 1000.0
    }
}

/// a clock that only moves when told to.  Clones share the same time.
///
/// Used to drive sessions deterministically (tests, offline replays).
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> ManualClock {
        ManualClock {
            micros: Arc::new(AtomicU64::new(Self::to_micros(start_ms))),
        }
    }
    pub fn set_ms(&self, now_ms: f64) {
        self.micros.store(Self::to_micros(now_ms), Ordering::SeqCst);
    }
    pub fn advance_ms(&self, delta_ms: f64) {
        self.set_ms(self.now_ms() + delta_ms);
    }
    fn to_micros(ms: f64) -> u64 {
        (ms.max(0.0) * 1000.0).round() as u64
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

#[cfg(test)]
mod test_clock {
    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new(1000.0);
        let other = clock.clone();
        clock.advance_ms(40.5);
        assert_eq!(other.now_ms(), 1040.5);
        other.set_ms(5.0);
        assert_eq!(clock.now_ms(), 5.0);
    }
    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1.0e12);
    }
}
