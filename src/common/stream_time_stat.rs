//! running statistics for a stream of timing samples, and a simple interval timer
//!
//! Both work in milliseconds (f64) since that is the unit every timestamp in the
//! session uses.
use serde::{Deserialize, Serialize};
use std::fmt;

/// running mean, mean absolute deviation ("jitter") and a decaying peak.
///
/// The window is the number of samples the average roughly spans.  The first sample
/// seeds the mean so early readings are not dragged toward zero.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamTimeStat {
    peak: f64,
    mean: f64,
    sigma: f64,
    window: u64,
    count: u64,
}

// peak falls back toward the mean by this fraction per sample
const PEAK_DECAY: f64 = 0.05;

impl StreamTimeStat {
    pub fn new(window_size: u64) -> StreamTimeStat {
        StreamTimeStat {
            peak: 0.0,
            mean: 0.0,
            sigma: 0.0,
            window: window_size.max(1),
            count: 0,
        }
    }
    pub fn clear(&mut self) {
        self.peak = 0.0;
        self.mean = 0.0;
        self.sigma = 0.0;
        self.count = 0;
    }
    pub fn get_peak(&self) -> f64 {
        self.peak
    }
    pub fn get_mean(&self) -> f64 {
        self.mean
    }
    pub fn get_sigma(&self) -> f64 {
        self.sigma
    }
    pub fn get_window(&self) -> u64 {
        self.window
    }
    pub fn get_count(&self) -> u64 {
        self.count
    }

    pub fn add_sample(&mut self, sample: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = sample;
            self.peak = sample;
            self.sigma = 0.0;
            return;
        }
        if sample > self.peak {
            self.peak = sample;
        } else {
            self.peak -= (self.peak - self.mean) * PEAK_DECAY;
        }
        let n = self.count.min(self.window) as f64;
        let deviation = (sample - self.mean).abs();
        self.mean += (sample - self.mean) / n;
        self.sigma += (deviation - self.sigma) / n;
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peak: {:.2}, mean: {:.2}, sigma: {:.2} window: {} }}",
            self.peak, self.mean, self.sigma, self.window
        )
    }
}


/// fires once every interval.  Times are whatever msec clock the caller uses.
pub struct IntervalTimer {
    last_time: f64,
    interval: f64,
}

impl IntervalTimer {
    pub fn new(now: f64, interval: f64) -> IntervalTimer {
        IntervalTimer {
            last_time: now,
            interval,
        }
    }
    /// a timer that is already expired (first check fires right away)
    pub fn expired_at(now: f64, interval: f64) -> IntervalTimer {
        IntervalTimer {
            last_time: now - interval - 1.0,
            interval,
        }
    }
    pub fn get_interval(&self) -> f64 {
        self.interval
    }
    pub fn set_interval(&mut self, interval: f64) {
        self.interval = interval;
    }
    pub fn expired(&self, now: f64) -> bool {
        (self.last_time + self.interval) < now
    }
    pub fn reset(&mut self, now: f64) {
        self.last_time = now;
    }
    pub fn since(&self, now: f64) -> f64 {
        now - self.last_time
    }
}

#[cfg(test)]
mod test_interval_timer {
    use super::*;

    #[test]
    fn test_expiration() {
        let mut now = 1000.0;
        let mut mt = IntervalTimer::new(now, 100.0);
        assert!(!mt.expired(now));
        now += 99.0;
        assert!(!mt.expired(now));
        now += 2.0;
        assert!(mt.expired(now));
        mt.reset(now);
        assert!(!mt.expired(now));
        assert_eq!(mt.since(now + 10.0), 10.0);
        mt.set_interval(9.0);
        now += 10.0;
        assert!(mt.expired(now));
    }
    #[test]
    fn starts_expired() {
        let mt = IntervalTimer::expired_at(500.0, 2000.0);
        assert!(mt.expired(500.0));
    }
}
