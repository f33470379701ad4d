// src/runtime/throughput.rs
//! Generations-per-second measurement
//!
//! Ticks accumulate generations into a window; once the window has spanned
//! at least a second, a rate is published and the window starts over. The
//! rate counts generations, not ticks, so it does not depend on batch size.

use std::time::{Duration, Instant};

/// Minimum window span before a rate is published
pub const WINDOW: Duration = Duration::from_secs(1);

/// Open measurement window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    pub window_start: Instant,
    pub generations: u64,
}

/// Sliding-window throughput meter
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    sample: ThroughputSample,
    last_rate: Option<u32>,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            sample: ThroughputSample {
                window_start: now,
                generations: 0,
            },
            last_rate: None,
        }
    }

    /// Start measuring a new session at `now`; the previous rate is dropped
    pub fn restart(&mut self, now: Instant) {
        self.open_window(now);
        self.last_rate = None;
    }

    fn open_window(&mut self, now: Instant) {
        self.sample = ThroughputSample {
            window_start: now,
            generations: 0,
        };
    }

    /// Account for one tick; returns the rate when a window closes
    pub fn record_tick(&mut self, generations: u64, now: Instant) -> Option<u32> {
        self.sample.generations += generations;

        let elapsed = now.saturating_duration_since(self.sample.window_start);
        if elapsed < WINDOW {
            return None;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let rate = (self.sample.generations as f64 * 1000.0 / elapsed_ms).round();
        self.open_window(now);

        if !rate.is_finite() || rate < 0.0 {
            return None;
        }

        let rate = rate.min(u32::MAX as f64) as u32;
        self.last_rate = Some(rate);
        Some(rate)
    }

    /// Most recently published rate
    pub fn rate(&self) -> Option<u32> {
        self.last_rate
    }

    pub fn sample(&self) -> ThroughputSample {
        self.sample
    }
}
