//! Global-step sampling and training speed
//!
//! Keeps a sliding window of step samples. The autoscale decision
//! itself lives in the request multiplexer, which combines the sample
//! count here with the job timing thresholds from the configuration.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

const MAX_SAMPLES: usize = 100;

#[derive(Debug, Default)]
struct SpeedInner {
    /// (unix seconds, global step) samples, oldest first
    samples: VecDeque<(u64, u64)>,

    /// Samples collected since startup
    sample_count: usize,

    completed_global_step: u64,
}

/// Sliding window over reported global steps
#[derive(Debug, Default)]
pub struct SpeedMonitor {
    inner: Mutex<SpeedInner>,
}

impl SpeedMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step sample from a worker
    pub fn collect_global_step(&self, step: u64, timestamp: u64) {
        let mut inner = self.inner.lock();
        inner.samples.push_back((timestamp, step));
        if inner.samples.len() > MAX_SAMPLES {
            inner.samples.pop_front();
        }
        inner.sample_count += 1;
        inner.completed_global_step = inner.completed_global_step.max(step);
        debug!(step = step, timestamp = timestamp, "Collected global step");
    }

    /// Highest step any worker has reported
    pub fn completed_global_step(&self) -> u64 {
        self.inner.lock().completed_global_step
    }

    /// Samples collected since startup
    pub fn sample_count(&self) -> usize {
        self.inner.lock().sample_count
    }

    /// Steps per second over the window, 0.0 with fewer than two
    /// samples
    pub fn running_speed(&self) -> f64 {
        let inner = self.inner.lock();
        let (Some(&(t0, s0)), Some(&(t1, s1))) =
            (inner.samples.front(), inner.samples.back())
        else {
            return 0.0;
        };
        if t1 <= t0 || s1 <= s0 {
            return 0.0;
        }
        (s1 - s0) as f64 / (t1 - t0) as f64
    }
}
