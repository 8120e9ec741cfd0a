// SPDX-FileCopyrightText: © 2025 VisionFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Execution timing for nodes and graphs.
//!
//! Every node execution and every graph frame is bracketed by
//! [`Perf::start`]/[`Perf::end`]. The [`PerfMonitor`] additionally keeps the
//! last few frame stamps per graph for tracing.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds since the process-wide monotonic epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn now_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Timing record. All values are nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perf {
    /// Duration of the last run.
    pub tmp: u64,
    pub beg: u64,
    pub end: u64,
    pub sum: u64,
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub num: u64,
}

impl Perf {
    #[inline]
    pub fn start(&mut self) {
        self.beg = now_ns();
    }

    /// Closes the bracket opened by [`start`](Self::start) and folds it into the totals.
    pub fn end(&mut self) {
        self.end = now_ns();
        self.record(self.end.saturating_sub(self.beg));
    }

    pub const fn record(&mut self, duration: u64) {
        self.tmp = duration;
        self.sum += duration;
        self.num += 1;
        self.avg = self.sum / self.num;
        if self.num == 1 || duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
    }
}

/// Begin/end stamps of one processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStamp {
    pub graph: u32,
    pub frame: u64,
    pub beg: u64,
    pub end: u64,
}

/// Ring of the most recent frame stamps.
#[derive(Debug)]
pub struct PerfMonitor {
    capacity: usize,
    frames: VecDeque<FrameStamp>,
}

impl PerfMonitor {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, frames: VecDeque::with_capacity(capacity) }
    }

    pub fn record_frame(&mut self, stamp: FrameStamp) {
        if self.capacity == 0 {
            return;
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(stamp);
    }

    pub fn frames(&self) -> Vec<FrameStamp> {
        self.frames.iter().copied().collect()
    }

    pub fn frames_of(&self, graph: u32) -> Vec<FrameStamp> {
        self.frames.iter().filter(|s| s.graph == graph).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_statistics() {
        let mut perf = Perf::default();
        perf.record(30);
        perf.record(10);
        perf.record(20);
        assert_eq!((perf.tmp, perf.sum, perf.num), (20, 60, 3));
        assert_eq!((perf.min, perf.max, perf.avg), (10, 30, 20));
    }

    #[test]
    fn test_bracket() {
        let mut perf = Perf::default();
        perf.start();
        perf.end();
        assert_eq!(perf.num, 1);
        assert!(perf.end >= perf.beg);
    }

    #[test]
    fn test_monitor_keeps_last_frames() {
        let mut monitor = PerfMonitor::new(2);
        for frame in 1..=3 {
            monitor.record_frame(FrameStamp { graph: 1, frame, beg: 0, end: 1 });
        }
        let frames: Vec<u64> = monitor.frames().iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![2, 3]);
        assert!(monitor.frames_of(2).is_empty());
    }
}
