//! Dispatch-point statistics: counters and bounded sample windows, global and
//! per function.
//!
//! The whole block lives behind the call-table mutex, so nothing here is
//! atomic. Timestamp-carrying updates bump a tied clock reading to `last + 1`
//! so `last_request_timestamp` stays strictly increasing.

use std::collections::HashMap;

use serde::Serialize;

const SAMPLE_WINDOW_SIZE: usize = 1024;

/// Fixed-size ring of the most recent samples with percentile snapshots.
#[derive(Debug)]
pub struct SampleWindow {
    samples: Vec<f64>,
    next: usize,
    total: u64,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            next: 0,
            total: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if self.samples.len() < SAMPLE_WINDOW_SIZE {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
        }
        self.next = (self.next + 1) % SAMPLE_WINDOW_SIZE;
        self.total += 1;
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        if self.samples.is_empty() {
            return WindowSnapshot::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let len = sorted.len();
        WindowSnapshot {
            count: self.total,
            avg: sorted.iter().sum::<f64>() / len as f64,
            p50: sorted[len * 50 / 100],
            p95: sorted[len * 95 / 100],
            p99: sorted[len * 99 / 100],
        }
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct WindowSnapshot {
    /// Total samples ever recorded (the window keeps only the most recent).
    pub count: u64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Gateway-wide dispatch statistics.
#[derive(Debug)]
pub struct StatsBlock {
    pub incoming_requests: u64,
    last_request_timestamp: i64,
    pub request_interval: SampleWindow,
    pub requests_instant_rps: SampleWindow,
    pub inflight_requests: SampleWindow,
    pub running_requests: SampleWindow,
    pub queueing_delay: SampleWindow,
    pub dispatch_overhead: SampleWindow,
}

impl StatsBlock {
    pub fn new() -> Self {
        Self {
            incoming_requests: 0,
            last_request_timestamp: -1,
            request_interval: SampleWindow::new(),
            requests_instant_rps: SampleWindow::new(),
            inflight_requests: SampleWindow::new(),
            running_requests: SampleWindow::new(),
            queueing_delay: SampleWindow::new(),
            dispatch_overhead: SampleWindow::new(),
        }
    }

    /// Records one incoming request at monotonic time `now` (µs).
    ///
    /// Returns the adjusted timestamp: when the clock reads the same
    /// microsecond twice, the second reading is bumped to `last + 1`.
    pub fn tick_incoming(&mut self, now: i64) -> i64 {
        self.incoming_requests += 1;
        let mut ts = now;
        if ts <= self.last_request_timestamp {
            ts = self.last_request_timestamp + 1;
        }
        if self.last_request_timestamp >= 0 {
            let interval = ts - self.last_request_timestamp;
            self.request_interval.add_sample(interval as f64);
            self.requests_instant_rps.add_sample(1e6 / interval as f64);
        }
        self.last_request_timestamp = ts;
        ts
    }

    pub fn last_request_timestamp(&self) -> i64 {
        self.last_request_timestamp
    }
}

/// Per-function statistics, created lazily on a function's first call.
#[derive(Debug)]
pub struct PerFuncStats {
    pub incoming_requests: u64,
    last_request_timestamp: i64,
    pub request_interval: SampleWindow,
    pub end2end_delay: SampleWindow,
}

impl PerFuncStats {
    pub fn new() -> Self {
        Self {
            incoming_requests: 0,
            last_request_timestamp: -1,
            request_interval: SampleWindow::new(),
            end2end_delay: SampleWindow::new(),
        }
    }

    /// Same strictly-increasing-timestamp contract as
    /// [`StatsBlock::tick_incoming`], per function.
    pub fn tick_incoming(&mut self, now: i64) {
        self.incoming_requests += 1;
        let mut ts = now;
        if ts <= self.last_request_timestamp {
            ts = self.last_request_timestamp + 1;
        }
        if self.last_request_timestamp >= 0 {
            self.request_interval
                .add_sample((ts - self.last_request_timestamp) as f64);
        }
        self.last_request_timestamp = ts;
    }

    pub fn last_request_timestamp(&self) -> i64 {
        self.last_request_timestamp
    }
}

impl Default for PerFuncStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of the whole stats block, served by `GET /metrics`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub incoming_requests: u64,
    pub request_interval: WindowSnapshot,
    pub requests_instant_rps: WindowSnapshot,
    pub inflight_requests: WindowSnapshot,
    pub running_requests: WindowSnapshot,
    pub queueing_delay: WindowSnapshot,
    pub dispatch_overhead: WindowSnapshot,
    pub per_func: HashMap<u16, PerFuncSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct PerFuncSnapshot {
    pub incoming_requests: u64,
    pub request_interval: WindowSnapshot,
    pub end2end_delay: WindowSnapshot,
}

impl StatsSnapshot {
    pub fn capture(stats: &StatsBlock, per_func: &HashMap<u16, PerFuncStats>) -> Self {
        Self {
            incoming_requests: stats.incoming_requests,
            request_interval: stats.request_interval.snapshot(),
            requests_instant_rps: stats.requests_instant_rps.snapshot(),
            inflight_requests: stats.inflight_requests.snapshot(),
            running_requests: stats.running_requests.snapshot(),
            queueing_delay: stats.queueing_delay.snapshot(),
            dispatch_overhead: stats.dispatch_overhead.snapshot(),
            per_func: per_func
                .iter()
                .map(|(&func_id, s)| {
                    (
                        func_id,
                        PerFuncSnapshot {
                            incoming_requests: s.incoming_requests,
                            request_interval: s.request_interval.snapshot(),
                            end2end_delay: s.end2end_delay.snapshot(),
                        },
                    )
                })
                .collect(),
        }
    }
}
