//! Monotonic timestamps for latency accounting.

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed on the monotonic clock since first use.
///
/// All dispatch timestamps (`recv_timestamp`, `dispatch_timestamp`, delay
/// samples) come from this single clock so differences are meaningful.
pub fn monotonic_micros() -> i64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as i64
}
