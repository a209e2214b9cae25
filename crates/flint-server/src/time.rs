//! Process-local monotonic clock.
//!
//! The engine wants plain millisecond timestamps; this anchors them to
//! process start so they are small, monotonic, and immune to wall-clock
//! jumps.

use std::sync::OnceLock;
use std::time::Instant;

/// Current monotonic time in milliseconds since process start.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
