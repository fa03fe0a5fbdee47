use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The node's time source: a monotonic millisecond counter for link idle
/// tracking, and a settable DTN wall clock in seconds.
///
/// Nodes without a battery-backed RTC boot with DTN time 0 and learn the
/// current time through the management agent's set-time command.
pub struct Clock {
    start: Instant,
    dtn_offset_s: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            dtn_offset_s: AtomicU64::new(0),
        }
    }

    /// Milliseconds since the clock was created. Monotonic.
    pub fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// The current DTN timestamp (seconds since the DTN epoch).
    pub fn dtn_time_s(&self) -> u64 {
        self.dtn_offset_s.load(Ordering::Relaxed) + self.start.elapsed().as_secs()
    }

    /// Sets the DTN wall clock. The monotonic counter is unaffected.
    pub fn set_dtn_time(&self, timestamp_s: u64) {
        self.dtn_offset_s.store(
            timestamp_s.saturating_sub(self.start.elapsed().as_secs()),
            Ordering::Relaxed,
        );
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("monotonic_ms", &self.monotonic_ms())
            .field("dtn_time_s", &self.dtn_time_s())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read() {
        let clock = Clock::new();
        assert_eq!(clock.dtn_time_s(), 0);

        clock.set_dtn_time(725_000_000);
        let t = clock.dtn_time_s();
        assert!((725_000_000..725_000_002).contains(&t));
    }

    #[test]
    fn monotonic_advances() {
        let clock = Clock::new();
        let a = clock.monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.monotonic_ms() >= a + 5);
    }
}
