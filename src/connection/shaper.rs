//! Write Rate Shaping
//!
//! Caps outbound bytes at a quota per fixed window. A window opens on the
//! first send after the previous one expired, and the whole quota becomes
//! available again at that point.

use std::time::Duration;

/// Fixed-window byte quota for outbound data
#[derive(Debug, Clone, Default)]
pub struct WriteShaper {
    max_bytes: u32,
    window_ms: u64,
    window_start: u64,
    sent_in_window: u64,
}

impl WriteShaper {
    /// Create a shaper allowing `max_bytes` per `window`
    pub fn new(max_bytes: u32, window: Duration) -> Self {
        let mut shaper = Self::default();
        shaper.set_rate(max_bytes, window.as_millis() as u64);
        shaper
    }

    /// Change the quota. `(0, _)` or `(_, 0)` disables shaping.
    pub fn set_rate(&mut self, max_bytes: u32, window_ms: u64) {
        self.max_bytes = max_bytes;
        self.window_ms = window_ms;
        self.window_start = 0;
        self.sent_in_window = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0 && self.window_ms > 0
    }

    pub fn max_bytes(&self) -> u32 {
        self.max_bytes
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// How many of `buffered` bytes may be sent at `now` (milliseconds).
    ///
    /// Opens a fresh window when the current one has expired. Does not
    /// charge anything; call [`consume`](Self::consume) with what was sent.
    pub fn allowance(&mut self, now: u64, buffered: usize) -> usize {
        if !self.is_enabled() {
            return buffered;
        }

        if now.saturating_sub(self.window_start) > self.window_ms {
            self.window_start = now;
            self.sent_in_window = 0;
        }

        let quota = (self.max_bytes as u64).saturating_sub(self.sent_in_window);
        quota.min(buffered as u64) as usize
    }

    /// Charge `bytes` against the current window
    pub fn consume(&mut self, bytes: usize) {
        if self.is_enabled() {
            self.sent_in_window = self.sent_in_window.saturating_add(bytes as u64);
        }
    }

    /// Start of the current window in milliseconds
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Bytes charged in the current window
    pub fn sent_in_window(&self) -> u64 {
        self.sent_in_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(shaper: &mut WriteShaper, now: u64, buffered: &mut usize) -> usize {
        let n = shaper.allowance(now, *buffered);
        shaper.consume(n);
        *buffered -= n;
        n
    }

    #[test]
    fn test_disabled_passes_everything() {
        let mut shaper = WriteShaper::new(0, Duration::from_secs(1));
        assert!(!shaper.is_enabled());
        assert_eq!(shaper.allowance(0, 1_000_000), 1_000_000);

        let mut shaper = WriteShaper::new(100, Duration::ZERO);
        assert!(!shaper.is_enabled());
        assert_eq!(shaper.allowance(0, 500), 500);
    }

    #[test]
    fn test_250_bytes_over_three_windows() {
        let mut shaper = WriteShaper::new(100, Duration::from_millis(1000));
        let mut buffered = 250;
        let t0 = 1_700_000_000_000u64;

        assert_eq!(drain(&mut shaper, t0, &mut buffered), 100);
        // Still inside the first window
        assert_eq!(drain(&mut shaper, t0 + 10, &mut buffered), 0);
        assert_eq!(drain(&mut shaper, t0 + 1000, &mut buffered), 0);
        // Window expired
        assert_eq!(drain(&mut shaper, t0 + 1001, &mut buffered), 100);
        assert_eq!(drain(&mut shaper, t0 + 1500, &mut buffered), 0);
        assert_eq!(drain(&mut shaper, t0 + 2002, &mut buffered), 50);
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_window_never_exceeds_quota() {
        let quota = 37u32;
        let mut shaper = WriteShaper::new(quota, Duration::from_millis(100));
        let mut buffered = 10_000usize;
        let mut current_window = None;
        let mut in_window = 0u64;

        for step in 1..2_000u64 {
            let now = step * 7;
            let n = drain(&mut shaper, now, &mut buffered) as u64;
            if current_window != Some(shaper.window_start()) {
                if let Some(previous) = current_window {
                    assert!(shaper.window_start() - previous > 100);
                }
                current_window = Some(shaper.window_start());
                in_window = 0;
            }
            in_window += n;
            assert!(in_window <= quota as u64, "window overflow at {}", now);
        }
        assert!(buffered < 10_000);
    }

    #[test]
    fn test_partial_send_keeps_remaining_quota() {
        let mut shaper = WriteShaper::new(100, Duration::from_millis(1000));
        assert_eq!(shaper.allowance(5, 80), 80);
        shaper.consume(30);
        assert_eq!(shaper.allowance(6, 80), 70);
        assert_eq!(shaper.allowance(7, 10), 10);
    }
}
