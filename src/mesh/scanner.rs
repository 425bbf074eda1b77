//! Adaptive duty-cycle scanning policy.
//!
//! With no direct links the radio scans continuously (duplicates allowed)
//! so a lone node finds company as fast as possible. Once linked, scanning
//! alternates on/off with periods picked from recent traffic and link count.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{
    SCAN_CYCLE_DENSE, SCAN_CYCLE_NORMAL, SCAN_CYCLE_SPARSE, TRAFFIC_WINDOW,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Normal,
    Dense,
    Sparse,
}

impl ScanMode {
    /// (scan-on, scan-off) periods for a cycled mode.
    pub fn periods(self) -> (Duration, Duration) {
        match self {
            ScanMode::Normal => SCAN_CYCLE_NORMAL,
            ScanMode::Dense => SCAN_CYCLE_DENSE,
            ScanMode::Sparse => SCAN_CYCLE_SPARSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Continuous scan with duplicate advertisements allowed.
    Aggressive,
    Cycled(ScanMode),
}

impl ScanState {
    pub fn label(self) -> &'static str {
        match self {
            ScanState::Aggressive => "aggressive",
            ScanState::Cycled(ScanMode::Normal) => "normal",
            ScanState::Cycled(ScanMode::Dense) => "dense",
            ScanState::Cycled(ScanMode::Sparse) => "sparse",
        }
    }
}

/// Traffic trace plus the current scan state.
pub struct AdaptiveScanner {
    trace: VecDeque<Instant>,
    state: ScanState,
}

impl AdaptiveScanner {
    pub fn new() -> Self {
        Self {
            trace: VecDeque::new(),
            state: ScanState::Aggressive,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Count a received packet toward the traffic estimate.
    pub fn observe_packet(&mut self, now: Instant) {
        self.trace.push_back(now);
        self.trim(now);
    }

    /// Packets observed inside the traffic window.
    pub fn traffic(&mut self, now: Instant) -> usize {
        self.trim(now);
        self.trace.len()
    }

    /// Re-derive the scan state from traffic and direct link count.
    /// Returns the new state when it changed, `None` when it held.
    pub fn recompute(&mut self, now: Instant, direct_links: usize) -> Option<ScanState> {
        let next = if direct_links == 0 {
            ScanState::Aggressive
        } else {
            let traffic = self.traffic(now);
            let mode = if traffic > 10 || direct_links > 5 {
                ScanMode::Dense
            } else if traffic < 2 && direct_links < 2 {
                ScanMode::Sparse
            } else {
                ScanMode::Normal
            };
            ScanState::Cycled(mode)
        };

        if next == self.state {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&front) = self.trace.front() {
            if now.duration_since(front) > TRAFFIC_WINDOW {
                self.trace.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for AdaptiveScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_aggressive() {
        let scanner = AdaptiveScanner::new();
        assert_eq!(scanner.state(), ScanState::Aggressive);
    }

    #[test]
    fn quiet_single_link_goes_sparse() {
        let mut scanner = AdaptiveScanner::new();
        let now = Instant::now();
        assert_eq!(
            scanner.recompute(now, 1),
            Some(ScanState::Cycled(ScanMode::Sparse))
        );
        // Unchanged on the next recompute.
        assert_eq!(scanner.recompute(now, 1), None);
    }

    #[test]
    fn burst_goes_dense_then_idles_back_to_sparse() {
        let mut scanner = AdaptiveScanner::new();
        let now = Instant::now();
        scanner.recompute(now, 1);

        for i in 0..15 {
            scanner.observe_packet(now + Duration::from_millis(i * 100));
        }
        assert_eq!(
            scanner.recompute(now + Duration::from_secs(2), 1),
            Some(ScanState::Cycled(ScanMode::Dense))
        );

        // The burst falls out of the window after 30 s of silence.
        assert_eq!(
            scanner.recompute(now + Duration::from_secs(32), 1),
            Some(ScanState::Cycled(ScanMode::Sparse))
        );
    }

    #[test]
    fn many_links_force_dense() {
        let mut scanner = AdaptiveScanner::new();
        let now = Instant::now();
        assert_eq!(
            scanner.recompute(now, 6),
            Some(ScanState::Cycled(ScanMode::Dense))
        );
    }

    #[test]
    fn moderate_traffic_is_normal() {
        let mut scanner = AdaptiveScanner::new();
        let now = Instant::now();
        for i in 0..5 {
            scanner.observe_packet(now + Duration::from_millis(i));
        }
        assert_eq!(
            scanner.recompute(now + Duration::from_secs(1), 2),
            Some(ScanState::Cycled(ScanMode::Normal))
        );
    }

    #[test]
    fn losing_all_links_returns_to_aggressive() {
        let mut scanner = AdaptiveScanner::new();
        let now = Instant::now();
        scanner.recompute(now, 2);
        assert_eq!(scanner.recompute(now, 0), Some(ScanState::Aggressive));
    }

    #[test]
    fn duty_cycle_periods() {
        assert_eq!(
            ScanMode::Normal.periods(),
            (Duration::from_secs(10), Duration::from_secs(5))
        );
        assert_eq!(
            ScanMode::Dense.periods(),
            (Duration::from_secs(5), Duration::from_secs(10))
        );
        assert_eq!(
            ScanMode::Sparse.periods(),
            (Duration::from_secs(5), Duration::from_secs(15))
        );
    }
}
