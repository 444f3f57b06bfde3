// src/core/fault.rs

//! Tracks unexpected faults caught at the reactor boundary so that a server
//! stuck in a fault loop is reported instead of silently spinning.
//!
//! Faults are counted over a sliding time window. Clean iterations between
//! faults do not reset the count, so a bug that breaks every request still
//! escalates even though each accept in between succeeds.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How loudly a fault should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLevel {
    /// The fault rate is still below the threshold; the loop carries on.
    Isolated,
    /// `faults` faults landed within `window`.
    Escalated { faults: u64, window: Duration },
}

/// Counts reactor faults within a sliding window.
#[derive(Debug)]
pub struct FaultMonitor {
    threshold: u64,
    window: Duration,
    recent: VecDeque<Instant>,
    last_fault: Option<Instant>,
    /// Faults seen since the first escalation of the current degraded period.
    degraded: Option<u64>,
    total: u64,
}

impl FaultMonitor {
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            recent: VecDeque::new(),
            last_fault: None,
            degraded: None,
            total: 0,
        }
    }

    /// Records one fault observed at `now`. Escalates when `threshold`
    /// faults fall within the window; the window then starts counting afresh.
    pub fn record_fault(&mut self, now: Instant) -> FaultLevel {
        self.total += 1;
        self.last_fault = Some(now);
        if let Some(count) = self.degraded.as_mut() {
            *count += 1;
        }
        self.expire(now);
        self.recent.push_back(now);

        if (self.recent.len() as u64) < self.threshold {
            return FaultLevel::Isolated;
        }
        self.recent.clear();
        self.degraded.get_or_insert(self.threshold);
        FaultLevel::Escalated {
            faults: self.threshold,
            window: self.window,
        }
    }

    /// Marks a clean iteration at `now`. Once a full window has passed
    /// without a fault after an escalation, returns how many faults the
    /// degraded period saw.
    pub fn record_quiet(&mut self, now: Instant) -> Option<u64> {
        self.expire(now);
        let last = self.last_fault?;
        if self.degraded.is_some() && now.saturating_duration_since(last) >= self.window {
            return self.degraded.take();
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// Faults currently counted in the window.
    pub fn in_window(&self) -> u64 {
        self.recent.len() as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) < self.window {
                break;
            }
            self.recent.pop_front();
        }
    }
}
