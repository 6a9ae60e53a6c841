use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Too many consecutive cycles without a usable frame.
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
        })
    }
}

/// Counts skipped cycles and flags the pipeline degraded after
/// `degraded_after` consecutive skips. One successful cycle clears it.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    degraded_after: u32,
    consecutive_skips: u32,
    total_skips: u64,
    total_cycles: u64,
    status: HealthStatus,
}

impl HealthMonitor {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            consecutive_skips: 0,
            total_skips: 0,
            total_cycles: 0,
            status: HealthStatus::Healthy,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_skips(&self) -> u32 {
        self.consecutive_skips
    }

    pub fn total_skips(&self) -> u64 {
        self.total_skips
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Returns the new status when this skip changed it.
    pub fn record_skip(&mut self) -> Option<HealthStatus> {
        self.total_cycles += 1;
        self.total_skips += 1;
        self.consecutive_skips = self.consecutive_skips.saturating_add(1);
        if self.status == HealthStatus::Healthy && self.consecutive_skips >= self.degraded_after {
            log::warn!(
                "pipeline degraded: {} consecutive cycles without a usable frame",
                self.consecutive_skips
            );
            self.status = HealthStatus::Degraded;
            return Some(self.status);
        }
        None
    }

    /// Returns the new status when this success changed it.
    pub fn record_success(&mut self) -> Option<HealthStatus> {
        self.total_cycles += 1;
        self.consecutive_skips = 0;
        if self.status == HealthStatus::Degraded {
            log::info!("pipeline recovered");
            self.status = HealthStatus::Healthy;
            return Some(self.status);
        }
        None
    }
}
