use crate::device::DeviceState;

/// Derives the "connection healthy" signal.
///
/// Fed by poll outcomes (with a consecutive-failure threshold so a single
/// dropped cycle does not flap), by the device's run state at connect time,
/// and by explicit forcing from the execution pipeline. Only the worker
/// loop mutates it.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    threshold: u32,
    reason: Option<String>,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            healthy: false,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            reason: Some("not connected yet".to_string()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Human-readable reason for the current unhealthy state.
    pub fn describe(&self) -> String {
        if self.healthy {
            return "healthy".to_string();
        }
        self.reason
            .clone()
            .unwrap_or_else(|| "connection unhealthy".to_string())
    }

    /// Seed health from the run state reported right after connecting.
    /// Returns the new health if it changed.
    pub fn on_connected(&mut self, state: DeviceState) -> Option<bool> {
        self.consecutive_failures = 0;
        if state.is_running() {
            self.set(true, None)
        } else {
            self.set(false, Some(format!("device state is {state}")))
        }
    }

    /// Record one poll cycle by the number of attributes read successfully.
    /// A cycle with zero successes is a failure even if the call did not error.
    pub fn record_poll(&mut self, successes: usize) -> Option<bool> {
        if successes > 0 {
            self.consecutive_failures = 0;
            return self.set(true, None);
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            let reason = format!("{} consecutive failed polls", self.consecutive_failures);
            self.set(false, Some(reason))
        } else {
            None
        }
    }

    /// Force UNHEALTHY, e.g. after a connection-fatal command error.
    pub fn force_unhealthy(&mut self, reason: impl Into<String>) -> Option<bool> {
        self.set(false, Some(reason.into()))
    }

    fn set(&mut self, healthy: bool, reason: Option<String>) -> Option<bool> {
        let changed = self.healthy != healthy;
        self.healthy = healthy;
        self.reason = reason;
        changed.then_some(healthy)
    }
}
