// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-target supervision state.
//!
//! All mutation goes through methods that take the map lock internally;
//! the monitor and the admin surface share one instance.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use relay::store::epoch_ms;

/// Audit record of the most recent restart attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartAudit {
    pub at_ms: u64,
    pub by: String,
    pub reason: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Supervision state of one container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    pub failures: u32,
    pub last_checked_ms: u64,
    pub last_status: String,
    pub last_healthy: bool,
    pub cooldown_until_ms: u64,
    pub monitoring_paused: bool,
    pub restart_in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<RestartAudit>,
}

/// Result of recording one health observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub failures: u32,
    /// Healthy after at least one recorded failure.
    pub recovered: bool,
    pub paused: bool,
}

/// Shared state for the full target set.
pub struct WatchdogState {
    targets: Mutex<HashMap<String, TargetState>>,
    started_at_ms: u64,
}

impl WatchdogState {
    pub fn new(names: &[String]) -> Self {
        let targets =
            names.iter().map(|n| (n.clone(), TargetState::default())).collect();
        Self { targets: Mutex::new(targets), started_at_ms: epoch_ms() }
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Reshape the target set after a config reload, preserving state
    /// for names that survive.
    pub fn rebuild(&self, names: &[String]) {
        let Ok(mut targets) = self.targets.lock() else { return };
        let mut rebuilt = HashMap::with_capacity(names.len());
        for name in names {
            let state = targets.remove(name).unwrap_or_default();
            rebuilt.insert(name.clone(), state);
        }
        *targets = rebuilt;
    }

    pub fn get(&self, name: &str) -> Option<TargetState> {
        self.targets.lock().ok()?.get(name).cloned()
    }

    /// Sorted snapshot for reporting.
    pub fn snapshot(&self) -> Vec<(String, TargetState)> {
        let Ok(targets) = self.targets.lock() else { return vec![] };
        let mut rows: Vec<_> =
            targets.iter().map(|(n, s)| (n.clone(), s.clone())).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Record one observation. A paused target keeps failures pinned at
    /// zero and gets a `paused_` status prefix.
    pub fn record_check(&self, name: &str, healthy: bool, status: &str) -> CheckOutcome {
        let Ok(mut targets) = self.targets.lock() else {
            return CheckOutcome { failures: 0, recovered: false, paused: false };
        };
        let state = targets.entry(name.to_owned()).or_default();
        state.last_checked_ms = epoch_ms();
        state.last_healthy = healthy;

        if state.monitoring_paused {
            state.last_status = format!("paused_{status}");
            state.failures = 0;
            return CheckOutcome { failures: 0, recovered: false, paused: true };
        }

        state.last_status = status.to_owned();
        if healthy {
            let recovered = state.failures > 0;
            state.failures = 0;
            CheckOutcome { failures: 0, recovered, paused: false }
        } else {
            state.failures += 1;
            CheckOutcome { failures: state.failures, recovered: false, paused: false }
        }
    }

    pub fn reset_failures(&self, name: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(state) = targets.get_mut(name) {
                state.failures = 0;
            }
        }
    }

    /// Returns false for unknown targets.
    pub fn set_paused(&self, name: &str, paused: bool) -> bool {
        let Ok(mut targets) = self.targets.lock() else { return false };
        match targets.get_mut(name) {
            Some(state) => {
                state.monitoring_paused = paused;
                if paused {
                    state.failures = 0;
                }
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self, name: &str) -> bool {
        self.get(name).map(|s| s.monitoring_paused).unwrap_or(false)
    }

    pub fn cooldown_until_ms(&self, name: &str) -> u64 {
        self.get(name).map(|s| s.cooldown_until_ms).unwrap_or(0)
    }

    /// Claim the per-target restart slot. False when one is in flight
    /// or the target is unknown.
    pub fn try_begin_restart(&self, name: &str) -> bool {
        let Ok(mut targets) = self.targets.lock() else { return false };
        match targets.get_mut(name) {
            Some(state) if !state.restart_in_flight => {
                state.restart_in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Release the restart slot without recording an attempt (the
    /// restart was skipped after claiming, e.g. a peer held the lock).
    pub fn abandon_restart(&self, name: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(state) = targets.get_mut(name) {
                state.restart_in_flight = false;
            }
        }
    }

    /// Record an attempt's audit fields and start the cooldown window.
    pub fn finish_restart(
        &self,
        name: &str,
        audit: RestartAudit,
        success: bool,
        cooldown_until_ms: u64,
    ) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(state) = targets.get_mut(name) {
                state.restart_in_flight = false;
                state.cooldown_until_ms = cooldown_until_ms;
                if success {
                    state.failures = 0;
                }
                state.last_restart = Some(audit);
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
