// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health classification from a container summary.
//!
//! The list endpoint encodes healthcheck results as a suffix on the
//! status line (`Up 2 hours (healthy)`), so no per-container inspect
//! round trip is needed.

use crate::docker::ContainerSummary;

/// Classified health of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub healthy: bool,
    /// Short status string recorded on the target state.
    pub status: String,
}

impl Health {
    fn healthy(status: impl Into<String>) -> Self {
        Self { healthy: true, status: status.into() }
    }

    fn unhealthy(status: impl Into<String>) -> Self {
        Self { healthy: false, status: status.into() }
    }
}

/// Classify a target from its (optional) summary.
pub fn classify(summary: Option<&ContainerSummary>) -> Health {
    let Some(summary) = summary else {
        return Health::unhealthy("not_found");
    };

    if summary.state == "restarting" {
        return Health::unhealthy("restarting");
    }
    if summary.state != "running" {
        return Health::unhealthy(format!(
            "not_running(state={},status={})",
            summary.state, summary.status
        ));
    }

    // Running; the healthcheck verdict, if any, rides on the status line.
    let status = summary.status.as_str();
    if !status.contains("(health") && !status.contains("(unhealthy") {
        return Health::healthy("running");
    }
    if status.contains("(healthy)") || status.contains("(health: starting)") {
        let phase = if status.contains("(healthy)") { "healthy" } else { "starting" };
        return Health::healthy(phase);
    }
    if status.contains("(unhealthy)") {
        return Health::unhealthy("unhealthy");
    }
    Health::unhealthy(format!("unknown({status})"))
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
