// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The supervision loop.
//!
//! A single poll timer drives all targets; an external trigger channel
//! (events, admin) makes the next check happen early, rate-limited so
//! an event storm cannot stampede the engine. Restarts only happen
//! after retry verification confirms the failure, and never inside a
//! target's cooldown window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay::lock::LockManager;
use relay::store::epoch_ms;

use crate::config::{Settings, SharedSettings};
use crate::docker::{ContainerSummary, DockerClient};
use crate::health::classify;
use crate::state::{RestartAudit, WatchdogState};

/// Why a restart request did not reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartSkip {
    Disabled,
    Cooldown,
    InFlight,
    PeerHolds,
    UnknownTarget,
}

impl RestartSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Cooldown => "cooldown",
            Self::InFlight => "restart_in_flight",
            Self::PeerHolds => "peer_restarting",
            Self::UnknownTarget => "unknown_target",
        }
    }
}

impl std::fmt::Display for RestartSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container supervisor: health polling, retry verification, restarts.
pub struct Monitor {
    docker: DockerClient,
    settings: SharedSettings,
    state: Arc<WatchdogState>,
    /// Cross-replica restart coordination; `None` runs standalone.
    locks: Option<LockManager>,
}

impl Monitor {
    pub fn new(
        docker: DockerClient,
        settings: SharedSettings,
        state: Arc<WatchdogState>,
        locks: Option<LockManager>,
    ) -> Self {
        Self { docker, settings, state, locks }
    }

    pub fn state(&self) -> &Arc<WatchdogState> {
        &self.state
    }

    pub fn docker(&self) -> &DockerClient {
        &self.docker
    }

    fn settings_snapshot(&self) -> Settings {
        self.settings.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Poll until shutdown. `trigger_rx` requests an early check.
    pub async fn run(&self, mut trigger_rx: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let mut current = self.settings_snapshot();
        let mut poll = tokio::time::interval(current.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(current.status_report_interval());
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_trigger: Option<Instant> = None;
        let mut triggers_open = true;

        info!(
            targets = current.containers.len(),
            interval_secs = current.interval_seconds,
            "watchdog monitor starting"
        );

        loop {
            // Reload may have changed cadence; rebuild timers in place.
            let snapshot = self.settings_snapshot();
            if snapshot.interval_seconds != current.interval_seconds {
                poll = tokio::time::interval(snapshot.poll_interval());
                poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
            if snapshot.status_report_seconds != current.status_report_seconds {
                report = tokio::time::interval(snapshot.status_report_interval());
                report.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
            current = snapshot;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.check_all(&current).await;
                }
                maybe = trigger_rx.recv(), if triggers_open => match maybe {
                    Some(()) => {
                        let min = current.event_min_interval();
                        if last_trigger.is_none_or(|t| t.elapsed() >= min) {
                            last_trigger = Some(Instant::now());
                            poll.reset();
                            self.check_all(&current).await;
                        } else {
                            debug!("health-check trigger rate-limited");
                        }
                    }
                    None => triggers_open = false,
                },
                _ = report.tick() => {
                    self.status_report();
                }
            }
        }
        info!("watchdog monitor stopped");
    }

    /// One round: list all targets once, then evaluate each.
    async fn check_all(&self, settings: &Settings) {
        let names = &settings.containers;
        if names.is_empty() {
            return;
        }
        let listed = match self.docker.list_containers(names).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(err = %e, "container list failed");
                return;
            }
        };
        let by_name: HashMap<&str, &ContainerSummary> =
            listed.iter().map(|c| (c.name(), c)).collect();
        for name in names {
            self.check_target(settings, name, by_name.get(name.as_str()).copied()).await;
        }
    }

    async fn check_target(
        &self,
        settings: &Settings,
        name: &str,
        summary: Option<&ContainerSummary>,
    ) {
        let health = classify(summary);
        let outcome = self.state.record_check(name, health.healthy, &health.status);

        if outcome.paused {
            if settings.verbose_logging {
                debug!(target = name, status = %health.status, "paused, observing only");
            }
            return;
        }

        let grace_ends =
            self.state.started_at_ms() + settings.startup_grace_seconds.saturating_mul(1000);
        if epoch_ms() < grace_ends {
            self.state.reset_failures(name);
            debug!(target = name, status = %health.status, "startup grace, not counting");
            return;
        }

        if health.healthy {
            if outcome.recovered {
                info!(target = name, "target recovered");
            } else if settings.verbose_logging {
                debug!(target = name, status = %health.status, "healthy");
            }
            return;
        }

        warn!(
            target = name,
            status = %health.status,
            failures = outcome.failures,
            "target unhealthy"
        );
        if outcome.failures >= settings.max_failures {
            self.verify_and_restart(settings, name).await;
        }
    }

    /// Confirm a failing target with spaced re-checks before restarting.
    /// One healthy observation aborts and resets the count.
    async fn verify_and_restart(&self, settings: &Settings, name: &str) {
        for check in 1..=settings.retry_checks {
            tokio::time::sleep(Duration::from_secs(settings.retry_interval_seconds)).await;
            let health = match self.docker.inspect_target(name).await {
                Ok(summary) => classify(summary.as_ref()),
                Err(e) => {
                    warn!(target = name, err = %e, "retry verification query failed");
                    continue;
                }
            };
            self.state.record_check(name, health.healthy, &health.status);
            if health.healthy {
                info!(target = name, check, "recovered during retry verification");
                return;
            }
            debug!(target = name, check, status = %health.status, "still unhealthy");
        }

        let reason = format!(
            "unhealthy for {} checks, confirmed by {} retries",
            settings.max_failures, settings.retry_checks
        );
        match self.restart_target(name, "watchdog", &reason, false).await {
            Ok(audit) => {
                info!(target = name, outcome = %audit.outcome, "restart attempt recorded");
            }
            Err(skip) => {
                debug!(target = name, reason = %skip, "restart skipped");
            }
        }
    }

    /// Restart one target, honoring the global switch, cooldown, the
    /// per-target in-flight slot, and the cross-replica lock. `force`
    /// (admin requests) bypasses the switch and cooldown only.
    pub async fn restart_target(
        &self,
        name: &str,
        by: &str,
        reason: &str,
        force: bool,
    ) -> Result<RestartAudit, RestartSkip> {
        let settings = self.settings_snapshot();
        if self.state.get(name).is_none() {
            return Err(RestartSkip::UnknownTarget);
        }
        if !force {
            if !settings.enabled {
                return Err(RestartSkip::Disabled);
            }
            if epoch_ms() < self.state.cooldown_until_ms(name) {
                return Err(RestartSkip::Cooldown);
            }
        }
        if !self.state.try_begin_restart(name) {
            return Err(RestartSkip::InFlight);
        }

        let lock_key = format!("watchdog:restart:{name}");
        let mut lock_taken = false;
        if let Some(locks) = &self.locks {
            let ttl = Duration::from_secs(settings.restart_timeout_sec + 30);
            match locks.try_acquire_shared(&lock_key, ttl).await {
                Ok(true) => lock_taken = true,
                Ok(false) => {
                    self.state.abandon_restart(name);
                    return Err(RestartSkip::PeerHolds);
                }
                Err(e) => {
                    // The lock is an optimization; a dead store must not
                    // stop recovery of the target.
                    warn!(target = name, err = %e, "restart lock unavailable, proceeding");
                }
            }
        }

        let result = self.docker.restart_container(name, settings.restart_timeout_sec).await;
        let success = result.is_ok();
        let audit = RestartAudit {
            at_ms: epoch_ms(),
            by: by.to_owned(),
            reason: reason.to_owned(),
            outcome: if success { "restarted".to_owned() } else { "failed".to_owned() },
            error: result.err().map(|e| e.to_string()),
        };
        let cooldown_until = epoch_ms() + settings.cooldown_seconds.saturating_mul(1000);
        self.state.finish_restart(name, audit.clone(), success, cooldown_until);

        if lock_taken {
            if let Some(locks) = &self.locks {
                if let Err(e) = locks.release_shared(&lock_key).await {
                    warn!(target = name, err = %e, "restart lock release failed");
                }
            }
        }

        if success {
            info!(target = name, by, reason, "container restarted");
        } else {
            error!(
                target = name,
                by,
                err = audit.error.as_deref().unwrap_or("unknown"),
                "container restart failed"
            );
        }
        Ok(audit)
    }

    /// Structured summary of every target.
    pub fn status_report(&self) {
        let rows = self.state.snapshot();
        let healthy = rows.iter().filter(|(_, t)| t.last_healthy).count();
        let unhealthy = rows.len() - healthy;
        info!(targets = rows.len(), healthy, unhealthy, "status report");
        let now = epoch_ms();
        for (name, target) in &rows {
            info!(
                target = %name,
                status = %target.last_status,
                failures = target.failures,
                paused = target.monitoring_paused,
                last_checked_age_ms = now.saturating_sub(target.last_checked_ms),
                "target status"
            );
        }
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
