// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Optional container-event fast path.
//!
//! Events only shorten the time to the next health check; the poll loop
//! is complete without them. The subscription reconnects with jittered
//! exponential backoff so an engine restart doesn't synchronize every
//! watchdog replica's reconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SharedSettings;
use crate::docker::{DockerClient, DockerEvent};
use crate::state::WatchdogState;

const RECONNECT_START: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// What an engine event means for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    /// The container likely went down; check soon.
    Suspect,
    /// The container came (back) up; clear failures and confirm.
    Healthy,
    /// Nothing supervision cares about.
    Other,
}

fn classify_action(action: &str) -> EventClass {
    match action {
        "die" | "kill" | "stop" => EventClass::Suspect,
        "start" | "restart" => EventClass::Healthy,
        other => {
            if let Some(status) = other.strip_prefix("health_status") {
                // "unhealthy" contains "healthy"; test it first.
                if status.contains("unhealthy") {
                    EventClass::Suspect
                } else if status.contains("healthy") {
                    EventClass::Healthy
                } else {
                    EventClass::Other
                }
            } else {
                EventClass::Other
            }
        }
    }
}

/// Next reconnect delay (1 s → 30 s, ×2).
fn next_reconnect_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_CAP)
}

/// ±20% jitter on a reconnect delay.
fn with_jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..=1.2);
    base.mul_f64(factor)
}

fn request_check(trigger_tx: &mpsc::Sender<()>) {
    // Capacity-1 channel: a pending trigger already covers this one.
    let _ = trigger_tx.try_send(());
}

fn handle_event(
    event: &DockerEvent,
    targets: &HashSet<String>,
    state: &WatchdogState,
    trigger_tx: &mpsc::Sender<()>,
) {
    if event.kind != "container" {
        return;
    }
    let Some(name) = event.container_name() else { return };
    if !targets.contains(name) {
        return;
    }
    match classify_action(&event.action) {
        EventClass::Suspect => {
            debug!(target = name, action = %event.action, "suspect event");
            request_check(trigger_tx);
        }
        EventClass::Healthy => {
            debug!(target = name, action = %event.action, "healthy event");
            state.reset_failures(name);
            request_check(trigger_tx);
        }
        EventClass::Other => {}
    }
}

/// Subscribe and forward until shutdown (or until events are disabled
/// by a reload).
pub async fn run_event_listener(
    docker: DockerClient,
    settings: SharedSettings,
    state: Arc<WatchdogState>,
    trigger_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
) {
    let mut backoff = RECONNECT_START;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let snapshot = settings.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        if !snapshot.use_events {
            info!("events disabled, listener exiting");
            return;
        }
        let names = snapshot.containers.clone();
        let targets: HashSet<String> = names.iter().cloned().collect();

        match docker.events(&names).await {
            Err(e) => {
                warn!(err = %e, "event subscribe failed");
            }
            Ok(mut stream) => {
                info!(targets = names.len(), "event listener connected");
                backoff = RECONNECT_START;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        event = stream.next_event() => match event {
                            Ok(Some(event)) => {
                                handle_event(&event, &targets, &state, &trigger_tx);
                            }
                            Ok(None) => {
                                warn!("event stream closed by engine");
                                break;
                            }
                            Err(e) => {
                                warn!(err = %e, "event stream failed");
                                break;
                            }
                        },
                    }
                }
            }
        }

        let delay = with_jitter(backoff);
        backoff = next_reconnect_backoff(backoff);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
