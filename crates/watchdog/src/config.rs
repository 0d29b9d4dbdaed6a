// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watchdog configuration: env defaults merged with an optional JSON
//! file, with an administrative reload path.
//!
//! Only fields whose runtime change has defined semantics are applied
//! in place; structural fields (socket path, startup grace, turning the
//! event listener ON when it was OFF at start) are reported as
//! requiring a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Process configuration from flags and environment.
#[derive(Debug, Parser)]
#[command(name = "relaydog", version, about)]
pub struct WatchdogConfig {
    /// Optional JSON config file merged over env defaults at startup
    /// and on admin reload.
    #[arg(long, env = "WATCHDOG_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Global restart switch. Targets are still observed when disabled.
    #[arg(long, env = "WATCHDOG_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub enabled: bool,

    /// Container names to supervise.
    #[arg(long, env = "WATCHDOG_CONTAINERS", value_delimiter = ',')]
    pub containers: Vec<String>,

    /// Poll interval in seconds.
    #[arg(long, env = "WATCHDOG_INTERVAL_SECONDS", default_value_t = 30)]
    pub interval_seconds: u64,

    /// Consecutive failures before retry verification begins.
    #[arg(long, env = "WATCHDOG_MAX_FAILURES", default_value_t = 3)]
    pub max_failures: u32,

    /// Confirmation checks before a restart is issued.
    #[arg(long, env = "WATCHDOG_RETRY_CHECKS", default_value_t = 2)]
    pub retry_checks: u32,

    /// Spacing of confirmation checks in seconds.
    #[arg(long, env = "WATCHDOG_RETRY_INTERVAL_SECONDS", default_value_t = 5)]
    pub retry_interval_seconds: u64,

    /// Minimum time between restarts of one target, in seconds.
    #[arg(long, env = "WATCHDOG_COOLDOWN_SECONDS", default_value_t = 300)]
    pub cooldown_seconds: u64,

    /// Stop budget handed to the container engine on restart.
    #[arg(long, env = "WATCHDOG_RESTART_TIMEOUT_SEC", default_value_t = 30)]
    pub restart_timeout_sec: u64,

    /// Subscribe to container events for fast-path checks.
    #[arg(long, env = "WATCHDOG_USE_EVENTS")]
    pub use_events: bool,

    /// Minimum spacing of event-triggered checks, in seconds.
    #[arg(long, env = "WATCHDOG_EVENT_MIN_INTERVAL_SEC", default_value_t = 10)]
    pub event_min_interval_sec: u64,

    /// Grace period after startup before failures count.
    #[arg(long, env = "WATCHDOG_STARTUP_GRACE_SECONDS", default_value_t = 30)]
    pub startup_grace_seconds: u64,

    /// Container engine socket.
    #[arg(long, env = "WATCHDOG_DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Structured status summary cadence, in seconds.
    #[arg(long, env = "WATCHDOG_STATUS_REPORT_SECONDS", default_value_t = 300)]
    pub status_report_seconds: u64,

    /// Log every observation, not just transitions.
    #[arg(long, env = "WATCHDOG_VERBOSE_LOGGING")]
    pub verbose_logging: bool,

    /// Store URL for the cross-replica restart lock. Unset = no lock.
    #[arg(long, env = "WATCHDOG_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Domain key prefix for the restart lock.
    #[arg(long, env = "WATCHDOG_KEY_PREFIX", default_value = "relay")]
    pub key_prefix: String,

    /// Admin API bind host.
    #[arg(long, env = "WATCHDOG_ADMIN_HOST", default_value = "127.0.0.1")]
    pub admin_host: String,

    /// Admin API port.
    #[arg(long, env = "WATCHDOG_ADMIN_PORT", default_value_t = 9690)]
    pub admin_port: u16,

    /// Bearer token for the admin API. Unset disables auth.
    #[arg(long, env = "WATCHDOG_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "WATCHDOG_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level.
    #[arg(long, env = "WATCHDOG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// The runtime-visible settings. Reload mutates this in place under the
/// shared lock; readers snapshot per use.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub enabled: bool,
    pub containers: Vec<String>,
    pub interval_seconds: u64,
    pub max_failures: u32,
    pub retry_checks: u32,
    pub retry_interval_seconds: u64,
    pub cooldown_seconds: u64,
    pub restart_timeout_sec: u64,
    pub use_events: bool,
    pub event_min_interval_sec: u64,
    pub status_report_seconds: u64,
    pub verbose_logging: bool,
    // Structural; changes require a restart and are kept for reporting.
    pub startup_grace_seconds: u64,
    pub docker_socket: PathBuf,
}

pub type SharedSettings = Arc<RwLock<Settings>>;

impl Settings {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            enabled: config.enabled,
            containers: config.containers.clone(),
            interval_seconds: config.interval_seconds,
            max_failures: config.max_failures,
            retry_checks: config.retry_checks,
            retry_interval_seconds: config.retry_interval_seconds,
            cooldown_seconds: config.cooldown_seconds,
            restart_timeout_sec: config.restart_timeout_sec,
            use_events: config.use_events,
            event_min_interval_sec: config.event_min_interval_sec,
            status_report_seconds: config.status_report_seconds,
            verbose_logging: config.verbose_logging,
            startup_grace_seconds: config.startup_grace_seconds,
            docker_socket: config.docker_socket.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn event_min_interval(&self) -> Duration {
        Duration::from_secs(self.event_min_interval_sec)
    }

    pub fn status_report_interval(&self) -> Duration {
        Duration::from_secs(self.status_report_seconds.max(1))
    }
}

/// Shape of the JSON config file. Every field optional; absent fields
/// keep their current value.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub enabled: Option<bool>,
    pub containers: Option<Vec<String>>,
    pub interval_seconds: Option<u64>,
    pub max_failures: Option<u32>,
    pub retry_checks: Option<u32>,
    pub retry_interval_seconds: Option<u64>,
    pub cooldown_seconds: Option<u64>,
    pub restart_timeout_sec: Option<u64>,
    pub use_events: Option<bool>,
    pub event_min_interval_sec: Option<u64>,
    pub startup_grace_seconds: Option<u64>,
    pub docker_socket: Option<PathBuf>,
    pub status_report_seconds: Option<u64>,
    pub verbose_logging: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))
    }
}

/// Result of a reload: which fields took effect and which need a
/// process restart.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    pub applied: Vec<&'static str>,
    pub requires_restart: Vec<&'static str>,
}

/// Merge a file over the current settings, applying the runtime-safe
/// fields in place.
pub fn apply_file(settings: &mut Settings, file: &FileConfig) -> ReloadReport {
    let mut report = ReloadReport::default();

    macro_rules! apply {
        ($field:ident, $name:literal) => {
            if let Some(value) = &file.$field {
                if *value != settings.$field {
                    settings.$field = value.clone();
                    report.applied.push($name);
                }
            }
        };
    }

    apply!(enabled, "enabled");
    apply!(containers, "containers");
    apply!(interval_seconds, "intervalSeconds");
    apply!(max_failures, "maxFailures");
    apply!(retry_checks, "retryChecks");
    apply!(retry_interval_seconds, "retryIntervalSeconds");
    apply!(cooldown_seconds, "cooldownSeconds");
    apply!(restart_timeout_sec, "restartTimeoutSec");
    apply!(event_min_interval_sec, "eventMinIntervalSec");
    apply!(status_report_seconds, "statusReportSeconds");
    apply!(verbose_logging, "verboseLogging");

    // useEvents can only be lowered at runtime: the listener task is
    // spawned at startup and cannot be conjured afterwards.
    if let Some(use_events) = file.use_events {
        if use_events != settings.use_events {
            if use_events {
                report.requires_restart.push("useEvents");
            } else {
                settings.use_events = false;
                report.applied.push("useEvents");
            }
        }
    }

    if let Some(grace) = file.startup_grace_seconds {
        if grace != settings.startup_grace_seconds {
            report.requires_restart.push("startupGraceSeconds");
        }
    }
    if let Some(socket) = &file.docker_socket {
        if *socket != settings.docker_socket {
            report.requires_restart.push("dockerSocket");
        }
    }

    report
}

/// Merge a file over env defaults before anything has started. Unlike
/// [`apply_file`], structural fields apply too.
pub fn merge_at_startup(settings: &mut Settings, file: &FileConfig) {
    let report = apply_file(settings, file);
    if report.requires_restart.contains(&"useEvents") {
        settings.use_events = true;
    }
    if let Some(grace) = file.startup_grace_seconds {
        settings.startup_grace_seconds = grace;
    }
    if let Some(socket) = &file.docker_socket {
        settings.docker_socket = socket.clone();
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.containers.is_empty() && self.config_file.is_none() {
            anyhow::bail!("no containers to supervise (set --containers or --config-file)");
        }
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
