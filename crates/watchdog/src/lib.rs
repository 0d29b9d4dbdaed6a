// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod admin;
pub mod config;
pub mod docker;
pub mod events;
pub mod health;
pub mod monitor;
pub mod state;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay::lock::LockManager;
use relay::scripts::ScriptRegistry;
use relay::store::Store;

use crate::admin::AdminState;
use crate::config::{merge_at_startup, FileConfig, Settings, SharedSettings, WatchdogConfig};
use crate::docker::DockerClient;
use crate::events::run_event_listener;
use crate::monitor::Monitor;
use crate::state::WatchdogState;

/// TTL headroom on the cross-replica restart lock, relative to the
/// engine restart budget.
const RESTART_LOCK_TTL_SLACK: u64 = 30;

/// Wire the watchdog and supervise until a shutdown signal.
pub async fn run(config: WatchdogConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut settings = Settings::from_config(&config);
    if let Some(path) = &config.config_file {
        let file = FileConfig::load(path)?;
        merge_at_startup(&mut settings, &file);
    }
    if settings.containers.is_empty() {
        anyhow::bail!("no containers to supervise after config merge");
    }
    let snapshot = settings.clone();
    let settings: SharedSettings = Arc::new(RwLock::new(settings));

    let state = Arc::new(WatchdogState::new(&snapshot.containers));
    let docker = DockerClient::new(&snapshot.docker_socket);

    // The restart lock is optional: without a store each replica
    // coordinates only with itself.
    let locks = match &config.redis_url {
        Some(url) => match Store::connect(url, &config.key_prefix).await {
            Ok(store) => {
                let registry = Arc::new(ScriptRegistry::new(store.clone()));
                Some(LockManager::new(
                    store,
                    registry,
                    snapshot.restart_timeout_sec + RESTART_LOCK_TTL_SLACK,
                    Duration::from_secs(1),
                ))
            }
            Err(e) => {
                warn!(err = %e, "store unavailable, restart lock disabled");
                None
            }
        },
        None => None,
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let monitor =
        Arc::new(Monitor::new(docker.clone(), Arc::clone(&settings), Arc::clone(&state), locks));

    let admin_state = AdminState {
        monitor: Arc::clone(&monitor),
        settings: Arc::clone(&settings),
        trigger_tx: trigger_tx.clone(),
        config_file: config.config_file.clone(),
        token: config.admin_token.clone(),
    };
    let listener =
        tokio::net::TcpListener::bind((config.admin_host.as_str(), config.admin_port)).await?;
    info!(addr = %listener.local_addr()?, "admin api listening");
    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        let serve = axum::serve(listener, admin::router(admin_state))
            .with_graceful_shutdown(admin_shutdown.cancelled_owned());
        if let Err(e) = serve.await {
            error!(err = %e, "admin server failed");
        }
    });

    if snapshot.use_events {
        tokio::spawn(run_event_listener(
            docker.clone(),
            Arc::clone(&settings),
            Arc::clone(&state),
            trigger_tx.clone(),
            shutdown.clone(),
        ));
    }

    monitor.run(trigger_rx, shutdown).await;
    let _ = admin_task.await;
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
