// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod config;
pub mod consumer;
pub mod error;
pub mod gate;
pub mod handler;
pub mod lock;
pub mod marker;
pub mod message;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod scripts;
pub mod session;
pub mod store;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::consumer::{ConsumerConfig, StreamConsumer};
use crate::gate::ProcessingGate;
use crate::handler::PingHandler;
use crate::lock::LockManager;
use crate::marker::MarkerStore;
use crate::pipeline::Pipeline;
use crate::publisher::ReplyPublisher;
use crate::queue::PendingQueue;
use crate::scripts::ScriptRegistry;
use crate::store::Store;

/// Wire the worker and consume until a shutdown signal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let store = Store::connect(&config.redis_url, &config.key_prefix).await?;
    info!(url = %config.redis_url, prefix = %config.key_prefix, "store connected");

    let registry = Arc::new(ScriptRegistry::new(store.clone()));
    let gate = ProcessingGate::new(store.clone(), config.processing_ttl_secs);
    let queue = PendingQueue::new(
        store.clone(),
        Arc::clone(&registry),
        config.queue_max_size,
        config.queue_stale_threshold_ms,
        config.queue_max_dequeue_iterations,
        config.queue_ttl_secs,
    );
    let locks = LockManager::new(
        store.clone(),
        Arc::clone(&registry),
        config.lock_ttl_secs,
        config.lock_acquire_timeout(),
    );
    let publisher = ReplyPublisher::new(store.clone(), &config.reply_stream, config.stream_maxlen);

    let mut pipeline = Pipeline::new(gate, queue, locks, publisher, config.allowlist());
    pipeline.register("ping", Arc::new(PingHandler));

    let markers = MarkerStore::new(
        store.clone(),
        Arc::clone(&registry),
        &config.inbound_stream,
        &config.group,
        config.processing_ttl_secs,
        config.completed_ttl_secs,
    );
    let consumer = StreamConsumer::new(
        store,
        markers,
        Arc::new(pipeline),
        ConsumerConfig {
            stream_key: config.inbound_stream.clone(),
            group: config.group.clone(),
            consumer_name: config.effective_consumer_name(),
            batch_size: config.batch_size,
            block_timeout: config.block_timeout(),
            concurrency: config.concurrency,
            reset_offset_on_start: config.reset_offset_on_start,
            claim_min_idle: config.claim_min_idle(),
            claim_interval: config.claim_interval(),
        },
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    consumer.run(shutdown).await;
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
