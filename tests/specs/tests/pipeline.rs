// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end dispatch scenarios against a real store: consumer →
//! idempotency → gate → lock → handler → replies. Gated on
//! `RELAY_SPEC_REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay::consumer::{ConsumerConfig, StreamConsumer};
use relay::error::RelayError;
use relay::marker::Claim;
use relay::message::InboundMessage;
use relay::pipeline::Pipeline;

use relay_specs::{wait_until, RecordingHandler, SpecContext};

struct Harness {
    ctx: SpecContext,
    inbound: String,
    replies: String,
    group: String,
}

impl Harness {
    fn new(ctx: SpecContext) -> Self {
        let inbound = ctx.stream("inbound");
        let replies = ctx.stream("replies");
        Self { ctx, inbound, replies, group: "spec-workers".to_owned() }
    }

    fn pipeline(&self, handler: Arc<RecordingHandler>) -> Pipeline {
        let mut pipeline = Pipeline::new(
            self.ctx.gate(60),
            self.ctx.queue(5, 3_600_000, 10),
            self.ctx.locks(60, Duration::from_secs(5)),
            self.ctx.publisher(&self.replies, 1000),
            None,
        );
        pipeline.register("cmd", handler);
        pipeline
    }

    fn consumer(&self, pipeline: Pipeline) -> StreamConsumer {
        // Reclaim thresholds far above the test budget: only the
        // dedicated reclaim test lowers them.
        self.consumer_with_claim(pipeline, Duration::from_secs(60), Duration::from_secs(60))
    }

    fn consumer_with_claim(
        &self,
        pipeline: Pipeline,
        claim_min_idle: Duration,
        claim_interval: Duration,
    ) -> StreamConsumer {
        StreamConsumer::new(
            self.ctx.store.clone(),
            self.ctx.markers(&self.inbound, &self.group),
            Arc::new(pipeline),
            ConsumerConfig {
                stream_key: self.inbound.clone(),
                group: self.group.clone(),
                consumer_name: "spec-consumer".to_owned(),
                batch_size: 10,
                block_timeout: Duration::from_millis(200),
                concurrency: 4,
                reset_offset_on_start: true,
                claim_min_idle,
                claim_interval,
            },
        )
    }
}

#[tokio::test]
async fn s1_happy_path() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let (handler, calls) = RecordingHandler::new();
    let consumer = harness.consumer(harness.pipeline(handler));

    let shutdown = CancellationToken::new();
    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    let entry_id = harness
        .ctx
        .add_inbound(&harness.inbound, &[("room", "r1"), ("userId", "u1"), ("text", "/cmd a")])
        .await?;

    let marker_key = harness.ctx.store.keys().marker_key(&entry_id);
    let done = wait_until(Duration::from_secs(5), || {
        let ctx = &harness.ctx;
        let key = marker_key.clone();
        async move { ctx.get_raw(&key).await.ok().flatten().as_deref() == Some("completed") }
    })
    .await;
    shutdown.cancel();
    consumer_task.await?;
    assert!(done, "entry never completed");

    assert_eq!(calls.lock().map(|c| c.clone()).unwrap_or_default(), vec!["r1:a"]);

    let replies = harness.ctx.stream_entries(&harness.replies).await?;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].get("chatId").map(String::as_str), Some("r1"));
    assert_eq!(replies[0].get("text").map(String::as_str), Some("done"));
    assert_eq!(replies[0].get("type").map(String::as_str), Some("final"));

    // Gate is free again.
    assert!(!harness.ctx.gate(60).is_processing("r1").await?);
    Ok(())
}

#[tokio::test]
async fn s2_concurrent_same_chat_queues_then_drains() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let (handler, calls) = RecordingHandler::slow(Duration::from_millis(400));
    let pipeline = Arc::new(harness.pipeline(handler));

    // Entry ids carry the log timestamp; keep them current so the
    // buffered one is not discarded as stale at drain time.
    let now = relay::store::epoch_ms();
    let first = InboundMessage {
        entry_id: format!("{now}-0"),
        chat_id: "r1".to_owned(),
        user_id: "u1".to_owned(),
        text: "/cmd one".to_owned(),
        thread_id: None,
        sender: Some("Alice".to_owned()),
    };
    let second = InboundMessage {
        entry_id: format!("{}-0", now + 1),
        chat_id: "r1".to_owned(),
        user_id: "u2".to_owned(),
        text: "/cmd two".to_owned(),
        thread_id: None,
        sender: Some("Bob".to_owned()),
    };

    let first_task = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.dispatch(&first).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The gate is busy: this one gets buffered and notified.
    pipeline.dispatch(&second).await?;

    first_task.await?.map_err(|e| anyhow::anyhow!("first dispatch failed: {e}"))?;

    // Both ran, in arrival order, under one gate tenure.
    assert_eq!(
        calls.lock().map(|c| c.clone()).unwrap_or_default(),
        vec!["r1:one", "r1:two"]
    );

    let replies = harness.ctx.stream_entries(&harness.replies).await?;
    let texts: Vec<&str> = replies.iter().filter_map(|r| r.get("text").map(String::as_str)).collect();
    assert_eq!(texts.len(), 3, "two results plus one queued notice: {texts:?}");
    assert_eq!(texts.iter().filter(|t| **t == "done").count(), 2);
    assert!(texts.iter().any(|t| t.contains("queued")), "missing queue notice: {texts:?}");

    assert!(!harness.ctx.gate(60).is_processing("r1").await?);
    assert_eq!(harness.ctx.queue(5, 3_600_000, 10).size("r1").await?, 0);
    Ok(())
}

#[tokio::test]
async fn s3_duplicate_redelivery_is_skipped() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let (handler, calls) = RecordingHandler::new();
    let consumer = harness.consumer(harness.pipeline(handler));

    let shutdown = CancellationToken::new();
    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    let entry_id = harness
        .ctx
        .add_inbound(&harness.inbound, &[("room", "r1"), ("userId", "u1"), ("text", "/cmd x")])
        .await?;
    let marker_key = harness.ctx.store.keys().marker_key(&entry_id);
    let done = wait_until(Duration::from_secs(5), || {
        let ctx = &harness.ctx;
        let key = marker_key.clone();
        async move { ctx.get_raw(&key).await.ok().flatten().as_deref() == Some("completed") }
    })
    .await;
    shutdown.cancel();
    consumer_task.await?;
    assert!(done, "entry never completed");

    // A second delivery of the same entry id acks without running.
    let markers = harness.ctx.markers(&harness.inbound, &harness.group);
    assert_eq!(markers.claim_or_skip(&entry_id).await?, Claim::SkipCompleted);

    assert_eq!(calls.lock().map(|c| c.len()).unwrap_or_default(), 1);
    assert_eq!(harness.ctx.stream_entries(&harness.replies).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn handler_failure_leaves_the_marker_processing() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let handler = RecordingHandler::failing(|| {
        RelayError::store(
            "spec_dependency",
            redis::RedisError::from((redis::ErrorKind::IoError, "dependency down")),
        )
    });
    let consumer = harness.consumer(harness.pipeline(handler));

    let shutdown = CancellationToken::new();
    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    let entry_id = harness
        .ctx
        .add_inbound(&harness.inbound, &[("room", "r1"), ("userId", "u1"), ("text", "/cmd x")])
        .await?;
    let marker_key = harness.ctx.store.keys().marker_key(&entry_id);
    let claimed = wait_until(Duration::from_secs(5), || {
        let ctx = &harness.ctx;
        let key = marker_key.clone();
        async move { ctx.get_raw(&key).await.ok().flatten().is_some() }
    })
    .await;
    // Give the worker a beat to (wrongly) complete, then stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    consumer_task.await?;
    assert!(claimed, "entry never claimed");

    // No ACK without completion: the marker stays at processing so the
    // TTL re-opens the entry for redelivery.
    assert_eq!(
        harness.ctx.get_raw(&marker_key).await?.as_deref(),
        Some("processing")
    );
    // The store-level failure produced no user-visible reply.
    assert_eq!(harness.ctx.stream_entries(&harness.replies).await?.len(), 0);

    // The gate was still paired: nothing left hanging.
    assert!(!harness.ctx.gate(60).is_processing("r1").await?);
    Ok(())
}

#[tokio::test]
async fn stale_deliveries_are_reclaimed_from_a_dead_peer() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let (handler, calls) = RecordingHandler::new();

    // A peer reads the entry into its pending list and dies before
    // acking: the entry is invisible to plain group reads from then on.
    let mut conn = harness.ctx.store.conn();
    let _: () = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&harness.inbound)
        .arg(&harness.group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await?;
    let entry_id = harness
        .ctx
        .add_inbound(&harness.inbound, &[("room", "r1"), ("userId", "u1"), ("text", "/cmd lost")])
        .await?;
    let _: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(&harness.group)
        .arg("dead-consumer")
        .arg("COUNT")
        .arg(10)
        .arg("STREAMS")
        .arg(&harness.inbound)
        .arg(">")
        .query_async(&mut conn)
        .await?;

    let consumer = harness.consumer_with_claim(
        harness.pipeline(handler),
        Duration::from_millis(100),
        Duration::from_secs(1),
    );
    let shutdown = CancellationToken::new();
    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    let marker_key = harness.ctx.store.keys().marker_key(&entry_id);
    let done = wait_until(Duration::from_secs(8), || {
        let ctx = &harness.ctx;
        let key = marker_key.clone();
        async move { ctx.get_raw(&key).await.ok().flatten().as_deref() == Some("completed") }
    })
    .await;
    shutdown.cancel();
    consumer_task.await?;
    assert!(done, "stale delivery never reclaimed and completed");
    assert_eq!(calls.lock().map(|c| c.clone()).unwrap_or_default(), vec!["r1:lost"]);
    Ok(())
}

#[tokio::test]
async fn invalid_entries_are_acked_and_skipped() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let harness = Harness::new(ctx);
    let (handler, calls) = RecordingHandler::new();
    let consumer = harness.consumer(harness.pipeline(handler));

    let shutdown = CancellationToken::new();
    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    // Missing text: rejected at decode, acked, never dispatched.
    harness.ctx.add_inbound(&harness.inbound, &[("room", "r1")]).await?;
    // A valid entry afterwards proves the loop kept going.
    let valid_id = harness
        .ctx
        .add_inbound(&harness.inbound, &[("room", "r1"), ("userId", "u1"), ("text", "/cmd ok")])
        .await?;

    let marker_key = harness.ctx.store.keys().marker_key(&valid_id);
    let done = wait_until(Duration::from_secs(5), || {
        let ctx = &harness.ctx;
        let key = marker_key.clone();
        async move { ctx.get_raw(&key).await.ok().flatten().as_deref() == Some("completed") }
    })
    .await;
    shutdown.cancel();
    consumer_task.await?;
    assert!(done, "valid entry never completed");

    assert_eq!(calls.lock().map(|c| c.clone()).unwrap_or_default(), vec!["r1:ok"]);
    Ok(())
}
