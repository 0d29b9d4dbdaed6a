// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Component-level tests against a real store. Gated on
//! `RELAY_SPEC_REDIS_URL`; without it every test is a no-op.

use std::time::Duration;

use relay::error::RelayError;
use relay::gate::GateStart;
use relay::marker::Claim;
use relay::message::PendingMessage;
use relay::queue::{Dequeue, Enqueue};
use relay::store::epoch_ms;

use relay_specs::SpecContext;

fn pending(user: &str, ts: u64, content: &str) -> PendingMessage {
    PendingMessage {
        user_id: user.to_owned(),
        content: content.to_owned(),
        thread_id: None,
        sender: None,
        enqueued_at_ms: ts,
    }
}

// -- gate ---------------------------------------------------------------------

#[tokio::test]
async fn gate_serializes_one_chat() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let gate = ctx.gate(60);

    assert_eq!(gate.start("r1").await?, GateStart::Acquired);
    assert!(gate.is_processing("r1").await?);
    assert_eq!(gate.start("r1").await?, GateStart::Busy);

    // A different chat is unaffected.
    assert_eq!(gate.start("r2").await?, GateStart::Acquired);

    gate.finish("r1").await?;
    assert!(!gate.is_processing("r1").await?);
    assert_eq!(gate.start("r1").await?, GateStart::Acquired);
    Ok(())
}

// -- queue --------------------------------------------------------------------

#[tokio::test]
async fn queue_preserves_enqueue_order() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 3_600_000, 10);
    let now = epoch_ms();

    assert_eq!(queue.enqueue("r1", &pending("u1", now, "first")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u2", now + 1, "second")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u3", now + 2, "third")).await?, Enqueue::Queued);
    assert_eq!(queue.size("r1").await?, 3);

    let mut drained = Vec::new();
    for iteration in 0..5 {
        match queue.dequeue("r1", iteration).await? {
            Dequeue::Item(item) => drained.push(item.content),
            Dequeue::Empty => break,
            Dequeue::Exhausted => break,
        }
    }
    assert_eq!(drained, vec!["first", "second", "third"]);
    assert_eq!(queue.size("r1").await?, 0);
    Ok(())
}

#[tokio::test]
async fn queue_ties_break_by_user_id() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 3_600_000, 10);
    let now = epoch_ms();

    // Same timestamp, reverse insertion order.
    assert_eq!(queue.enqueue("r1", &pending("u2", now, "from-u2")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u1", now, "from-u1")).await?, Enqueue::Queued);

    let Dequeue::Item(first) = queue.dequeue("r1", 0).await? else {
        anyhow::bail!("expected an item");
    };
    assert_eq!(first.user_id, "u1");
    Ok(())
}

#[tokio::test]
async fn queue_suppresses_duplicates() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 3_600_000, 10);
    let entry = pending("u1", 1_718_000_000_000, "pressed twice");

    assert_eq!(queue.enqueue("r1", &entry).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &entry).await?, Enqueue::Duplicate);
    assert_eq!(queue.size("r1").await?, 1);
    Ok(())
}

#[tokio::test]
async fn queue_full_and_duplicate_on_full() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(2, 3_600_000, 10);
    let now = epoch_ms();

    assert_eq!(queue.enqueue("r1", &pending("u1", now, "a")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u2", now + 1, "b")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u3", now + 2, "c")).await?, Enqueue::Full);

    // A duplicate of a held entry reports duplicate even at capacity.
    assert_eq!(queue.enqueue("r1", &pending("u1", now, "a")).await?, Enqueue::Duplicate);
    assert_eq!(queue.size("r1").await?, 2);
    Ok(())
}

#[tokio::test]
async fn queue_discards_stale_backlog() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 60_000, 10);
    let old = epoch_ms() - 120_000;

    assert_eq!(queue.enqueue("r1", &pending("u1", old, "stale-1")).await?, Enqueue::Queued);
    assert_eq!(queue.enqueue("r1", &pending("u2", old + 1, "stale-2")).await?, Enqueue::Queued);

    assert_eq!(queue.dequeue("r1", 0).await?, Dequeue::Empty);
    assert_eq!(queue.size("r1").await?, 0);
    Ok(())
}

#[tokio::test]
async fn queue_reports_exhaustion_at_the_iteration_cap() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 3_600_000, 3);

    queue.enqueue("r1", &pending("u1", epoch_ms(), "waiting")).await?;
    assert_eq!(queue.dequeue("r1", 3).await?, Dequeue::Exhausted);
    // The entry is still there for the next tenure.
    assert_eq!(queue.size("r1").await?, 1);
    Ok(())
}

#[tokio::test]
async fn queue_clear_drops_both_keys() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let queue = ctx.queue(5, 3_600_000, 10);

    queue.enqueue("r1", &pending("u1", epoch_ms(), "x")).await?;
    assert!(queue.has_pending("r1").await?);
    queue.clear("r1").await?;
    assert!(!queue.has_pending("r1").await?);
    assert!(queue.raw_entries("r1").await?.is_empty());
    Ok(())
}

// -- lock ---------------------------------------------------------------------

#[tokio::test]
async fn lock_is_reentrant_within_a_task() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let locks = ctx.locks(60, Duration::from_secs(5));

    let inner_locks = locks.clone();
    let result: Result<u32, RelayError> = locks
        .with_lock("r1", Some("alice"), move || async move {
            let nested = inner_locks
                .with_lock("r1", Some("alice"), move || async move { Ok(21u32) })
                .await?;
            Ok(nested * 2)
        })
        .await;
    assert_eq!(result.ok(), Some(42));

    // Fully released: a fresh acquisition succeeds immediately.
    let again: Result<(), RelayError> =
        locks.with_lock("r1", Some("bob"), move || async move { Ok(()) }).await;
    assert!(again.is_ok());
    Ok(())
}

#[tokio::test]
async fn lock_contention_reports_the_holder() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let holder_locks = ctx.locks(60, Duration::from_secs(5));
    let waiter_locks = ctx.locks(60, Duration::from_millis(200));

    let held = tokio::spawn(async move {
        holder_locks
            .with_lock("r1", Some("alice"), move || async move {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome: Result<(), RelayError> =
        waiter_locks.with_lock("r1", Some("bob"), move || async move { Ok(()) }).await;
    match outcome {
        Err(RelayError::LockContention { holder }) => {
            assert_eq!(holder.as_deref(), Some("alice"));
        }
        other => anyhow::bail!("expected contention, got {other:?}"),
    }

    held.await?.map_err(|e| anyhow::anyhow!("holder failed: {e}"))?;
    Ok(())
}

#[tokio::test]
async fn lock_releases_after_a_failing_body() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let locks = ctx.locks(60, Duration::from_secs(5));

    let failed: Result<(), RelayError> = locks
        .with_lock("r1", Some("alice"), move || async move {
            Err(RelayError::ExternalService { message: "llm down".to_owned() })
        })
        .await;
    assert!(failed.is_err());

    // The failure still released the lock.
    let holder = locks.get_holder("r1").await?;
    assert_eq!(holder, None);
    let reacquired: Result<(), RelayError> =
        locks.with_lock("r1", Some("bob"), move || async move { Ok(()) }).await;
    assert!(reacquired.is_ok());
    Ok(())
}

#[tokio::test]
async fn lock_holder_is_readable_while_held() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let locks = ctx.locks(60, Duration::from_secs(5));
    let observer = locks.clone();

    let seen: Result<Option<String>, RelayError> = locks
        .with_lock("r1", Some("carol"), move || async move { observer.get_holder("r1").await })
        .await;
    assert_eq!(seen.ok().flatten().as_deref(), Some("carol"));
    assert_eq!(locks.get_holder("r1").await?, None);
    Ok(())
}

#[tokio::test]
async fn shared_lock_is_advisory_and_non_reentrant() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let locks = ctx.locks(60, Duration::from_secs(5));
    let ttl = Duration::from_secs(30);

    assert!(locks.try_acquire_shared("maintenance", ttl).await?);
    // Second acquisition is a plain false, not an error.
    assert!(!locks.try_acquire_shared("maintenance", ttl).await?);
    locks.release_shared("maintenance").await?;
    assert!(locks.try_acquire_shared("maintenance", ttl).await?);
    Ok(())
}

// -- session ------------------------------------------------------------------

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct GameSession {
    round: u32,
    topic: String,
}

#[tokio::test]
async fn session_round_trips_and_distinguishes_absent() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let sessions = ctx.sessions::<GameSession>(60);

    assert_eq!(sessions.load("s1").await?, None);
    assert!(!sessions.exists("s1").await?);
    assert!(!sessions.refresh_ttl("s1").await?);

    let record = GameSession { round: 3, topic: "capitals".to_owned() };
    sessions.save("s1", &record).await?;
    assert_eq!(sessions.load("s1").await?, Some(record));
    assert!(sessions.exists("s1").await?);
    assert!(sessions.refresh_ttl("s1").await?);

    sessions.delete("s1").await?;
    assert_eq!(sessions.load("s1").await?, None);
    Ok(())
}

#[tokio::test]
async fn session_corruption_is_not_a_miss() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let sessions = ctx.sessions::<GameSession>(60);

    ctx.set_raw(&ctx.store.keys().session_key("s1"), "not json at all").await?;
    match sessions.load("s1").await {
        Err(RelayError::DataCorruption { .. }) => {}
        other => anyhow::bail!("expected corruption, got {other:?}"),
    }
    Ok(())
}

// -- scripts ------------------------------------------------------------------

#[tokio::test]
async fn unregistered_script_is_a_programming_error() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let outcome: Result<i64, RelayError> =
        ctx.registry.exec("spec_exec", "never_registered", &[], &[]).await;
    match outcome {
        Err(RelayError::ScriptMissing { name }) => assert_eq!(name, "never_registered"),
        other => anyhow::bail!("expected script_missing, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn scripts_reload_after_server_side_eviction() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    ctx.registry.register("spec_echo", "return ARGV[1]");

    let first: String =
        ctx.registry.exec("spec_exec", "spec_echo", &[], &["hello".to_owned()]).await?;
    assert_eq!(first, "hello");

    // Evict everything server-side; the registry must reload and retry.
    let mut conn = ctx.store.conn();
    let _: String = redis::cmd("SCRIPT").arg("FLUSH").query_async(&mut conn).await?;

    let second: String =
        ctx.registry.exec("spec_exec", "spec_echo", &[], &["again".to_owned()]).await?;
    assert_eq!(second, "again");
    Ok(())
}

// -- idempotency markers ------------------------------------------------------

#[tokio::test]
async fn marker_state_machine() -> anyhow::Result<()> {
    let Some(ctx) = SpecContext::connect().await? else { return Ok(()) };
    let stream = ctx.stream("inbound");
    let markers = ctx.markers(&stream, "spec-group");
    let entry_id = format!("{}-0", epoch_ms());

    // Absent → claim wins and sets processing.
    assert_eq!(markers.claim_or_skip(&entry_id).await?, Claim::Proceed);
    assert_eq!(
        ctx.get_raw(&ctx.store.keys().marker_key(&entry_id)).await?.as_deref(),
        Some("processing")
    );

    // Processing → a second delivery must not run or ack.
    assert_eq!(markers.claim_or_skip(&entry_id).await?, Claim::SkipInProgress);

    // Completed → later deliveries ack-and-skip.
    markers.mark_completed(&entry_id).await?;
    assert_eq!(
        ctx.get_raw(&ctx.store.keys().marker_key(&entry_id)).await?.as_deref(),
        Some("completed")
    );
    assert_eq!(markers.claim_or_skip(&entry_id).await?, Claim::SkipCompleted);
    Ok(())
}
