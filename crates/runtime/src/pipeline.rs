// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline coordinator: gate + queue + lock + dispatcher glue.
//!
//! For each inbound message the coordinator decides between immediate
//! execution (gate acquired: run under the session lock, then drain the
//! backlog in the same gate tenure) and deferral (gate busy: buffer in
//! the pending queue and notify). The consumer must not see an `Ok`
//! until the work either finished or was durably deferred — that `Ok`
//! is what lets the idempotency marker complete and the entry ACK.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::consumer::StreamHandler;
use crate::error::RelayError;
use crate::gate::{GateStart, ProcessingGate};
use crate::handler::{parse_command, Command, CommandHandler, HandlerFuture, ReplySink};
use crate::lock::LockManager;
use crate::message::{InboundMessage, PendingMessage, ReplyKind};
use crate::publisher::ReplyPublisher;
use crate::queue::{Dequeue, Enqueue, PendingQueue};
use crate::store::epoch_ms;

// User-visible notifications. Short, templated; raw store errors never
// reach the chat.
const NOTICE_QUEUED: &str =
    "Your message is queued and will run when the current command finishes.";
const NOTICE_QUEUE_FULL: &str =
    "Too many messages are already waiting for this chat. Try again shortly.";
const NOTICE_EXTERNAL_DOWN: &str =
    "A service this command depends on is unavailable right now. Try again later.";

fn notice_lock_busy(holder: Option<&str>) -> String {
    match holder {
        Some(name) => format!("{name} is already running a command here. Please wait."),
        None => "Another command is already running here. Please wait.".to_owned(),
    }
}

/// Chat admission: `None` admits everyone, otherwise membership.
fn admitted(allowlist: Option<&HashSet<String>>, chat_id: &str) -> bool {
    allowlist.is_none_or(|list| list.contains(chat_id))
}

/// The per-message dispatch protocol over gate, queue, and lock.
pub struct Pipeline {
    gate: ProcessingGate,
    queue: PendingQueue,
    locks: LockManager,
    publisher: ReplyPublisher,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    allowlist: Option<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        gate: ProcessingGate,
        queue: PendingQueue,
        locks: LockManager,
        publisher: ReplyPublisher,
        allowlist: Option<HashSet<String>>,
    ) -> Self {
        Self { gate, queue, locks, publisher, handlers: HashMap::new(), allowlist }
    }

    /// Register a command handler. Later registrations win.
    pub fn register(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.to_lowercase(), handler);
    }

    /// Entry point per inbound message. `Ok` means the entry may be
    /// marked completed; `Err` leaves the marker to expire and the
    /// entry to be redelivered.
    pub async fn dispatch(&self, msg: &InboundMessage) -> Result<(), RelayError> {
        if !admitted(self.allowlist.as_ref(), &msg.chat_id) {
            debug!(chat = %msg.chat_id, "chat not on allowlist, dropping");
            return Ok(());
        }
        let Some(command) = parse_command(&msg.text) else {
            return Ok(());
        };
        if !self.handlers.contains_key(&command.name) {
            debug!(chat = %msg.chat_id, command = %command.name, "unknown command");
            return Ok(());
        }

        match self.gate.start(&msg.chat_id).await? {
            GateStart::Acquired => self.run_gated(msg, &command).await,
            GateStart::Busy => self.defer(msg).await,
        }
    }

    /// Immediate branch: handler under the session lock, then backlog
    /// drain, all inside one gate tenure. The gate is finished on every
    /// path.
    async fn run_gated(&self, msg: &InboundMessage, command: &Command) -> Result<(), RelayError> {
        let outcome = match self.run_command(msg, command).await {
            Ok(()) => {
                self.drain(&msg.chat_id).await;
                Ok(())
            }
            Err(e) => self.report_failure(msg, e).await,
        };
        if let Err(e) = self.gate.finish(&msg.chat_id).await {
            // TTL is the fallback exit; don't mask the handler outcome.
            warn!(chat = %msg.chat_id, err = %e, "gate finish failed");
        }
        outcome
    }

    /// Run one command under the chat's session lock.
    async fn run_command(&self, msg: &InboundMessage, command: &Command) -> Result<(), RelayError> {
        let Some(handler) = self.handlers.get(&command.name).map(Arc::clone) else {
            return Ok(());
        };
        let holder = msg.sender.as_deref().unwrap_or(&msg.user_id);
        let publisher = &self.publisher;
        self.locks
            .with_lock(&msg.chat_id, Some(holder), move || async move {
                let sink = ReplySink::new(publisher, &msg.chat_id, msg.thread_id.as_deref());
                handler.handle(msg, command, sink).await
            })
            .await
    }

    /// Queued branch: buffer the message and tell the user what happened.
    async fn defer(&self, msg: &InboundMessage) -> Result<(), RelayError> {
        let pending = PendingMessage {
            user_id: msg.user_id.clone(),
            content: msg.text.clone(),
            thread_id: msg.thread_id.clone(),
            sender: msg.sender.clone(),
            enqueued_at_ms: msg.log_timestamp_ms().unwrap_or_else(epoch_ms),
        };
        match self.queue.enqueue(&msg.chat_id, &pending).await? {
            Enqueue::Queued => {
                self.notify(msg, NOTICE_QUEUED).await;
            }
            Enqueue::Duplicate => {
                debug!(chat = %msg.chat_id, user = %msg.user_id, "duplicate pending entry");
            }
            Enqueue::Full => {
                self.notify(msg, NOTICE_QUEUE_FULL).await;
            }
        }
        Ok(())
    }

    /// Post-handler drain: consume the backlog under the already-held
    /// gate, oldest first, up to the configured iteration cap. Errors
    /// on a drained message are reported against that message and stop
    /// the drain only when the store itself is failing.
    async fn drain(&self, chat_id: &str) {
        for iteration in 0..=self.queue.max_dequeue_iterations() {
            match self.queue.dequeue(chat_id, iteration).await {
                Ok(Dequeue::Item(pending)) => {
                    let msg = InboundMessage::from_pending(chat_id, &pending);
                    let Some(command) = parse_command(&msg.text) else {
                        continue;
                    };
                    if !self.handlers.contains_key(&command.name) {
                        continue;
                    }
                    if let Err(e) = self.run_command(&msg, &command).await {
                        let transient = e.is_transient();
                        let _ = self.report_failure(&msg, e).await;
                        if transient {
                            break;
                        }
                    }
                }
                Ok(Dequeue::Empty) => break,
                Ok(Dequeue::Exhausted) => {
                    debug!(chat = %chat_id, "drain cap reached, backlog waits for next arrival");
                    break;
                }
                Err(e) => {
                    warn!(chat = %chat_id, err = %e, "dequeue failed, stopping drain");
                    break;
                }
            }
        }
    }

    /// Map a handler failure to its user-visible and delivery outcome.
    async fn report_failure(
        &self,
        msg: &InboundMessage,
        err: RelayError,
    ) -> Result<(), RelayError> {
        match &err {
            RelayError::LockContention { holder } => {
                self.notify(msg, &notice_lock_busy(holder.as_deref())).await;
                Ok(())
            }
            RelayError::ExternalService { message } => {
                warn!(chat = %msg.chat_id, detail = %message, "external dependency failed");
                self.notify(msg, NOTICE_EXTERNAL_DOWN).await;
                Ok(())
            }
            RelayError::DataCorruption { what, detail } => {
                // Poison payload: redelivery cannot fix it, so complete.
                error!(chat = %msg.chat_id, what = %what, detail = %detail, "corrupt payload");
                Ok(())
            }
            RelayError::ScriptMissing { name } => {
                error!(chat = %msg.chat_id, script = %name, "script never registered");
                Err(err)
            }
            _ => {
                // Transient store failures: no user message, propagate so
                // the marker expires and the entry is redelivered.
                warn!(chat = %msg.chat_id, err = %err, "handler failed");
                Err(err)
            }
        }
    }

    async fn notify(&self, msg: &InboundMessage, text: &str) {
        if let Err(e) = self
            .publisher
            .publish_text(&msg.chat_id, msg.thread_id.as_deref(), text, ReplyKind::Final)
            .await
        {
            warn!(chat = %msg.chat_id, err = %e, "notification publish failed");
        }
    }
}

impl StreamHandler for Pipeline {
    fn handle<'a>(&'a self, message: &'a InboundMessage) -> HandlerFuture<'a> {
        Box::pin(self.dispatch(message))
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
