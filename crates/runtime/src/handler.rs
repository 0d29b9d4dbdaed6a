// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command parsing and the handler seam.
//!
//! Game and info handlers live in their own services; the runtime only
//! knows this trait. Object-safe via the boxed-future shape so the
//! pipeline can hold a registry of `Arc<dyn CommandHandler>`.

use std::future::Future;
use std::pin::Pin;

use crate::error::RelayError;
use crate::message::{InboundMessage, ReplyKind};
use crate::publisher::ReplyPublisher;

/// A parsed `/name args...` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name without the leading slash.
    pub name: String,
    /// Remainder of the line, trimmed. Empty when the command is bare.
    pub args: String,
}

/// Parse a chat line into a command. Non-command text returns `None`;
/// the pipeline treats that as a no-op that never occupies the gate.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().filter(|n| !n.is_empty())?;
    let args = parts.next().unwrap_or("").trim().to_owned();
    Some(Command { name: name.to_lowercase(), args })
}

/// Outbound sink bound to the chat (and thread) a handler is serving.
pub struct ReplySink<'a> {
    publisher: &'a ReplyPublisher,
    chat_id: &'a str,
    thread_id: Option<&'a str>,
}

impl<'a> ReplySink<'a> {
    pub fn new(
        publisher: &'a ReplyPublisher,
        chat_id: &'a str,
        thread_id: Option<&'a str>,
    ) -> Self {
        Self { publisher, chat_id, thread_id }
    }

    /// Emit a final reply.
    pub async fn reply(&self, text: &str) -> Result<(), RelayError> {
        self.publisher
            .publish_text(self.chat_id, self.thread_id, text, ReplyKind::Final)
            .await
            .map(|_| ())
    }

    /// Emit an intermediate (streaming) reply.
    pub async fn partial(&self, text: &str) -> Result<(), RelayError> {
        self.publisher
            .publish_text(self.chat_id, self.thread_id, text, ReplyKind::Partial)
            .await
            .map(|_| ())
    }
}

/// Boxed future alias for handler returns.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>>;

/// A command implementation. Invoked with the session lock held and the
/// chat gate occupied; at most one invocation runs per chat at a time.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        command: &'a Command,
        replies: ReplySink<'a>,
    ) -> HandlerFuture<'a>;
}

/// Built-in liveness command carried by every worker.
pub struct PingHandler;

impl CommandHandler for PingHandler {
    fn handle<'a>(
        &'a self,
        _message: &'a InboundMessage,
        _command: &'a Command,
        replies: ReplySink<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { replies.reply("pong").await })
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
