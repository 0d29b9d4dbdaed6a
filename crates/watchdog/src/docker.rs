// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal Docker Engine API client over the Unix socket.
//!
//! One short-lived HTTP/1 connection per request; the `/events`
//! subscription keeps its connection open and yields newline-delimited
//! JSON objects as they arrive. Only the three endpoints the watchdog
//! needs are implemented.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    /// Lifecycle state: `running`, `restarting`, `exited`, ...
    #[serde(rename = "State", default)]
    pub state: String,
    /// Human status line; carries the health suffix when a healthcheck
    /// exists, e.g. `Up 2 hours (healthy)`.
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl ContainerSummary {
    /// Primary name without the leading slash the engine prepends.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }
}

/// A container event from `GET /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl DockerEvent {
    /// Container name from the actor attributes, when present.
    pub fn container_name(&self) -> Option<&str> {
        self.actor.attributes.get("name").map(String::as_str)
    }
}

/// Engine API client bound to one socket path.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into() }
    }

    /// Open a fresh connection and issue one request. The connection
    /// driver is spawned; the caller owns the response (and, for
    /// streaming endpoints, keeps the body alive).
    async fn open(&self, method: Method, path_and_query: &str) -> anyhow::Result<Response<Incoming>> {
        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(|e| anyhow::anyhow!("connect {}: {e}", self.socket.display()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::trace!(err = %e, "engine connection closed");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;
        Ok(sender.send_request(request).await?)
    }

    /// Issue a request and collect the full body.
    async fn send(&self, method: Method, path_and_query: &str) -> anyhow::Result<(StatusCode, Bytes)> {
        let response = self.open(method, path_and_query).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }

    /// List the named containers (running or not). Unknown names are
    /// simply absent from the result.
    pub async fn list_containers(&self, names: &[String]) -> anyhow::Result<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "name": names }).to_string();
        let path = format!(
            "/containers/json?all=true&filters={}",
            utf8_percent_encode(&filters, NON_ALPHANUMERIC)
        );
        let (status, body) = self.send(Method::GET, &path).await?;
        if !status.is_success() {
            anyhow::bail!("container list failed: {status}: {}", body_excerpt(&body));
        }
        let listed: Vec<ContainerSummary> = serde_json::from_slice(&body)?;
        // The engine filter is a substring match; keep exact names only.
        Ok(listed.into_iter().filter(|c| names.iter().any(|n| n == c.name())).collect())
    }

    /// Fetch a single target's summary, or `None` when it is gone.
    pub async fn inspect_target(&self, name: &str) -> anyhow::Result<Option<ContainerSummary>> {
        let listed = self.list_containers(&[name.to_owned()]).await?;
        Ok(listed.into_iter().find(|c| c.name() == name))
    }

    /// Restart a container with the given stop budget.
    pub async fn restart_container(&self, name: &str, timeout_secs: u64) -> anyhow::Result<()> {
        let path = format!(
            "/containers/{}/restart?t={timeout_secs}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        );
        let (status, body) = self.send(Method::POST, &path).await?;
        if !status.is_success() {
            anyhow::bail!("restart {name} failed: {status}: {}", body_excerpt(&body));
        }
        Ok(())
    }

    /// Subscribe to container events for the named targets.
    pub async fn events(&self, names: &[String]) -> anyhow::Result<EventStream> {
        let filters = serde_json::json!({
            "type": ["container"],
            "container": names,
        })
        .to_string();
        let path = format!("/events?filters={}", utf8_percent_encode(&filters, NON_ALPHANUMERIC));
        let response = self.open(Method::GET, &path).await?;
        if !response.status().is_success() {
            anyhow::bail!("event subscribe failed: {}", response.status());
        }
        Ok(EventStream { body: response.into_body(), buffer: Vec::new() })
    }
}

fn body_excerpt(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}...")
    } else {
        trimmed.to_owned()
    }
}

/// Open `/events` subscription yielding one parsed event at a time.
pub struct EventStream {
    body: Incoming,
    buffer: Vec<u8>,
}

impl EventStream {
    /// Next event, or `None` when the engine closed the stream.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<DockerEvent>> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<DockerEvent>(&line) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => {
                        tracing::debug!(err = %e, "unparseable engine event, skipping");
                        continue;
                    }
                }
            }
            match self.body.frame().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
            }
        }
    }
}

/// Split one newline-terminated line off the front of the buffer.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

#[cfg(test)]
#[path = "docker_tests.rs"]
mod tests;
