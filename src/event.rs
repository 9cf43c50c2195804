//! Line-delimited JSON channel between the agent and its host.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::agent::notify::{Notification, Platform};
use crate::agent::router::FetchOutcome;
use crate::agent::{AgentEvent, ControlMessage, Lifecycle};
use crate::net::Request;

/// Inbound host events, one JSON object per line
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
  Fetch { id: u64, request: WireRequest },
  Sync { tag: String },
  Push { data: Option<String> },
  NotificationClick { action: Option<String> },
  Message { data: ControlMessage },
  Shutdown,
}

#[derive(Debug, Deserialize)]
pub struct WireRequest {
  #[serde(default = "default_method")]
  pub method: String,
  /// Absolute, or relative to the app origin
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Base64
  pub body: Option<String>,
}

fn default_method() -> String {
  "GET".to_string()
}

impl WireRequest {
  pub fn into_request(self, origin: &Url) -> Result<Request> {
    let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;
    let url = origin
      .join(&self.url)
      .map_err(|e| eyre!("Invalid url '{}': {}", self.url, e))?;
    let body = match self.body {
      Some(body) => STANDARD
        .decode(body)
        .map_err(|e| eyre!("Invalid base64 body: {}", e))?,
      None => Vec::new(),
    };

    Ok(Request {
      method,
      url,
      headers: self.headers.into_iter().collect(),
      body,
    })
  }
}

impl HostEvent {
  pub fn into_agent_event(self, origin: &Url) -> Result<AgentEvent> {
    Ok(match self {
      Self::Fetch { id, request } => AgentEvent::Fetch {
        id,
        request: request.into_request(origin)?,
      },
      Self::Sync { tag } => AgentEvent::Sync { tag },
      Self::Push { data } => AgentEvent::Push { data },
      Self::NotificationClick { action } => AgentEvent::NotificationClick { action },
      Self::Message { data } => AgentEvent::Message(data),
      Self::Shutdown => AgentEvent::Shutdown,
    })
  }
}

/// Outbound messages to the host, one JSON object per line
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
  Response {
    id: u64,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    /// Base64
    body: String,
    source: &'static str,
  },
  /// The host should perform this request itself
  Passthrough { id: u64 },
  ShowNotification { notification: Notification },
  CloseNotification,
  OpenWindow { url: String },
  Lifecycle { state: Lifecycle },
  Error { id: Option<u64>, message: String },
}

impl HostMessage {
  pub fn from_outcome(id: u64, outcome: FetchOutcome) -> Self {
    match outcome {
      FetchOutcome::Passthrough => Self::Passthrough { id },
      FetchOutcome::Respond(result) => Self::Response {
        id,
        status: result.response.status,
        status_text: result.response.status_text,
        headers: result.response.headers,
        body: STANDARD.encode(&result.response.body),
        source: result.source.as_str(),
      },
    }
  }
}

/// Cloneable handle for queueing host messages.
#[derive(Clone)]
pub struct HostOutput {
  tx: mpsc::UnboundedSender<HostMessage>,
}

impl HostOutput {
  pub fn send(&self, message: HostMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .map_err(|_| eyre!("Host channel closed"))
  }
}

/// Spawn the writer that serializes host messages onto `out`.
pub fn spawn_writer<W>(mut out: W) -> (HostOutput, JoinHandle<()>)
where
  W: AsyncWrite + Unpin + Send + 'static,
{
  let (tx, mut rx) = mpsc::unbounded_channel::<HostMessage>();

  let handle = tokio::spawn(async move {
    while let Some(message) = rx.recv().await {
      let mut line = match serde_json::to_vec(&message) {
        Ok(line) => line,
        Err(e) => {
          warn!(error = %e, "Failed to serialize host message");
          continue;
        }
      };
      line.push(b'\n');

      if let Err(e) = out.write_all(&line).await {
        warn!(error = %e, "Host output closed");
        break;
      }
      let _ = out.flush().await;
    }
  });

  (HostOutput { tx }, handle)
}

/// Spawn the reader that turns host lines into agent events.
///
/// Malformed lines are reported back as `error` messages. End of input is
/// delivered as a shutdown event.
pub fn spawn_reader<R>(
  input: R,
  origin: Url,
  output: HostOutput,
) -> mpsc::UnboundedReceiver<AgentEvent>
where
  R: AsyncBufRead + Unpin + Send + 'static,
{
  let (tx, rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    let mut lines = input.lines();
    loop {
      let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => break,
        Err(e) => {
          warn!(error = %e, "Failed to read host input");
          break;
        }
      };

      if line.trim().is_empty() {
        continue;
      }

      let event = serde_json::from_str::<HostEvent>(&line)
        .map_err(|e| eyre!("Malformed event: {}", e))
        .and_then(|event| event.into_agent_event(&origin));

      match event {
        Ok(event) => {
          if tx.send(event).is_err() {
            return;
          }
        }
        Err(e) => {
          debug!(line = %line, "Rejected host line");
          let _ = output.send(HostMessage::Error {
            id: event_id(&line),
            message: e.to_string(),
          });
        }
      }
    }

    let _ = tx.send(AgentEvent::Shutdown);
  });

  rx
}

/// Best-effort id extraction so errors can be correlated with fetches.
fn event_id(line: &str) -> Option<u64> {
  serde_json::from_str::<serde_json::Value>(line)
    .ok()?
    .get("id")?
    .as_u64()
}

/// Forward fetch replies to the host.
pub fn forward_replies(
  mut replies: mpsc::UnboundedReceiver<(u64, FetchOutcome)>,
  output: HostOutput,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some((id, outcome)) = replies.recv().await {
      if output.send(HostMessage::from_outcome(id, outcome)).is_err() {
        break;
      }
    }
  })
}

/// Forward lifecycle transitions to the host.
pub fn forward_lifecycle(mut states: watch::Receiver<Lifecycle>, output: HostOutput) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      let state = *states.borrow_and_update();
      if output.send(HostMessage::Lifecycle { state }).is_err() {
        break;
      }
      if state == Lifecycle::ShutDown || states.changed().await.is_err() {
        break;
      }
    }
  })
}

/// Platform calls delivered as host messages.
pub struct StdioPlatform {
  output: HostOutput,
}

impl StdioPlatform {
  pub fn new(output: HostOutput) -> Self {
    Self { output }
  }
}

#[async_trait]
impl Platform for StdioPlatform {
  async fn show_notification(&self, notification: &Notification) -> Result<()> {
    self.output.send(HostMessage::ShowNotification {
      notification: notification.clone(),
    })
  }

  async fn close_notification(&self) -> Result<()> {
    self.output.send(HostMessage::CloseNotification)
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    self.output.send(HostMessage::OpenWindow {
      url: url.to_string(),
    })
  }
}
