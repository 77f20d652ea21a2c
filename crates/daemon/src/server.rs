//! Control socket: a Unix-domain, line-delimited JSON-RPC surface the
//! query server uses for mutation hints, sync triggers, and status.
//!
//! This is daemon-internal plumbing, not the external tool protocol.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::lifecycle::HintRouter;
use crate::status::build_sync_status;
use groundeffect_core::Error as CoreError;
use store::Store;
use sync::MutationHint;

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  #[serde(default)]
  pub id: Option<serde_json::Value>,
  pub method: String,
  #[serde(default)]
  pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
  pub code: String,
  pub message: String,
}

impl Response {
  pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
    Self {
      id,
      result: Some(result),
      error: None,
    }
  }

  pub fn failure(id: Option<serde_json::Value>, code: &str, message: &str) -> Self {
    Self {
      id,
      result: None,
      error: Some(RpcError {
        code: code.to_string(),
        message: message.to_string(),
      }),
    }
  }
}

/// Handles one decoded control request.
pub struct ControlHandler {
  store: Arc<Store>,
  hints: Arc<HintRouter>,
}

impl ControlHandler {
  pub fn new(store: Arc<Store>, hints: Arc<HintRouter>) -> Self {
    Self { store, hints }
  }

  pub async fn handle(&self, request: Request) -> Response {
    debug!("control request: {}", request.method);
    match request.method.as_str() {
      "ping" => Response::success(request.id, serde_json::json!("pong")),

      "status" => match build_sync_status(&self.store).await {
        Ok(status) => match serde_json::to_value(&status) {
          Ok(value) => Response::success(request.id, value),
          Err(e) => Response::failure(request.id, "INTERNAL_ERROR", &e.to_string()),
        },
        Err(e) => Response::failure(request.id, e.code(), &e.to_string()),
      },

      "trigger_sync" => {
        let accounts: Vec<String> = request.params["accounts"]
          .as_array()
          .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
          .unwrap_or_default();
        let targets = if accounts.is_empty() {
          self.hints.known_accounts()
        } else {
          accounts
        };

        let mut delivered = 0;
        for account in &targets {
          if self.hints.send(account, MutationHint::TriggerSync).await {
            delivered += 1;
          }
        }
        Response::success(request.id, serde_json::json!({ "triggered": delivered }))
      }

      "mutation_hint" => {
        let Some(account) = request.params["account"].as_str() else {
          return Response::failure(request.id, "BAD_REQUEST", "missing account");
        };
        let hint = match request.params["kind"].as_str() {
          Some("mail_sent") => MutationHint::MailSent,
          Some("calendar_changed") => MutationHint::CalendarChanged {
            provider_event_id: request.params["event_id"].as_str().map(String::from),
          },
          Some(other) => {
            return Response::failure(request.id, "BAD_REQUEST", &format!("unknown hint kind {}", other));
          }
          None => return Response::failure(request.id, "BAD_REQUEST", "missing hint kind"),
        };

        if self.hints.send(account, hint).await {
          Response::success(request.id, serde_json::json!({ "delivered": true }))
        } else {
          Response::failure(request.id, "ACCOUNT_NOT_FOUND", account)
        }
      }

      other => Response::failure(request.id, "BAD_REQUEST", &format!("unknown method {}", other)),
    }
  }
}

/// Unix socket server for the control surface.
pub struct Server {
  socket_path: PathBuf,
  handler: Arc<ControlHandler>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Server {
  pub fn new(socket_path: PathBuf, handler: Arc<ControlHandler>) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      socket_path,
      handler,
      shutdown_tx,
    }
  }

  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle {
      tx: self.shutdown_tx.clone(),
    }
  }

  pub async fn run(&self) -> Result<(), ServerError> {
    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    if let Some(parent) = self.socket_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&self.socket_path)?;
    info!("control socket listening on {:?}", self.socket_path);

    let mut shutdown_rx = self.shutdown_tx.subscribe();
    loop {
      tokio::select! {
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, _)) => {
              let handler = Arc::clone(&self.handler);
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                  error!("control connection error: {}", e);
                }
              });
            }
            Err(e) => error!("control accept error: {}", e),
          }
        }
        _ = shutdown_rx.recv() => break,
      }
    }

    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    Ok(())
  }
}

#[derive(Clone)]
pub struct ShutdownHandle {
  tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
  pub fn shutdown(&self) {
    let _ = self.tx.send(());
  }
}

async fn handle_connection(stream: UnixStream, handler: Arc<ControlHandler>) -> Result<(), ServerError> {
  let (reader, mut writer) = stream.into_split();
  let mut reader = BufReader::new(reader);
  let mut line = String::new();

  loop {
    line.clear();
    if reader.read_line(&mut line).await? == 0 {
      return Ok(());
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<Request>(trimmed) {
      Ok(request) => handler.handle(request).await,
      Err(e) => Response::failure(None, "BAD_REQUEST", &format!("malformed request: {}", e)),
    };

    let mut payload = serde_json::to_string(&response)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
  }
}

/// Client side of the control socket, used by the query server.
pub struct ControlClient {
  socket_path: PathBuf,
}

impl ControlClient {
  pub fn new(socket_path: impl Into<PathBuf>) -> Self {
    Self {
      socket_path: socket_path.into(),
    }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Fire one request and read one response. A daemon that is not
  /// running surfaces as a connection error the caller can soften.
  pub async fn call(&self, method: &str, params: serde_json::Value) -> groundeffect_core::Result<Response> {
    let stream = UnixStream::connect(&self.socket_path)
      .await
      .map_err(|e| CoreError::ConnectionFailed {
        host: self.socket_path.to_string_lossy().into_owned(),
        reason: e.to_string(),
      })?;
    let (reader, mut writer) = stream.into_split();

    let request = Request {
      id: Some(serde_json::json!(1)),
      method: method.to_string(),
      params,
    };
    let mut payload = serde_json::to_string(&request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
  }
}
