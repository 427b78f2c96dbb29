//! A message-driven debug adapter translating a generic debug protocol into
//! walker-controller operations.
//!
//! The adapter is transport-agnostic: requests arrive over a channel and
//! responses/events leave over another. Each evaluated build becomes a
//! *thread* with an id from a monotonic pool; thread start and exit events
//! are emitted as the walk starts and stops. Breakpoints are forwarded to
//! the walker and always reported back as unverified, since only the walk
//! itself can prove a line maps onto a vertex.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::Error;
use crate::walker::breakpoint::LineBreakpoint;
use crate::walker::controller::WalkerController;
use crate::walker::{BreakHandler, Definition};

/// An incoming protocol request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Sequence number assigned by the client.
    pub seq: i64,
    /// Command name, such as `launch` or `stackTrace`.
    pub command: String,
    /// Command arguments; shape depends on the command.
    #[serde(default)]
    pub arguments: Value,
}

/// An outgoing response to one request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Marker for the wire protocol.
    #[serde(rename = "type")]
    pub message_type: &'static str,
    /// Sequence number of the request this answers.
    pub request_seq: i64,
    /// The command this answers.
    pub command: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Error text when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Command specific payload.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// An outgoing event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Marker for the wire protocol.
    #[serde(rename = "type")]
    pub message_type: &'static str,
    /// Event name, such as `thread` or `terminated`.
    pub event: String,
    /// Event specific payload.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Anything the adapter sends to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A response to a request.
    Response(Response),
    /// A spontaneous event.
    Event(Event),
}

/// Resolves a `launch` request to the definition the walker should
/// traverse; implemented by the build integration.
pub trait LaunchHandler: Send + Sync {
    /// Produce the definition for a launch request.
    fn definition(&self, arguments: &Value) -> Result<Arc<Definition>, Error>;
}

#[derive(Debug, Clone)]
struct Thread {
    id: i64,
    name: String,
}

/// The debug adapter.
pub struct Adapter {
    controller: Arc<WalkerController>,
    launcher: Arc<dyn LaunchHandler>,
    threads: Arc<RwLock<HashMap<i64, Thread>>>,
    id_pool: AtomicI64,
    sender: mpsc::Sender<ServerMessage>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("threads", &self.threads.read().unwrap().len())
            .finish()
    }
}

impl Adapter {
    /// An adapter speaking over `sender`, driving `controller`.
    pub fn new(
        controller: Arc<WalkerController>,
        launcher: Arc<dyn LaunchHandler>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Arc<Adapter> {
        Arc::new(Adapter {
            controller,
            launcher,
            threads: Arc::new(RwLock::new(HashMap::new())),
            id_pool: AtomicI64::new(1),
            sender,
        })
    }

    /// A walker break handler that reports pauses as `stopped` events.
    pub fn stopped_event_handler(sender: mpsc::Sender<ServerMessage>) -> BreakHandler {
        Arc::new(move |ctx| {
            let sender = sender.clone();
            Box::pin(async move {
                let reason = if ctx.hits.is_empty() {
                    "step"
                } else {
                    "breakpoint"
                };
                let _ = sender
                    .send(ServerMessage::Event(Event {
                        message_type: "event",
                        event: String::from("stopped"),
                        body: json!({
                            "reason": reason,
                            "allThreadsStopped": true,
                        }),
                    }))
                    .await;
            })
        })
    }

    /// Serve requests until the channel closes or a disconnect arrives.
    pub async fn serve(self: Arc<Adapter>, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.recv().await {
            if let ControlFlow::Break(()) = self.dispatch(request).await {
                break;
            }
        }
        debug!("debug adapter loop finished");
    }

    async fn dispatch(&self, request: Request) -> ControlFlow<()> {
        debug!("debug adapter request: {}", request.command);
        let mut flow = ControlFlow::Continue(());
        let result = match request.command.as_str() {
            "initialize" => {
                self.emit("initialized", Value::Null).await;
                Ok(json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsTerminateRequest": true,
                }))
            }
            "launch" => self.launch(&request.arguments).await,
            "configurationDone" => Ok(Value::Null),
            "setBreakpoints" => self.set_breakpoints(&request.arguments),
            "continue" => {
                self.controller.continue_walk();
                Ok(json!({ "allThreadsContinued": true }))
            }
            "next" => self.controller.next().map(|()| Value::Null),
            "threads" => {
                let threads: Vec<Value> = self
                    .threads
                    .read()
                    .unwrap()
                    .values()
                    .map(|t| json!({ "id": t.id, "name": t.name }))
                    .collect();
                Ok(json!({ "threads": threads }))
            }
            "stackTrace" => Ok(self.stack_trace()),
            "disconnect" | "terminate" => {
                flow = ControlFlow::Break(());
                let result = self.controller.walk_cancel().await.map(|()| Value::Null);
                self.emit("exited", json!({ "exitCode": 0 })).await;
                result
            }
            other => Err(Error::invalid(format!("unsupported command {other:?}"))),
        };

        let response = match result {
            Ok(body) => Response {
                message_type: "response",
                request_seq: request.seq,
                command: request.command,
                success: true,
                message: None,
                body,
            },
            Err(e) => Response {
                message_type: "response",
                request_seq: request.seq,
                command: request.command,
                success: false,
                message: Some(e.to_string()),
                body: Value::Null,
            },
        };
        if self.sender.send(ServerMessage::Response(response)).await.is_err() {
            warn!("debug adapter client went away");
            return ControlFlow::Break(());
        }
        flow
    }

    async fn launch(&self, arguments: &Value) -> Result<Value, Error> {
        let definition = self.launcher.definition(arguments)?;
        self.controller.start_walk(definition)?;

        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("build")
            .to_string();
        let id = self.id_pool.fetch_add(1, Ordering::SeqCst);
        self.threads
            .write()
            .unwrap()
            .insert(id, Thread { id, name });
        self.emit("thread", json!({ "reason": "started", "threadId": id }))
            .await;

        // Report thread exit when the walk drains.
        let controller = Arc::clone(&self.controller);
        let threads = Arc::clone(&self.threads);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let outcome = controller.wait().await;
            threads.write().unwrap().remove(&id);
            let _ = sender
                .send(ServerMessage::Event(Event {
                    message_type: "event",
                    event: String::from("thread"),
                    body: json!({ "reason": "exited", "threadId": id }),
                }))
                .await;
            let _ = sender
                .send(ServerMessage::Event(Event {
                    message_type: "event",
                    event: String::from("terminated"),
                    body: Value::Null,
                }))
                .await;
            if let Err(e) = outcome {
                debug!("walk for thread {id} failed: {e}");
            }
        });

        Ok(Value::Null)
    }

    fn set_breakpoints(&self, arguments: &Value) -> Result<Value, Error> {
        let path = arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let requested: Vec<i64> = arguments
            .get("breakpoints")
            .and_then(Value::as_array)
            .map(|bps| {
                bps.iter()
                    .filter_map(|bp| bp.get("line").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();

        let breakpoints = self.controller.breakpoints();
        breakpoints.clear();
        let mut reported = Vec::new();
        for line in requested {
            breakpoints.add(Arc::new(LineBreakpoint::new(path.clone(), line)));
            // Verification would need the walk itself to map lines onto
            // vertices.
            reported.push(json!({ "verified": false, "line": line }));
        }
        Ok(json!({ "breakpoints": reported }))
    }

    fn stack_trace(&self) -> Value {
        let (_, cursors) = self.controller.inspect();
        let frames: Vec<Value> = cursors
            .iter()
            .enumerate()
            .map(|(i, range)| {
                json!({
                    "id": i as i64,
                    "name": range.filename,
                    "line": range.start_line,
                    "endLine": range.end_line,
                    "source": { "path": range.filename },
                })
            })
            .collect();
        let total = frames.len();
        json!({ "stackFrames": frames, "totalFrames": total })
    }

    async fn emit(&self, event: &str, body: Value) {
        let _ = self
            .sender
            .send(ServerMessage::Event(Event {
                message_type: "event",
                event: event.to_string(),
                body,
            }))
            .await;
    }
}
