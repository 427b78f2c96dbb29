use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use capstan::dap::{Adapter, LaunchHandler, Request, ServerMessage};
use capstan::errors::Error;
use capstan::walker::breakpoint::BreakpointSet;
use capstan::walker::controller::WalkerController;
use capstan::walker::{BreakHandler, Definition, Op, SourceRange, VertexHandler, VertexState};
use serde_json::{json, Value};
use tokio::sync::mpsc;

mod common;

fn linear_definition() -> Arc<Definition> {
    let mut ops = HashMap::new();
    ops.insert(
        String::from("sha256:base"),
        Op {
            name: String::from("FROM alpine"),
            inputs: vec![],
            ranges: vec![SourceRange {
                filename: String::from("Dockerfile"),
                start_line: 1,
                end_line: 1,
            }],
        },
    );
    ops.insert(
        String::from("sha256:root"),
        Op {
            name: String::from("RUN make"),
            inputs: vec![String::from("sha256:base")],
            ranges: vec![SourceRange {
                filename: String::from("Dockerfile"),
                start_line: 2,
                end_line: 2,
            }],
        },
    );
    Arc::new(Definition {
        root: String::from("sha256:root"),
        ops,
    })
}

struct FixedLaunch(Arc<Definition>);

impl LaunchHandler for FixedLaunch {
    fn definition(&self, _arguments: &Value) -> Result<Arc<Definition>, Error> {
        Ok(Arc::clone(&self.0))
    }
}

struct Harness {
    requests: mpsc::Sender<Request>,
    messages: mpsc::Receiver<ServerMessage>,
    seq: i64,
    serve: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn new() -> (Harness, Arc<WalkerController>) {
        let (message_tx, message_rx) = mpsc::channel(64);

        let on_vertex: VertexHandler =
            Arc::new(|_state: VertexState| Box::pin(async move { Ok(()) }));
        let on_break: BreakHandler = Adapter::stopped_event_handler(message_tx.clone());
        let controller = Arc::new(WalkerController::new(
            on_vertex,
            on_break,
            Arc::new(BreakpointSet::new()),
        ));

        let adapter = Adapter::new(
            Arc::clone(&controller),
            Arc::new(FixedLaunch(linear_definition())),
            message_tx,
        );
        let (request_tx, request_rx) = mpsc::channel(64);
        let serve = tokio::spawn(adapter.serve(request_rx));

        (
            Harness {
                requests: request_tx,
                messages: message_rx,
                seq: 0,
                serve,
            },
            controller,
        )
    }

    async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        self.seq += 1;
        self.requests
            .send(Request {
                seq: self.seq,
                command: command.to_string(),
                arguments,
            })
            .await
            .expect("adapter accepts requests");
        self.seq
    }

    /// Read messages until `predicate` matches one, failing after a grace
    /// period.
    async fn expect<F: Fn(&ServerMessage) -> bool>(&mut self, predicate: F, what: &str) -> ServerMessage {
        loop {
            let message = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.messages.recv(),
            )
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .unwrap_or_else(|| panic!("adapter hung up waiting for {what}"));
            if predicate(&message) {
                return message;
            }
        }
    }
}

fn is_response_to(message: &ServerMessage, command: &str) -> bool {
    matches!(message, ServerMessage::Response(r) if r.command == command)
}

fn is_event(message: &ServerMessage, name: &str) -> bool {
    matches!(message, ServerMessage::Event(e) if e.event == name)
}

#[tokio::test]
async fn full_debug_session() {
    let (mut harness, _controller) = Harness::new();

    harness.send("initialize", Value::Null).await;
    harness
        .expect(|m| is_event(m, "initialized"), "initialized event")
        .await;
    let init = harness
        .expect(|m| is_response_to(m, "initialize"), "initialize response")
        .await;
    let ServerMessage::Response(init) = init else {
        unreachable!()
    };
    assert!(init.success);
    assert_eq!(
        init.body.get("supportsConfigurationDoneRequest"),
        Some(&json!(true))
    );

    // Break on the RUN line before launching.
    harness
        .send(
            "setBreakpoints",
            json!({
                "source": { "path": "Dockerfile" },
                "breakpoints": [ { "line": 2 } ],
            }),
        )
        .await;
    let bp = harness
        .expect(|m| is_response_to(m, "setBreakpoints"), "breakpoints response")
        .await;
    let ServerMessage::Response(bp) = bp else {
        unreachable!()
    };
    assert_eq!(
        bp.body.get("breakpoints"),
        Some(&json!([ { "verified": false, "line": 2 } ]))
    );

    harness
        .send("launch", json!({ "name": "docker-bake" }))
        .await;
    harness.send("configurationDone", Value::Null).await;

    let started = harness
        .expect(
            |m| matches!(m, ServerMessage::Event(e) if e.event == "thread"
                && e.body.get("reason") == Some(&json!("started"))),
            "thread started event",
        )
        .await;
    let ServerMessage::Event(started) = started else {
        unreachable!()
    };
    let thread_id = started.body.get("threadId").cloned().unwrap();

    harness
        .expect(|m| is_event(m, "stopped"), "stopped event at breakpoint")
        .await;

    // While stopped, the paused frame is visible.
    harness.send("threads", Value::Null).await;
    let threads = harness
        .expect(|m| is_response_to(m, "threads"), "threads response")
        .await;
    let ServerMessage::Response(threads) = threads else {
        unreachable!()
    };
    assert_eq!(
        threads.body.get("threads"),
        Some(&json!([ { "id": thread_id, "name": "docker-bake" } ]))
    );

    harness.send("stackTrace", json!({ "threadId": thread_id })).await;
    let stack = harness
        .expect(|m| is_response_to(m, "stackTrace"), "stack trace response")
        .await;
    let ServerMessage::Response(stack) = stack else {
        unreachable!()
    };
    let frames = stack.body.get("stackFrames").and_then(Value::as_array).unwrap();
    assert!(frames
        .iter()
        .any(|f| f.get("line") == Some(&json!(2))));

    harness.send("continue", Value::Null).await;
    harness
        .expect(
            |m| matches!(m, ServerMessage::Event(e) if e.event == "thread"
                && e.body.get("reason") == Some(&json!("exited"))),
            "thread exited event",
        )
        .await;
    harness
        .expect(|m| is_event(m, "terminated"), "terminated event")
        .await;

    harness.send("disconnect", Value::Null).await;
    harness
        .expect(|m| is_response_to(m, "disconnect"), "disconnect response")
        .await;
    harness.serve.await.unwrap();
}

#[tokio::test]
async fn unknown_commands_fail_gracefully() {
    let (mut harness, _controller) = Harness::new();
    harness.send("readMemory", Value::Null).await;
    let response = harness
        .expect(|m| is_response_to(m, "readMemory"), "error response")
        .await;
    let ServerMessage::Response(response) = response else {
        unreachable!()
    };
    assert!(!response.success);
    assert!(response.message.unwrap().contains("unsupported command"));
}
