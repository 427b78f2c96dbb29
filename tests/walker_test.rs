use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use capstan::errors::Error;
use capstan::walker::breakpoint::{BreakpointSet, LineBreakpoint, OnError, StopOnEntry};
use capstan::walker::controller::WalkerController;
use capstan::walker::{
    BreakContext, BreakHandler, Definition, Op, SourceRange, VertexHandler, VertexState, Walker,
};

mod common;
use crate::common::wait_until;

fn range(filename: &str, start: i64, end: i64) -> SourceRange {
    SourceRange {
        filename: filename.to_string(),
        start_line: start,
        end_line: end,
    }
}

fn op(name: &str, inputs: &[&str], ranges: Vec<SourceRange>) -> Op {
    Op {
        name: name.to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        ranges,
    }
}

/// base <- compile <- root, with a sibling fetch feeding root too.
fn sample_definition() -> Arc<Definition> {
    let mut ops = HashMap::new();
    ops.insert(
        String::from("sha256:base"),
        op("FROM alpine", &[], vec![range("Dockerfile", 1, 1)]),
    );
    ops.insert(
        String::from("sha256:fetch"),
        op("COPY . /src", &[], vec![range("Dockerfile", 2, 2)]),
    );
    ops.insert(
        String::from("sha256:compile"),
        op(
            "RUN make",
            &["sha256:base"],
            vec![range("Dockerfile", 3, 4)],
        ),
    );
    ops.insert(
        String::from("sha256:root"),
        op(
            "exporting to image",
            &["sha256:compile", "sha256:fetch"],
            vec![range("Dockerfile", 5, 5)],
        ),
    );
    Arc::new(Definition {
        root: String::from("sha256:root"),
        ops,
    })
}

fn recording_handlers() -> (
    VertexHandler,
    BreakHandler,
    Arc<Mutex<Vec<String>>>,
    Arc<Mutex<Vec<BreakContext>>>,
) {
    let visited = Arc::new(Mutex::new(Vec::new()));
    let breaks = Arc::new(Mutex::new(Vec::new()));

    let visits = Arc::clone(&visited);
    let on_vertex: VertexHandler = Arc::new(move |state: VertexState| {
        let visits = Arc::clone(&visits);
        Box::pin(async move {
            visits.lock().unwrap().push(state.digest.clone());
            Ok(())
        })
    });

    let hit_log = Arc::clone(&breaks);
    let on_break: BreakHandler = Arc::new(move |ctx: BreakContext| {
        let hit_log = Arc::clone(&hit_log);
        Box::pin(async move {
            hit_log.lock().unwrap().push(ctx);
        })
    });

    (on_vertex, on_break, visited, breaks)
}

#[tokio::test]
async fn walk_visits_dependencies_before_dependents() {
    let (on_vertex, on_break, visited, _breaks) = recording_handlers();
    let walker = Walker::new(on_vertex, on_break, Arc::new(BreakpointSet::new()));

    walker.walk(sample_definition()).await.unwrap();

    let order = visited.lock().unwrap().clone();
    assert_eq!(order.len(), 4);
    let pos = |digest: &str| order.iter().position(|d| d == digest).unwrap();
    assert!(pos("sha256:base") < pos("sha256:compile"));
    assert!(pos("sha256:compile") < pos("sha256:root"));
    assert!(pos("sha256:fetch") < pos("sha256:root"));
}

#[tokio::test]
async fn line_breakpoint_pauses_until_continue() {
    let (on_vertex, on_break, visited, breaks) = recording_handlers();
    let breakpoints = Arc::new(BreakpointSet::new());
    breakpoints.add(Arc::new(LineBreakpoint::new(String::from("Dockerfile"), 3)));

    let controller = Arc::new(WalkerController::new(on_vertex, on_break, breakpoints));
    controller.start_walk(sample_definition()).unwrap();

    wait_until(|| !breaks.lock().unwrap().is_empty(), "breakpoint hit").await;
    {
        let breaks = breaks.lock().unwrap();
        let ctx = &breaks[0];
        assert_eq!(ctx.state.digest, "sha256:compile");
        assert_eq!(ctx.hits.len(), 1);
        assert!(controller.is_running());
    }
    // The root depends on the paused vertex and must not have run.
    assert!(!visited.lock().unwrap().iter().any(|d| d == "sha256:root"));

    controller.continue_walk();
    controller.wait().await.unwrap();
    assert_eq!(visited.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn next_breaks_on_every_vertex() {
    let (on_vertex, on_break, _visited, breaks) = recording_handlers();
    let breakpoints = Arc::new(BreakpointSet::new());
    breakpoints.add(Arc::new(StopOnEntry::new()));

    let controller = Arc::new(WalkerController::new(on_vertex, on_break, breakpoints));
    controller.start_walk(sample_definition()).unwrap();

    wait_until(|| !breaks.lock().unwrap().is_empty(), "stop on entry").await;
    let after_entry = breaks.lock().unwrap().len();

    controller.next().unwrap();
    wait_until(
        || breaks.lock().unwrap().len() > after_entry,
        "single-step break",
    )
    .await;

    controller.continue_walk();
    controller.wait().await.unwrap();
}

#[tokio::test]
async fn error_triggers_on_error_break_and_fails_the_walk() {
    let breaks = Arc::new(Mutex::new(Vec::new()));
    let on_vertex: VertexHandler = Arc::new(|state: VertexState| {
        Box::pin(async move {
            if state.digest == "sha256:compile" {
                Err(Error::ValidationError {
                    message: String::from("exit code 2"),
                })
            } else {
                Ok(())
            }
        })
    });
    let hit_log = Arc::clone(&breaks);
    let on_break: BreakHandler = Arc::new(move |ctx: BreakContext| {
        let hit_log = Arc::clone(&hit_log);
        Box::pin(async move {
            hit_log.lock().unwrap().push(ctx);
        })
    });

    let breakpoints = Arc::new(BreakpointSet::new());
    breakpoints.add(Arc::new(OnError));
    let controller = Arc::new(WalkerController::new(on_vertex, on_break, breakpoints));
    controller.start_walk(sample_definition()).unwrap();

    wait_until(|| !breaks.lock().unwrap().is_empty(), "on-error break").await;
    assert_eq!(breaks.lock().unwrap()[0].state.digest, "sha256:compile");

    controller.continue_walk();
    let outcome = controller.wait().await;
    assert!(outcome.is_err(), "the walk surfaces the vertex error");
}

#[tokio::test]
async fn start_walk_conflicts_while_running_and_cancel_drains() {
    let (on_vertex, on_break, _visited, breaks) = recording_handlers();
    let breakpoints = Arc::new(BreakpointSet::new());
    breakpoints.add(Arc::new(StopOnEntry::new()));

    let controller = Arc::new(WalkerController::new(on_vertex, on_break, breakpoints));
    controller.start_walk(sample_definition()).unwrap();
    wait_until(|| !breaks.lock().unwrap().is_empty(), "walk paused").await;

    let err = controller.start_walk(sample_definition()).unwrap_err();
    assert!(matches!(err, Error::ConflictError { .. }));

    controller.walk_cancel().await.unwrap();
    assert!(!controller.is_running());
    assert!(controller.wait().await.is_err());

    // A new walk can start after the cancel.
    controller.start_walk(sample_definition()).unwrap();
    controller.continue_walk();
}

#[tokio::test]
async fn next_without_a_walk_is_an_error() {
    let (on_vertex, on_break, _visited, _breaks) = recording_handlers();
    let controller = Arc::new(WalkerController::new(
        on_vertex,
        on_break,
        Arc::new(BreakpointSet::new()),
    ));
    assert!(controller.next().is_err());
}

#[tokio::test]
async fn inspect_reports_cursors_while_paused() {
    let (on_vertex, on_break, _visited, breaks) = recording_handlers();
    let breakpoints = Arc::new(BreakpointSet::new());
    breakpoints.add(Arc::new(LineBreakpoint::new(String::from("Dockerfile"), 3)));

    let controller = Arc::new(WalkerController::new(on_vertex, on_break, breakpoints));
    controller.start_walk(sample_definition()).unwrap();
    wait_until(|| !breaks.lock().unwrap().is_empty(), "paused walk").await;

    let (definition, cursors) = controller.inspect();
    assert!(definition.is_some());
    assert!(cursors.contains(&range("Dockerfile", 3, 4)));

    controller.continue_walk();
    controller.wait().await.unwrap();
}
