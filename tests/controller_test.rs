use std::sync::atomic::Ordering;
use std::sync::Arc;

use capstan::build::BuildOptions;
use capstan::controller::result::InvokeConfig;
use capstan::controller::BuildController;
use capstan::errors::Error;
use tokio::sync::mpsc;

mod common;
use crate::common::{wait_until, MockSolver};

fn options() -> BuildOptions {
    BuildOptions {
        context_path: String::from("."),
        ..Default::default()
    }
}

fn attach_io() -> (
    std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
) {
    (
        Box::pin(tokio::io::empty()),
        Box::pin(tokio::io::sink()),
        Box::pin(tokio::io::sink()),
    )
}

#[tokio::test]
async fn successful_build_returns_exporter_response() {
    let solver = Arc::new(MockSolver::new(false));
    let controller = BuildController::new(solver);
    let (status_tx, mut status_rx) = mpsc::channel(16);

    let (response, _mappings) = controller.build(options(), None, status_tx).await.unwrap();
    assert_eq!(response.ref_id.len(), 32);
    assert_eq!(
        response.exporter_response.get("containerimage.digest"),
        Some(&String::from("sha256:feed"))
    );

    let status = status_rx.recv().await.expect("one status record");
    assert_eq!(status.vertexes.len(), 1);

    assert!(controller.result_handle().is_some());
    controller.close().await;
}

#[tokio::test]
async fn failed_build_keeps_the_result_handle() {
    let solver = Arc::new(MockSolver::new(true));
    let controller = BuildController::new(solver);
    let (status_tx, _status_rx) = mpsc::channel(16);

    let err = controller.build(options(), None, status_tx).await.unwrap_err();
    let Error::BuildError { ref_id, source } = &err else {
        panic!("expected a build error, got {err}");
    };
    assert_eq!(ref_id.len(), 32);
    assert!(source.to_string().contains("did not complete successfully"));

    let handle = controller.result_handle().expect("handle kept on failure");
    assert_eq!(handle.ref_id(), ref_id.as_str());
    controller.close().await;
}

#[tokio::test]
async fn concurrent_builds_conflict() {
    struct SlowSolver(Arc<MockSolver>);

    #[async_trait::async_trait]
    impl capstan::solver::Solver for SlowSolver {
        async fn solve(
            &self,
            request: capstan::solver::SolveRequest,
            stdin: Option<capstan::solver::ContextReader>,
            statuses: mpsc::Sender<capstan::solver::SolveStatus>,
        ) -> capstan::solver::SolveOutcome {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            self.0.solve(request, stdin, statuses).await
        }
    }

    let controller = Arc::new(BuildController::new(Arc::new(SlowSolver(Arc::new(
        MockSolver::new(false),
    )))));

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(16);
            controller.build(options(), None, tx).await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let (tx, _rx) = mpsc::channel(16);
    let err = controller.build(options(), None, tx).await.unwrap_err();
    assert!(matches!(err, Error::ConflictError { .. }));
    assert_eq!(err.to_string(), "build ongoing");

    first.await.unwrap().unwrap();
    controller.close().await;
}

#[tokio::test]
async fn invoke_attach_and_rollback_after_failure() {
    let solver = Arc::new(MockSolver::new(true));
    let source = Arc::clone(&solver.source);
    let controller = Arc::new(BuildController::new(solver));
    let (status_tx, _status_rx) = mpsc::channel(16);

    controller.build(options(), None, status_tx).await.unwrap_err();

    // Launch a shell against the failed build's result.
    let invoke1 = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let (stdin, stdout, stderr) = attach_io();
            let cfg = InvokeConfig {
                entrypoint: vec![String::from("sh")],
                ..Default::default()
            };
            controller.invoke("p1", cfg, stdin, stdout, stderr).await
        })
    };

    wait_until(
        || source.created.load(Ordering::SeqCst) == 1,
        "first container",
    )
    .await;
    wait_until(
        || {
            source.containers.lock().unwrap().first().is_some_and(|c| {
                c.started
                    .lock()
                    .unwrap()
                    .first()
                    .is_some_and(|cfg| cfg.entrypoint == vec![String::from("sh")])
            })
        },
        "shell started in first container",
    )
    .await;
    assert_eq!(controller.list_processes().len(), 1);
    assert_eq!(controller.list_processes()[0].pid(), "p1");

    // Roll back: a fresh container hosts the new p1, the old one is
    // cancelled and removed.
    let invoke2 = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let (stdin, stdout, stderr) = attach_io();
            let cfg = InvokeConfig {
                entrypoint: vec![String::from("sh")],
                rollback: true,
                ..Default::default()
            };
            controller.invoke("p1", cfg, stdin, stdout, stderr).await
        })
    };

    wait_until(
        || source.created.load(Ordering::SeqCst) == 2,
        "rollback container",
    )
    .await;
    // The replaced invoke returns, either through its cancelled process or
    // its detached attach.
    let _ = invoke1.await.unwrap();

    wait_until(
        || {
            source.containers.lock().unwrap().get(1).is_some_and(|c| {
                !c.started.lock().unwrap().is_empty()
            })
        },
        "shell started in rollback container",
    )
    .await;
    assert_eq!(controller.list_processes().len(), 1);

    // The first container was shut down by the swap.
    assert!(!source.containers.lock().unwrap()[0]
        .available
        .load(Ordering::SeqCst));

    controller.disconnect_process("p1").unwrap();
    let _ = invoke2.await.unwrap();
    assert!(controller.list_processes().is_empty());
    controller.close().await;
}

#[tokio::test]
async fn invoke_without_result_is_not_found() {
    let controller = BuildController::new(Arc::new(MockSolver::new(false)));
    let (stdin, stdout, stderr) = attach_io();
    let err = controller
        .invoke(
            "p1",
            InvokeConfig {
                entrypoint: vec![String::from("sh")],
                ..Default::default()
            },
            stdin,
            stdout,
            stderr,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn invoke_requires_a_command() {
    let solver = Arc::new(MockSolver::new(false));
    let controller = BuildController::new(solver);
    let (status_tx, _status_rx) = mpsc::channel(16);
    controller.build(options(), None, status_tx).await.unwrap();

    let (stdin, stdout, stderr) = attach_io();
    let err = controller
        .invoke("p1", InvokeConfig::default(), stdin, stdout, stderr)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidationError { .. }));
    controller.close().await;
}
