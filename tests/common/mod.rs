#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use capstan::controller::result::{Container, ContainerSource, InvokeConfig, ProcessStdio};
use capstan::errors::Error;
use capstan::solver::{
    ContextReader, SolveOutcome, SolveRequest, SolveResponse, SolveStatus, Solver, Vertex,
};
use capstan::store::Node;
use tokio::sync::mpsc;

pub fn node(name: &str, endpoint: &str) -> Node {
    Node {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        platforms: vec![],
        flags: vec![],
        config_file: None,
        driver_opts: HashMap::new(),
    }
}

/// A container that stays alive until its process is cancelled, recording
/// every process start.
pub struct MockContainer {
    pub id: usize,
    pub available: AtomicBool,
    pub started: Mutex<Vec<InvokeConfig>>,
}

#[async_trait::async_trait]
impl Container for MockContainer {
    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start_process(&self, cfg: &InvokeConfig, _io: ProcessStdio) -> Result<i64, Error> {
        self.started.lock().unwrap().push(cfg.clone());
        // Interactive processes run until cancelled; cancellation drops
        // this future.
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(0)
    }

    async fn shutdown(&self) {
        self.available.store(false, Ordering::SeqCst);
    }
}

/// Source minting numbered [`MockContainer`]s.
#[derive(Default)]
pub struct MockSource {
    pub created: AtomicUsize,
    pub containers: Mutex<Vec<Arc<MockContainer>>>,
}

#[async_trait::async_trait]
impl ContainerSource for MockSource {
    async fn create_container(&self) -> Result<Arc<dyn Container>, Error> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        let container = Arc::new(MockContainer {
            id,
            available: AtomicBool::new(true),
            started: Mutex::new(Vec::new()),
        });
        self.containers.lock().unwrap().push(Arc::clone(&container));
        Ok(container)
    }
}

/// A solver that emits one vertex and then succeeds or fails, optionally
/// handing back a result handle either way.
pub struct MockSolver {
    pub fail: bool,
    pub source: Arc<MockSource>,
}

impl MockSolver {
    pub fn new(fail: bool) -> MockSolver {
        MockSolver {
            fail,
            source: Arc::new(MockSource::default()),
        }
    }
}

#[async_trait::async_trait]
impl Solver for MockSolver {
    async fn solve(
        &self,
        request: SolveRequest,
        _stdin: Option<ContextReader>,
        statuses: mpsc::Sender<SolveStatus>,
    ) -> SolveOutcome {
        let _ = statuses
            .send(SolveStatus {
                vertexes: vec![Vertex {
                    digest: String::from("sha256:0001"),
                    name: String::from("[1/1] FROM docker.io/library/alpine"),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await;

        let handle = capstan::controller::result::ResultHandle::new(
            request.ref_id.clone(),
            Arc::clone(&self.source) as Arc<dyn ContainerSource>,
        );

        let result = if self.fail {
            Err(Error::ValidationError {
                message: String::from(
                    "process \"/bin/sh -c make\" did not complete successfully: exit code 2",
                ),
            })
        } else {
            Ok(SolveResponse {
                exporter_response: HashMap::from([(
                    String::from("containerimage.digest"),
                    String::from("sha256:feed"),
                )]),
            })
        };

        SolveOutcome {
            handle: Some(handle),
            result,
        }
    }
}

/// Poll `probe` every few milliseconds until it returns true or the
/// deadline passes.
pub async fn wait_until<F: Fn() -> bool>(probe: F, what: &str) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
