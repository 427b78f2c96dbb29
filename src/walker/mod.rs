//! The breakpoint-driven walker over a build-graph definition.
//!
//! The walker visits every operation of a [`Definition`] leaves first: a
//! vertex's handler runs only after the handlers of all its inputs, while
//! siblings run concurrently. After each vertex the breakpoint set is
//! probed; a hit invokes the break handler and parks the vertex until the
//! controller resumes the walk.

pub mod breakpoint;
pub mod controller;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use log::{debug, trace};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::errors::Error;
use breakpoint::BreakpointSet;

/// A half-open range of source lines attributed to a vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRange {
    /// Source file the range points into.
    pub filename: String,
    /// First line of the range, 1-based.
    pub start_line: i64,
    /// Last line of the range, inclusive.
    pub end_line: i64,
}

/// One operation of the build graph.
#[derive(Debug, Clone, Default)]
pub struct Op {
    /// Human readable operation name.
    pub name: String,
    /// Digests of the operations this one consumes.
    pub inputs: Vec<String>,
    /// Source locations that produced the operation.
    pub ranges: Vec<SourceRange>,
}

/// A build-graph definition: operations keyed by digest, plus the root the
/// build solves for.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    /// Digest of the result vertex.
    pub root: String,
    /// All operations, keyed by digest.
    pub ops: HashMap<String, Op>,
}

impl Definition {
    fn validate(&self) -> Result<(), Error> {
        if !self.ops.contains_key(&self.root) {
            return Err(Error::invalid(format!(
                "definition root {} has no operation",
                self.root
            )));
        }
        for (digest, op) in &self.ops {
            for input in &op.inputs {
                if !self.ops.contains_key(input) {
                    return Err(Error::invalid(format!(
                        "operation {digest} references unknown input {input}"
                    )));
                }
            }
        }
        // Reject cycles up front; a cyclic graph would park the walk
        // forever.
        let mut visiting = HashMap::new();
        for digest in self.ops.keys() {
            self.check_cycles(digest, &mut visiting)?;
        }
        Ok(())
    }

    fn check_cycles(&self, digest: &str, state: &mut HashMap<String, bool>) -> Result<(), Error> {
        match state.get(digest) {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(Error::invalid(format!(
                    "definition contains a cycle through {digest}"
                )))
            }
            None => {}
        }
        state.insert(digest.to_string(), false);
        for input in &self.ops[digest].inputs {
            self.check_cycles(input, state)?;
        }
        state.insert(digest.to_string(), true);
        Ok(())
    }
}

/// The walker's view of the vertex currently being handled.
#[derive(Debug, Clone)]
pub struct VertexState {
    /// Digest of the vertex.
    pub digest: String,
    /// Operation name.
    pub name: String,
    /// Source ranges attributed to the vertex.
    pub ranges: Vec<SourceRange>,
}

/// Everything a break handler gets to inspect while the walk is paused.
#[derive(Debug, Clone)]
pub struct BreakContext {
    /// The vertex that triggered the break.
    pub state: VertexState,
    /// Source ranges of every vertex currently in flight.
    pub cursors: Vec<SourceRange>,
    /// Ranges that fired, per breakpoint key.
    pub hits: HashMap<String, Vec<SourceRange>>,
    /// The walked definition.
    pub definition: Arc<Definition>,
    /// The active breakpoint set.
    pub breakpoints: Arc<BreakpointSet>,
}

/// Handler invoked for every vertex, in dependency order.
pub type VertexHandler =
    Arc<dyn Fn(VertexState) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Handler invoked when a breakpoint fires. It reports the pause to the
/// user; the walk stays parked after it returns, until the controller
/// resumes.
pub type BreakHandler = Arc<dyn Fn(BreakContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// State shared between a running walk and its controller.
pub(crate) struct WalkShared {
    /// Set by a `next` operation: every vertex becomes a breakpoint.
    pub(crate) break_all: AtomicBool,
    /// Multiset of the source ranges of in-flight vertices.
    cursors: Mutex<Vec<SourceRange>>,
    /// Resume generation; bumping it wakes every parked vertex.
    resume_tx: watch::Sender<u64>,
}

impl Default for WalkShared {
    fn default() -> WalkShared {
        let (resume_tx, _) = watch::channel(0);
        WalkShared {
            break_all: AtomicBool::new(false),
            cursors: Mutex::new(Vec::new()),
            resume_tx,
        }
    }
}

impl WalkShared {
    pub(crate) fn cursors(&self) -> Vec<SourceRange> {
        self.cursors.lock().unwrap().clone()
    }

    /// Wake every parked vertex, and anything about to park against the
    /// current resume generation.
    pub(crate) fn wake_all(&self) {
        self.resume_tx.send_modify(|generation| *generation += 1);
    }

    /// Subscribe to the resume generation. Subscribing before reporting a
    /// pause guarantees a resume issued afterwards is never missed.
    fn subscribe_resume(&self) -> watch::Receiver<u64> {
        let mut rx = self.resume_tx.subscribe();
        rx.mark_unchanged();
        rx
    }

    fn add_cursors(&self, ranges: &[SourceRange]) {
        self.cursors.lock().unwrap().extend_from_slice(ranges);
    }

    fn remove_cursors(&self, ranges: &[SourceRange]) {
        let mut cursors = self.cursors.lock().unwrap();
        for range in ranges {
            if let Some(pos) = cursors.iter().position(|c| c == range) {
                cursors.swap_remove(pos);
            }
        }
    }
}

/// The walker: traversal machinery bound to a pair of handlers and a
/// breakpoint set.
pub struct Walker {
    on_vertex: VertexHandler,
    on_break: BreakHandler,
    breakpoints: Arc<BreakpointSet>,
    shared: Arc<WalkShared>,
}

impl std::fmt::Debug for Walker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker").finish()
    }
}

impl Walker {
    /// A walker invoking `on_vertex` per vertex and `on_break` on pauses.
    pub fn new(
        on_vertex: VertexHandler,
        on_break: BreakHandler,
        breakpoints: Arc<BreakpointSet>,
    ) -> Walker {
        Walker {
            on_vertex,
            on_break,
            breakpoints,
            shared: Arc::new(WalkShared::default()),
        }
    }

    pub(crate) fn shared(&self) -> Arc<WalkShared> {
        Arc::clone(&self.shared)
    }

    /// The breakpoint set this walker probes.
    pub fn breakpoints(&self) -> &Arc<BreakpointSet> {
        &self.breakpoints
    }

    /// Walk `definition` to completion. Returns the first vertex handler
    /// error, after its on-error break (if any) resumed.
    pub async fn walk(&self, definition: Arc<Definition>) -> Result<(), Error> {
        definition.validate()?;
        self.breakpoints.init_all();

        let mut done_rx: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        let mut done_tx: HashMap<String, watch::Sender<bool>> = HashMap::new();
        for digest in definition.ops.keys() {
            let (tx, rx) = watch::channel(false);
            done_tx.insert(digest.clone(), tx);
            done_rx.insert(digest.clone(), rx);
        }

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
        for (digest, op) in &definition.ops {
            let inputs: Vec<watch::Receiver<bool>> = op
                .inputs
                .iter()
                .map(|input| done_rx[input].clone())
                .collect();
            let completed = done_tx.remove(digest).expect("one sender per op");
            let vertex = VertexState {
                digest: digest.clone(),
                name: op.name.clone(),
                ranges: op.ranges.clone(),
            };
            tasks.spawn(self.handle_vertex(Arc::clone(&definition), vertex, inputs, completed));
        }

        let mut first_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A vertex failing makes its dependents report
                    // cancellation; the vertex error itself wins.
                    let supersedes = match &first_error {
                        None => true,
                        Some(Error::Cancelled { .. }) => !matches!(e, Error::Cancelled { .. }),
                        Some(_) => false,
                    };
                    if supersedes {
                        first_error = Some(e);
                    }
                    // Siblings and dependents stop with the walk.
                    tasks.abort_all();
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    first_error.get_or_insert_with(|| Error::invalid(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_vertex(
        &self,
        definition: Arc<Definition>,
        vertex: VertexState,
        inputs: Vec<watch::Receiver<bool>>,
        completed: watch::Sender<bool>,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send + 'static {
        let on_vertex = Arc::clone(&self.on_vertex);
        let on_break = Arc::clone(&self.on_break);
        let breakpoints = Arc::clone(&self.breakpoints);
        let shared = Arc::clone(&self.shared);

        async move {
            for mut input in inputs {
                input.wait_for(|done| *done).await.map_err(|_| {
                    Error::Cancelled {
                        cause: String::from("walk cancelled"),
                    }
                })?;
            }

            trace!("handling vertex {} ({})", vertex.digest, vertex.name);
            shared.add_cursors(&vertex.ranges);

            let err = on_vertex(vertex.clone()).await.err();

            let (mut hit, hits) = breakpoints.check(&vertex, err.as_ref()).await?;
            if shared.break_all.load(Ordering::SeqCst) {
                hit = true;
            }
            if hit {
                debug!("break at vertex {} ({})", vertex.digest, vertex.name);
                // Subscribe before the handler reports the pause, so a
                // resume issued in response cannot be missed.
                let mut resume = shared.subscribe_resume();
                on_break(BreakContext {
                    state: vertex.clone(),
                    cursors: shared.cursors(),
                    hits,
                    definition,
                    breakpoints: Arc::clone(&breakpoints),
                })
                .await;
                let _ = resume.changed().await;
            }

            shared.remove_cursors(&vertex.ranges);
            match err {
                Some(e) => Err(e),
                None => {
                    let _ = completed.send(true);
                    Ok(())
                }
            }
        }
    }
}
