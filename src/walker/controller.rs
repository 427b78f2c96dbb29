//! Controller for a running walk: start, resume, step, cancel, inspect.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::Error;

use super::breakpoint::BreakpointSet;
use super::{BreakHandler, Definition, SourceRange, VertexHandler, WalkShared, Walker};

/// Terminal state of a walk, cheap to clone into observers.
pub type WalkOutcome = Result<(), Arc<Error>>;

struct RunningWalk {
    task: JoinHandle<()>,
    definition: Arc<Definition>,
}

/// Drives one walker, exposing the `continue`/`next`/`cancel` surface the
/// debug monitor needs. At most one walk runs at a time.
pub struct WalkerController {
    walker: Arc<Walker>,
    shared: Arc<WalkShared>,
    running: Mutex<Option<RunningWalk>>,
    outcome_tx: watch::Sender<Option<WalkOutcome>>,
    outcome_rx: watch::Receiver<Option<WalkOutcome>>,
}

impl std::fmt::Debug for WalkerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkerController")
            .field("running", &self.is_running())
            .finish()
    }
}

impl WalkerController {
    /// A controller around a fresh walker.
    pub fn new(
        on_vertex: VertexHandler,
        on_break: BreakHandler,
        breakpoints: Arc<BreakpointSet>,
    ) -> WalkerController {
        let walker = Arc::new(Walker::new(on_vertex, on_break, breakpoints));
        let shared = walker.shared();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        WalkerController {
            walker,
            shared,
            running: Mutex::new(None),
            outcome_tx,
            outcome_rx,
        }
    }

    /// The breakpoint set probed by the walker.
    pub fn breakpoints(&self) -> &Arc<BreakpointSet> {
        self.walker.breakpoints()
    }

    /// Whether a walk is currently running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|walk| !walk.task.is_finished())
            .unwrap_or(false)
    }

    /// Start walking `definition` in the background. Errors when another
    /// walk is still running.
    pub fn start_walk(&self, definition: Arc<Definition>) -> Result<(), Error> {
        let mut running = self.running.lock().unwrap();
        if running.as_ref().map(|w| !w.task.is_finished()).unwrap_or(false) {
            return Err(Error::conflict("walk ongoing"));
        }

        self.outcome_tx.send_replace(None);
        self.shared.break_all.store(false, Ordering::SeqCst);

        let walker = Arc::clone(&self.walker);
        let outcome_tx = self.outcome_tx.clone();
        let walked = Arc::clone(&definition);
        let task = tokio::spawn(async move {
            let result = walker.walk(walked).await;
            if let Err(e) = &result {
                debug!("walk finished with error: {e}");
            }
            outcome_tx.send_replace(Some(result.map_err(Arc::new)));
        });

        *running = Some(RunningWalk { task, definition });
        Ok(())
    }

    /// Resume a paused walk, clearing any pending single-step.
    pub fn continue_walk(&self) {
        self.shared.break_all.store(false, Ordering::SeqCst);
        self.shared.wake_all();
    }

    /// Resume a paused walk and pause again at the next vertex. Errors when
    /// no walk is running.
    pub fn next(&self) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::conflict("no walk is running"));
        }
        self.shared.break_all.store(true, Ordering::SeqCst);
        self.shared.wake_all();
        Ok(())
    }

    /// Cancel the walk and wait for it to drain.
    pub async fn walk_cancel(&self) -> Result<(), Error> {
        let walk = self.running.lock().unwrap().take();
        let Some(walk) = walk else {
            return Ok(());
        };
        walk.task.abort();
        // Unpark anything stuck in a break so the abort can land.
        self.shared.wake_all();
        let _ = walk.task.await;
        self.outcome_tx.send_replace(Some(Err(Arc::new(Error::Cancelled {
            cause: String::from("walk cancelled"),
        }))));
        Ok(())
    }

    /// Wait until the current walk finishes, returning its outcome.
    pub async fn wait(&self) -> WalkOutcome {
        let mut rx = self.outcome_rx.clone();
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map(|guard| guard.clone())
            .unwrap_or(Some(Err(Arc::new(Error::Cancelled {
                cause: String::from("walker controller dropped"),
            }))));
        outcome.unwrap_or(Ok(()))
    }

    /// The walked definition and the source ranges of in-flight vertices.
    pub fn inspect(&self) -> (Option<Arc<Definition>>, Vec<SourceRange>) {
        let definition = self
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| Arc::clone(&w.definition));
        (definition, self.shared.cursors())
    }
}
