//! The build controller: serializes builds, retains the last result handle
//! across success and failure, and fronts the process manager for
//! interactive work against that result.

pub mod process;
pub mod result;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::build::BuildOptions;
use crate::errors::Error;
use crate::solver::{ContextReader, SolveStatus, Solver};
use process::ProcessManager;
use result::{InvokeConfig, ResultHandle};

/// Source mapping of one Dockerfile that fed the build, used by interactive
/// debugging to resolve breakpoint locations.
#[derive(Debug, Clone)]
pub struct DockerfileMapping {
    /// Dockerfile path as referenced by the build.
    pub name: String,
    /// Raw Dockerfile content.
    pub content: Vec<u8>,
}

/// The controller's view of a finished build.
#[derive(Debug, Clone, Default)]
pub struct BuildResponse {
    /// The ref minted for the build.
    pub ref_id: String,
    /// Exporter metadata returned by the solver.
    pub exporter_response: std::collections::HashMap<String, String>,
}

/// Serializes builds and retains the last result for post-mortem work.
///
/// One controller exists per interactive session. At most one build runs at
/// a time; a second concurrent call fails immediately rather than queueing.
pub struct BuildController {
    solver: Arc<dyn Solver>,
    building: AtomicBool,
    result: Mutex<Option<Arc<ResultHandle>>>,
    last_options: Mutex<Option<BuildOptions>>,
    manager: ProcessManager,
}

impl std::fmt::Debug for BuildController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildController")
            .field("building", &self.building.load(Ordering::Relaxed))
            .finish()
    }
}

struct BuildGate<'a>(&'a AtomicBool);

impl Drop for BuildGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BuildController {
    /// A controller driving builds through `solver`.
    pub fn new(solver: Arc<dyn Solver>) -> BuildController {
        BuildController {
            solver,
            building: AtomicBool::new(false),
            result: Mutex::new(None),
            last_options: Mutex::new(None),
            manager: ProcessManager::new(),
        }
    }

    /// Run one build, streaming [`SolveStatus`] records into `statuses`.
    /// `stdin` feeds the solver when the build context is `-`.
    ///
    /// On completion the solver may return a result handle even when the
    /// build failed; the controller stores it, releasing the previous one,
    /// so that [`invoke`](Self::invoke) can debug the failure. Dockerfile
    /// mappings for local contexts are returned alongside the response.
    pub async fn build(
        &self,
        mut options: BuildOptions,
        stdin: Option<ContextReader>,
        statuses: mpsc::Sender<SolveStatus>,
    ) -> Result<(BuildResponse, Vec<DockerfileMapping>), Error> {
        if self.building.swap(true, Ordering::AcqRel) {
            return Err(Error::conflict("build ongoing"));
        }
        let _gate = BuildGate(&self.building);

        let request = options.to_solve_request()?;
        let ref_id = request.ref_id.clone();
        let mappings = read_dockerfile_mappings(&options).await;
        *self.last_options.lock().unwrap() = Some(options);

        debug!("starting build {ref_id}");
        let outcome = self.solver.solve(request, stdin, statuses).await;

        if let Some(handle) = outcome.handle {
            let previous = self
                .result
                .lock()
                .unwrap()
                .replace(Arc::new(handle));
            if let Some(previous) = previous {
                // The replaced result is released in the background; its
                // processes were tied to the old container anyway.
                self.manager.cancel_running_processes();
                tokio::spawn(async move { previous.close().await });
            }
        }

        match outcome.result {
            Ok(response) => Ok((
                BuildResponse {
                    ref_id,
                    exporter_response: response.exporter_response,
                },
                mappings,
            )),
            Err(err) => Err(wrap_build_error(ref_id, err)),
        }
    }

    /// Attach to the process `pid`, starting it first when it does not
    /// exist yet, and forward the given I/O until the process exits or the
    /// attach is replaced.
    pub async fn invoke(
        &self,
        pid: &str,
        cfg: InvokeConfig,
        stdin: Pin<Box<dyn AsyncRead + Send>>,
        stdout: Pin<Box<dyn AsyncWrite + Send>>,
        stderr: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Result<(), Error> {
        let process = match self.manager.get(pid) {
            Some(process) if !cfg.rollback => process,
            _ => {
                let handle = self
                    .result
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or_else(|| Error::not_found("result", pid))?;
                self.manager.delete_and_cancel(pid);
                self.manager.start_process(pid, &handle, &cfg).await?
            }
        };

        let (detach_tx, detach_rx) = oneshot::channel::<Error>();
        let detach_tx = Mutex::new(Some(detach_tx));
        process
            .forwarder()
            .set_in(
                stdin,
                stdout,
                stderr,
                Box::new(move |cause| {
                    if let Some(tx) = detach_tx.lock().unwrap().take() {
                        let _ = tx.send(cause);
                    }
                }),
            )
            .await;

        let mut done = process.done();
        tokio::select! {
            exit = done.wait_for(|exit| exit.is_some()) => {
                let exit = match exit {
                    Ok(guard) => guard.clone(),
                    Err(_) => None,
                };
                match exit {
                    Some(Ok(0)) | None => Ok(()),
                    Some(Ok(code)) => Err(Error::ExecStreamError {
                        code,
                        message: format!("process {pid} exited with {code}"),
                    }),
                    Some(Err(e)) => Err(Error::Cancelled {
                        cause: e.to_string(),
                    }),
                }
            }
            cause = detach_rx => {
                match cause {
                    Ok(cause) => {
                        warn!("detached from process {pid}: {cause}");
                        Ok(())
                    }
                    Err(_) => Ok(()),
                }
            }
        }
    }

    /// The running processes, sorted by pid.
    pub fn list_processes(&self) -> Vec<Arc<process::Process>> {
        self.manager.list()
    }

    /// Cancel and remove one process.
    pub fn disconnect_process(&self, pid: &str) -> Result<(), Error> {
        self.manager
            .delete_and_cancel(pid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("process", pid))
    }

    /// Cancel every running process.
    pub fn cancel_all(&self) {
        self.manager.cancel_running_processes();
    }

    /// The options of the last build started through this controller.
    pub fn inspect(&self) -> Option<BuildOptions> {
        self.last_options.lock().unwrap().clone()
    }

    /// The result handle of the last build, when one is retained.
    pub fn result_handle(&self) -> Option<Arc<ResultHandle>> {
        self.result.lock().unwrap().as_ref().map(Arc::clone)
    }

    /// Tear down outstanding processes and release the retained result.
    pub async fn close(&self) {
        self.manager.cancel_running_processes();
        let handle = self.result.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }
}

/// Wrap a solve failure with the build ref so callers can recover the
/// retained handle, upgrading solver capability complaints to the frontend
/// error kind first.
fn wrap_build_error(ref_id: String, err: Error) -> Error {
    let err = match frontend_capability(&err) {
        Some(capability) => Error::FrontendUnsupportedError {
            capability,
            hint: String::from(
                "consider updating the solver daemon on the selected builder",
            ),
            source: Box::new(err),
        },
        None => err,
    };
    Error::BuildError {
        ref_id,
        source: Box::new(err),
    }
}

/// Detect a capability negotiation failure in a solve error's text. The
/// solver reports these as unimplemented frontend methods.
fn frontend_capability(err: &Error) -> Option<String> {
    let text = err.to_string();
    let marker = "unsupported frontend capability ";
    if let Some(idx) = text.find(marker) {
        let capability = text[idx + marker.len()..]
            .split_whitespace()
            .next()
            .unwrap_or_default();
        return Some(capability.to_string());
    }
    if text.contains("moby.buildkit.v1.frontend") && text.contains("Unimplemented") {
        return Some(String::from("frontend gateway"));
    }
    None
}

async fn read_dockerfile_mappings(options: &BuildOptions) -> Vec<DockerfileMapping> {
    if options.context_path == "-" || crate::build::is_remote_input(&options.context_path) {
        return Vec::new();
    }
    let name = options
        .dockerfile_name
        .clone()
        .unwrap_or_else(|| String::from("Dockerfile"));
    let path = if std::path::Path::new(&name).is_absolute() {
        std::path::PathBuf::from(&name)
    } else {
        std::path::Path::new(&options.context_path).join(&name)
    };
    match tokio::fs::read(&path).await {
        Ok(content) => vec![DockerfileMapping { name, content }],
        Err(e) => {
            debug!("no dockerfile mapping for {}: {e}", path.display());
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_capability_is_detected() {
        let err = Error::invalid("unsupported frontend capability moby.buildkit.frontend.contexts");
        assert_eq!(
            frontend_capability(&err).as_deref(),
            Some("moby.buildkit.frontend.contexts")
        );
        assert!(frontend_capability(&Error::invalid("plain failure")).is_none());
    }
}
