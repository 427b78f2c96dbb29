//! Named processes executed against a build result, with switchable I/O
//! forwarding between each child and whatever is currently attached to it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::result::{Container, InvokeConfig, ProcessStdio, ResultHandle};
use crate::errors::Error;

const PIPE_BUF_SIZE: usize = 32 * 1024;

type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;
type CancelCallback = Box<dyn FnOnce(Error) + Send>;

type SharedSink = Arc<tokio::sync::Mutex<Option<BoxedWrite>>>;

/// Routes a child's stdin/stdout/stderr to and from an attach that can be
/// replaced while the child keeps running.
///
/// The child side of the pipes is fixed for the child's lifetime; only the
/// attach side swaps.
pub struct IoForwarder {
    stdin_sink: SharedSink,
    stdout_sink: SharedSink,
    stderr_sink: SharedSink,
    stdin_pump: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancelCallback>>,
}

impl std::fmt::Debug for IoForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoForwarder").finish()
    }
}

impl IoForwarder {
    /// Build a forwarder and the [`ProcessStdio`] for the container side.
    pub(crate) fn new() -> (Arc<IoForwarder>, ProcessStdio) {
        let (stdin_w, stdin_r) = duplex(PIPE_BUF_SIZE);
        let (stdout_w, stdout_r) = duplex(PIPE_BUF_SIZE);
        let (stderr_w, stderr_r) = duplex(PIPE_BUF_SIZE);

        let forwarder = Arc::new(IoForwarder {
            stdin_sink: Arc::new(tokio::sync::Mutex::new({
                let w: BoxedWrite = Box::pin(stdin_w);
                Some(w)
            })),
            stdout_sink: Arc::new(tokio::sync::Mutex::new(None)),
            stderr_sink: Arc::new(tokio::sync::Mutex::new(None)),
            stdin_pump: Mutex::new(None),
            cancel: Mutex::new(None),
        });

        // Output pumps live for the whole child lifetime; they stop at EOF
        // when the container drops its ProcessStdio.
        let stdout_r: BoxedRead = Box::pin(stdout_r);
        tokio::spawn(pump(stdout_r, Arc::clone(&forwarder.stdout_sink)));
        let stderr_r: BoxedRead = Box::pin(stderr_r);
        tokio::spawn(pump(stderr_r, Arc::clone(&forwarder.stderr_sink)));

        let io = ProcessStdio {
            stdin: Box::pin(stdin_r),
            stdout: Box::pin(stdout_w),
            stderr: Box::pin(stderr_w),
        };

        (forwarder, io)
    }

    /// Replace the attach. The previous attach's cancel callback fires
    /// exactly once with a cancellation error, atomically with the swap.
    pub async fn set_in(
        &self,
        attach_stdin: BoxedRead,
        attach_stdout: BoxedWrite,
        attach_stderr: BoxedWrite,
        cancel: CancelCallback,
    ) {
        let previous = {
            let mut slot = self.cancel.lock().unwrap();
            slot.replace(cancel)
        };
        if let Some(previous) = previous {
            previous(Error::Cancelled {
                cause: String::from("io attach replaced"),
            });
        }

        if let Some(previous_pump) = self.stdin_pump.lock().unwrap().take() {
            previous_pump.abort();
        }
        let pump_task = tokio::spawn(pump(attach_stdin, Arc::clone(&self.stdin_sink)));
        *self.stdin_pump.lock().unwrap() = Some(pump_task);

        *self.stdout_sink.lock().await = Some(attach_stdout);
        *self.stderr_sink.lock().await = Some(attach_stderr);
    }

    /// Detach the current attach and fire its cancel callback with `cause`.
    pub fn close(&self, cause: Error) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel(cause);
        }
        if let Some(pump_task) = self.stdin_pump.lock().unwrap().take() {
            pump_task.abort();
        }
    }
}

async fn pump(mut src: BoxedRead, dst: SharedSink) {
    let mut buf = vec![0u8; 4096];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut guard = dst.lock().await;
                if let Some(sink) = guard.as_mut() {
                    if sink.write_all(&buf[..n]).await.is_err() || sink.flush().await.is_err() {
                        // A broken attach is dropped; the child keeps
                        // running detached.
                        *guard = None;
                    }
                }
            }
        }
    }
}

/// Terminal state of a process: its exit code, or the failure.
pub type ProcessExit = Result<i64, Arc<Error>>;

/// A named child process running against a result handle.
pub struct Process {
    pid: String,
    invoke_config: InvokeConfig,
    forwarder: Arc<IoForwarder>,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    done_rx: watch::Receiver<Option<ProcessExit>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

impl Process {
    /// The caller-chosen process id.
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// The configuration the process was started with.
    pub fn invoke_config(&self) -> &InvokeConfig {
        &self.invoke_config
    }

    /// The I/O forwarder owning this process's attach.
    pub fn forwarder(&self) -> &Arc<IoForwarder> {
        &self.forwarder
    }

    /// A receiver resolving to the terminal state once the process exits.
    pub fn done(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.done_rx.clone()
    }

    /// Cancel the process exactly once: closes the forwarder and the child
    /// context.
    pub fn cancel(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        if let Some(cancel) = cancel {
            self.forwarder.close(Error::Cancelled {
                cause: String::from("process cancelled"),
            });
            cancel();
        }
    }
}

/// The set of processes running against the current result handle.
#[derive(Debug, Default)]
pub struct ProcessManager {
    processes: Arc<Mutex<HashMap<String, Arc<Process>>>>,
}

impl ProcessManager {
    /// An empty manager.
    pub fn new() -> ProcessManager {
        ProcessManager::default()
    }

    /// Look up a process by pid.
    pub fn get(&self, pid: &str) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().get(pid).map(Arc::clone)
    }

    /// Snapshot of the running processes, sorted by pid.
    pub fn list(&self) -> Vec<Arc<Process>> {
        let mut processes: Vec<Arc<Process>> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .map(Arc::clone)
            .collect();
        processes.sort_by(|a, b| a.pid.cmp(&b.pid));
        processes
    }

    /// Remove a process from the map without cancelling it.
    pub fn delete(&self, pid: &str) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().remove(pid)
    }

    /// Remove `pid` from the map and cancel it.
    pub fn delete_and_cancel(&self, pid: &str) -> Option<Arc<Process>> {
        let process = self.delete(pid);
        if let Some(process) = &process {
            process.cancel();
        }
        process
    }

    /// Atomically drain the map and cancel everything that was running.
    pub fn cancel_running_processes(&self) {
        let drained: Vec<Arc<Process>> = {
            let mut processes = self.processes.lock().unwrap();
            processes.drain().map(|(_, p)| p).collect()
        };
        for process in drained {
            debug!("cancelling process {}", process.pid());
            process.cancel();
        }
    }

    /// Start a new process under `pid` against `handle`.
    ///
    /// A rollback request, a missing container, or an unavailable container
    /// makes the handle materialize a fresh container first, after running
    /// processes are cancelled.
    pub async fn start_process(
        &self,
        pid: &str,
        handle: &Arc<ResultHandle>,
        cfg: &InvokeConfig,
    ) -> Result<Arc<Process>, Error> {
        cfg.validate()?;

        let container: Arc<dyn Container> = match handle.current_container() {
            Some(container) if !cfg.rollback => container,
            _ => {
                self.cancel_running_processes();
                handle.renew_container().await?
            }
        };

        let (forwarder, io) = IoForwarder::new();
        let (done_tx, done_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let process = Arc::new(Process {
            pid: pid.to_string(),
            invoke_config: cfg.clone(),
            forwarder: Arc::clone(&forwarder),
            cancel: Mutex::new(Some(Box::new(move || {
                let _ = cancel_tx.send(());
            }))),
            done_rx,
        });

        self.processes
            .lock()
            .unwrap()
            .insert(pid.to_string(), Arc::clone(&process));

        let cfg = cfg.clone();
        let pid = pid.to_string();
        let processes = Arc::clone(&self.processes);
        tokio::spawn({
            let process = Arc::clone(&process);
            async move {
                let exit: ProcessExit = tokio::select! {
                    res = container.start_process(&cfg, io) => match res {
                        Ok(code) => Ok(code),
                        Err(e) => Err(Arc::new(e)),
                    },
                    _ = cancel_rx => Err(Arc::new(Error::Cancelled {
                        cause: String::from("process cancelled"),
                    })),
                };
                // Remove before publishing so Done() observers never see a
                // finished process still listed.
                processes.lock().unwrap().remove(&pid);
                process.forwarder.close(Error::Cancelled {
                    cause: String::from("process exited"),
                });
                match &exit {
                    Ok(code) => debug!("process {pid} exited with code {code}"),
                    Err(e) => warn!("process {pid} finished: {e}"),
                }
                let _ = done_tx.send(Some(exit));
            }
        });

        Ok(process)
    }
}
