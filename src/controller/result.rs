//! The result handle: an opaque reference to the last finished build,
//! alive even when the build failed, so processes can still be launched
//! against its last known state.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::Error;

/// Configuration of a process launched into a build result.
#[derive(Debug, Clone, Default)]
pub struct InvokeConfig {
    /// Entrypoint override; empty keeps the image entrypoint.
    pub entrypoint: Vec<String>,
    /// Command override; empty keeps the image command.
    pub cmd: Vec<String>,
    /// Extra environment entries, `KEY=value`.
    pub env: Vec<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Allocate a pseudo terminal.
    pub tty: bool,
    /// Discard the current container and start from the last solve state
    /// again.
    pub rollback: bool,
}

impl InvokeConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.entrypoint.is_empty() && self.cmd.is_empty() {
            return Err(Error::invalid(
                "process execution requires entrypoint or cmd",
            ));
        }
        Ok(())
    }
}

/// I/O endpoints handed to a container when starting a process. The reads
/// feed the process stdin; its output is written to the two writers.
#[allow(missing_debug_implementations)]
pub struct ProcessStdio {
    /// Stream feeding the process stdin.
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    /// Sink receiving the process stdout.
    pub stdout: Pin<Box<dyn AsyncWrite + Send>>,
    /// Sink receiving the process stderr.
    pub stderr: Pin<Box<dyn AsyncWrite + Send>>,
}

/// A container materialized from a build result, able to host processes.
///
/// Implementations belong to the solver integration; the core only drives
/// the lifecycle.
#[async_trait::async_trait]
pub trait Container: Send + Sync {
    /// Whether the container can still host processes.
    fn available(&self) -> bool;

    /// Run a process to completion inside the container, returning its exit
    /// code.
    async fn start_process(&self, cfg: &InvokeConfig, io: ProcessStdio) -> Result<i64, Error>;

    /// Tear the container down. Idempotent.
    async fn shutdown(&self);
}

/// Materializes containers out of a solve result; implemented by the solver
/// integration and handed to the core inside a [`ResultHandle`].
#[async_trait::async_trait]
pub trait ContainerSource: Send + Sync {
    /// Create a fresh container from the result's last solved state.
    async fn create_container(&self) -> Result<Arc<dyn Container>, Error>;
}

/// Opaque handle to the last build result.
///
/// At most one container backs the handle at any moment; rollback swaps the
/// slot, shutting the previous container down.
pub struct ResultHandle {
    ref_id: String,
    source: Arc<dyn ContainerSource>,
    container: Mutex<Option<Arc<dyn Container>>>,
}

impl std::fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("ref_id", &self.ref_id)
            .finish()
    }
}

impl ResultHandle {
    /// Wrap the solver's result reference.
    pub fn new(ref_id: String, source: Arc<dyn ContainerSource>) -> ResultHandle {
        ResultHandle {
            ref_id,
            source,
            container: Mutex::new(None),
        }
    }

    /// The build ref this handle belongs to.
    pub fn ref_id(&self) -> &str {
        &self.ref_id
    }

    /// The currently backing container, when one exists and is usable.
    pub fn current_container(&self) -> Option<Arc<dyn Container>> {
        self.container
            .lock()
            .unwrap()
            .as_ref()
            .filter(|c| c.available())
            .map(Arc::clone)
    }

    /// Create a fresh container and swap it into the slot, shutting down
    /// the previous one.
    pub async fn renew_container(&self) -> Result<Arc<dyn Container>, Error> {
        let fresh = self.source.create_container().await?;
        let previous = self
            .container
            .lock()
            .unwrap()
            .replace(Arc::clone(&fresh));
        if let Some(previous) = previous {
            debug!("shutting down replaced container for ref {}", self.ref_id);
            previous.shutdown().await;
        }
        Ok(fresh)
    }

    /// Release the handle's container, if any.
    pub async fn close(&self) {
        let previous = self.container.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }
}
