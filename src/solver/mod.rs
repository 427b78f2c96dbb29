//! The contract with the external build solver.
//!
//! The solver is opaque to this crate: the wire messages belong to it. The
//! core only needs to hand a [`SolveRequest`] to an implementation of
//! [`Solver`], stream back [`SolveStatus`] records, and keep the returned
//! result handle alive for post-mortem work. [`SolverChannel`] covers the
//! transport half of the contract by laying a gRPC channel over whatever
//! byte stream a driver dials.

pub(crate) mod transport;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_core::Future;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tower_service::Service;

use crate::controller::result::ResultHandle;
use crate::driver::Driver;
use crate::errors::Error;

pub use transport::DialStream;

const DUPLEX_BUF_SIZE: usize = 8 * 1024;

/// One vertex of the build graph as reported by the solver.
#[derive(Debug, Clone, Default)]
pub struct Vertex {
    /// Content digest identifying the vertex.
    pub digest: String,
    /// Digests of the vertex inputs.
    pub inputs: Vec<String>,
    /// Human readable operation name.
    pub name: String,
    /// Set when the vertex started executing.
    pub started: Option<DateTime<Utc>>,
    /// Set when the vertex finished.
    pub completed: Option<DateTime<Utc>>,
    /// Whether the result was served from cache.
    pub cached: bool,
    /// Error text when the vertex failed.
    pub error: String,
}

/// Progress of one concrete activity below a vertex, such as a layer pull.
#[derive(Debug, Clone, Default)]
pub struct VertexStatus {
    /// Status identifier.
    pub id: String,
    /// The vertex this status belongs to.
    pub vertex: String,
    /// Status name, such as `transferring`.
    pub name: String,
    /// Current progress count.
    pub current: i64,
    /// Total expected count, when known.
    pub total: i64,
    /// When this activity was last updated.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A chunk of log output attached to a vertex.
#[derive(Debug, Clone, Default)]
pub struct VertexLog {
    /// The vertex this log belongs to.
    pub vertex: String,
    /// Output stream: 1 stdout, 2 stderr.
    pub stream: i64,
    /// Raw log bytes.
    pub data: Vec<u8>,
    /// When the chunk was produced.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A build warning attached to a vertex.
#[derive(Debug, Clone, Default)]
pub struct VertexWarning {
    /// The vertex this warning belongs to.
    pub vertex: String,
    /// Severity level; lower is more severe.
    pub level: i64,
    /// Short warning text.
    pub short: Vec<u8>,
    /// Detailed warning text.
    pub detail: Vec<Vec<u8>>,
}

/// One status message of a running solve.
#[derive(Debug, Clone, Default)]
pub struct SolveStatus {
    /// Vertex state transitions.
    pub vertexes: Vec<Vertex>,
    /// Concrete activity progress.
    pub statuses: Vec<VertexStatus>,
    /// Log output.
    pub logs: Vec<VertexLog>,
    /// Warnings.
    pub warnings: Vec<VertexWarning>,
}

/// The request handed to the solver for one build.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    /// The ref minted for this build.
    pub ref_id: String,
    /// Frontend to solve with, such as `dockerfile.v0`.
    pub frontend: String,
    /// Frontend attributes: target, build args, labels, contexts.
    pub frontend_attrs: HashMap<String, String>,
    /// Requested target platforms, normalized and formatted.
    pub platforms: Vec<String>,
    /// Exporter kind, such as `oci`, `docker` or `image`.
    pub exporter: Option<String>,
    /// Exporter attributes.
    pub exporter_attrs: HashMap<String, String>,
    /// Cache export destinations.
    pub cache_to: Vec<String>,
    /// Cache import sources.
    pub cache_from: Vec<String>,
    /// Whether to keep the solve result open for post-mortem processes.
    pub evaluate: bool,
}

/// The solver's response to a finished build.
#[derive(Debug, Clone, Default)]
pub struct SolveResponse {
    /// Exporter metadata, such as the image digest.
    pub exporter_response: HashMap<String, String>,
}

/// The terminal outcome of one solve: an optional result handle that
/// survives failure, plus the response or the error.
#[derive(Debug)]
pub struct SolveOutcome {
    /// Present when the solver kept the (possibly failed) result open.
    pub handle: Option<ResultHandle>,
    /// The solve response or the failure.
    pub result: Result<SolveResponse, Error>,
}

/// Byte stream feeding a build whose context or Dockerfile arrives on
/// stdin.
pub type ContextReader = Pin<Box<dyn AsyncRead + Send>>;

/// The external build-execution engine, seen from the core.
///
/// Implementations translate [`SolveRequest`] into their own wire protocol.
/// `stdin` is present when the build context is `-`. Status records are
/// pushed into `statuses` as they arrive; the channel is dropped when the
/// solve finishes. On failure an implementation should still surface a
/// result handle when it has one, so the controller can offer post-mortem
/// debugging.
#[async_trait::async_trait]
pub trait Solver: Send + Sync {
    /// Run one build to completion.
    async fn solve(
        &self,
        request: SolveRequest,
        stdin: Option<ContextReader>,
        statuses: mpsc::Sender<SolveStatus>,
    ) -> SolveOutcome;
}

/// Connector service layering a tonic channel over a driver's dial.
pub struct DialConnector {
    driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for DialConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialConnector")
            .field("driver", &self.driver.kind())
            .finish()
    }
}

impl Service<tonic::transport::Uri> for DialConnector {
    type Response = DialStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: tonic::transport::Uri) -> Self::Future {
        let driver = Arc::clone(&self.driver);
        Box::pin(async move { driver.dial().await })
    }
}

/// A gRPC channel to a solver, produced by [`SolverChannel::connect`].
///
/// The channel is protocol-agnostic: callers generated against the solver's
/// own protobuf definitions wrap it with their service clients.
#[derive(Debug, Clone)]
pub struct SolverChannel {
    channel: Channel,
}

impl SolverChannel {
    /// Establish a channel by dialing through `driver`. Connections are
    /// lazy per request; the endpoint authority is a placeholder since all
    /// traffic flows over the dialed stream.
    pub async fn connect(driver: Arc<dyn Driver>) -> Result<SolverChannel, Error> {
        let channel = Endpoint::try_from("http://[::]:50051")?
            .buffer_size(DUPLEX_BUF_SIZE)
            .connect_with_connector(DialConnector { driver })
            .await?;
        Ok(SolverChannel { channel })
    }

    /// The underlying tonic channel.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}
