//! Errors for the whole crate, collected into a single [`Error`] enum.

use std::path::PathBuf;

/// The set of errors surfaced by the orchestration core.
///
/// Validation, conflict and not-found failures are terminal and reported to
/// the user verbatim. Driver and build failures wrap their underlying cause,
/// reachable through [`std::error::Error::source`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error emitted when a name or option fails validation before any state
    /// is touched.
    #[error("invalid argument: {message}")]
    ValidationError {
        /// Human readable description of what failed to validate.
        message: String,
    },

    /// Error emitted when an operation conflicts with existing state, such as
    /// a duplicate node endpoint or a build already in flight.
    #[error("{message}")]
    ConflictError {
        /// Human readable description of the conflict.
        message: String,
    },

    /// Error emitted when a builder, node, process or result cannot be found.
    #[error("{kind} not found: {name}")]
    NotFoundError {
        /// The kind of entity that was looked up.
        kind: &'static str,
        /// The identifier that failed to resolve.
        name: String,
    },

    /// Error emitted when a driver fails to become ready within its
    /// bootstrap deadline.
    #[error("timed out waiting for {driver} to become ready after {seconds}s")]
    TimeoutError {
        /// The driver kind that timed out.
        driver: &'static str,
        /// The configured deadline, in seconds.
        seconds: u64,
        /// The last error observed while polling, if any.
        #[source]
        last: Option<Box<Error>>,
    },

    /// Opaque failure inside a specific driver, wrapped with the driver kind.
    #[error("driver {driver}: {source}")]
    DriverError {
        /// The driver kind that produced the failure.
        driver: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A build failed. The controller retains the result handle associated
    /// with `ref_id` so the failure can be inspected post-mortem.
    #[error("build failed (ref {ref_id}): {source}")]
    BuildError {
        /// The ref minted for the failing build.
        ref_id: String,
        /// The underlying solve failure.
        #[source]
        source: Box<Error>,
    },

    /// Error emitted when the solver rejects a capability required by the
    /// requested frontend options.
    #[error("frontend does not support {capability}: {hint}")]
    FrontendUnsupportedError {
        /// The capability the solver refused.
        capability: String,
        /// A user-readable hint on how to proceed.
        hint: String,
        /// The original negotiation failure.
        #[source]
        source: Box<Error>,
    },

    /// The operation was cancelled; `cause` distinguishes a user cancel from
    /// a deadline.
    #[error("cancelled: {cause}")]
    Cancelled {
        /// Why the operation was cancelled.
        cause: String,
    },

    /// Error emitted by the docker daemon API with a failing status code.
    #[error("daemon responded with status code {status_code}: {message}")]
    DaemonResponseError {
        /// Status code returned by the daemon API call.
        status_code: u16,
        /// Message body returned by the daemon API call.
        message: String,
    },

    /// Error emitted when a daemon request exceeds the client timeout.
    #[error("daemon request timed out")]
    RequestTimeoutError,

    /// Error emitted when the daemon reports an API version that does not
    /// parse.
    #[error("daemon reported an unparseable API version")]
    APIVersionParseError,

    /// Error emitted when the daemon API unexpectedly closes an attached
    /// stream.
    #[error("container exec stream was closed: exit code {code}, {message}")]
    ExecStreamError {
        /// Exit code of the remote process, when known.
        code: i64,
        /// Captured stderr/stdout tail for diagnostics.
        message: String,
    },

    /// Error emitted when a JSON payload cannot be deserialized.
    #[cfg(feature = "json_data_content")]
    #[error("failed to deserialize JSON: {message}: {contents}")]
    JsonDataError {
        /// Short section of the payload surrounding the parse failure.
        message: String,
        /// Full payload for context.
        contents: String,
    },

    /// Error emitted when a JSON payload cannot be deserialized.
    #[cfg(not(feature = "json_data_content"))]
    #[error("failed to deserialize JSON: {message}")]
    JsonDataError {
        /// Short section of the payload surrounding the parse failure.
        message: String,
    },

    /// A persisted record failed to decode.
    #[error("corrupt record at {}: {source}", path.display())]
    CorruptRecordError {
        /// Path of the record that failed to decode.
        path: PathBuf,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// Error emitted by the serde serialization layer.
    #[error(transparent)]
    JsonSerdeError {
        /// The original error emitted by serde.
        #[from]
        err: serde_json::Error,
    },

    /// Error emitted when a query string fails to encode.
    #[error(transparent)]
    UrlEncodedError {
        /// The original error emitted while url-encoding.
        #[from]
        err: serde_urlencoded::ser::Error,
    },

    /// Error emitted by the underlying I/O layer.
    #[error(transparent)]
    IOError {
        /// The original I/O error.
        #[from]
        err: std::io::Error,
    },

    /// Error emitted by the HTTP transport.
    #[error(transparent)]
    HyperResponseError {
        /// The original error emitted by hyper.
        #[from]
        err: hyper::Error,
    },

    /// Error emitted by the HTTP client connection pool.
    #[error(transparent)]
    HyperLegacyError {
        /// The original error emitted by the hyper-util legacy client.
        #[from]
        err: hyper_util::client::legacy::Error,
    },

    /// Error emitted while building an HTTP request.
    #[error(transparent)]
    HttpClientError {
        /// The original error emitted by the http crate.
        #[from]
        err: http::Error,
    },

    /// Error emitted when an endpoint string does not parse as a URL.
    #[error("unable to parse endpoint {endpoint}: {err}")]
    UrlParseError {
        /// The endpoint that failed to parse.
        endpoint: String,
        /// The original parse error.
        #[source]
        err: url::ParseError,
    },

    /// Error emitted when an endpoint's URL scheme is not supported by the
    /// selected driver.
    #[error("unsupported endpoint scheme '{scheme}'")]
    UnsupportedSchemeError {
        /// The scheme that was rejected.
        scheme: String,
    },

    /// Error emitted while configuring TLS for a remote endpoint.
    #[error(transparent)]
    TlsError {
        /// The original error emitted by rustls.
        #[from]
        err: rustls::Error,
    },

    /// Error emitted when a gRPC channel to the solver cannot be established.
    #[error("solver channel failure: {err}")]
    TonicError {
        /// The original error emitted by tonic.
        #[from]
        err: tonic::transport::Error,
    },

    /// Error emitted by the kubernetes API client.
    #[cfg(feature = "kubernetes")]
    #[error(transparent)]
    KubeError {
        /// The original error emitted by kube.
        #[from]
        err: kube::Error,
    },

    /// Error emitted when a UTF-8 payload fails to decode.
    #[error(transparent)]
    StrParseError {
        /// The original error emitted while decoding.
        #[from]
        err: std::str::Utf8Error,
    },
}

impl Error {
    /// Shorthand used at every store boundary for a failed name validation.
    pub(crate) fn invalid<M: Into<String>>(message: M) -> Error {
        Error::ValidationError {
            message: message.into(),
        }
    }

    /// Shorthand for a conflicting operation.
    pub(crate) fn conflict<M: Into<String>>(message: M) -> Error {
        Error::ConflictError {
            message: message.into(),
        }
    }

    /// Shorthand for a missing entity.
    pub(crate) fn not_found<N: Into<String>>(kind: &'static str, name: N) -> Error {
        Error::NotFoundError {
            kind,
            name: name.into(),
        }
    }

    /// True when the error is the not-found sentinel, regardless of entity
    /// kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFoundError { .. })
    }

    /// Wrap this error with the driver kind that produced it.
    pub(crate) fn for_driver(self, driver: &'static str) -> Error {
        Error::DriverError {
            driver,
            source: Box::new(self),
        }
    }
}
