//! A slim asynchronous client for the Docker Engine API.
//!
//! This is not a general purpose daemon client: it covers exactly the
//! endpoints the local drivers need to bring a solver node online (image
//! pull, container lifecycle, and attached exec streams) over a unix
//! socket or TCP.

pub mod models;
pub(crate) mod read;
pub(crate) mod uri;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{StreamExt, TryFutureExt, TryStreamExt};
use http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use http::request::Builder;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_derive::Serialize as SerializeDerive;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::errors::Error;
use models::*;
use read::JsonLineDecoder;

/// The default unix socket the daemon listens on.
#[cfg(unix)]
pub const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

/// The default TCP address used when `DOCKER_HOST` points at a TCP daemon
/// without an address.
pub const DEFAULT_DOCKER_HOST: &str = "tcp://localhost:2375";

/// Default timeout for all requests: 2 minutes.
const DEFAULT_TIMEOUT: u64 = 120;

/// Default client version to communicate with the server.
pub const API_DEFAULT_VERSION: &ClientVersion = &ClientVersion {
    major_version: 1,
    minor_version: 47,
};

pub(crate) type BodyType = Full<Bytes>;

/// The version of the API the client talks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion {
    /// Major API version.
    pub major_version: usize,
    /// Minor API version.
    pub minor_version: usize,
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major_version, self.minor_version)
    }
}

impl From<&Arc<(AtomicUsize, AtomicUsize)>> for ClientVersion {
    fn from(tpl: &Arc<(AtomicUsize, AtomicUsize)>) -> ClientVersion {
        ClientVersion {
            major_version: tpl.0.load(Ordering::Relaxed),
            minor_version: tpl.1.load(Ordering::Relaxed),
        }
    }
}

/// How the client reaches the daemon.
#[derive(Debug, Copy, Clone)]
pub(crate) enum ClientType {
    #[cfg(unix)]
    Unix,
    Http,
}

#[derive(Debug)]
enum Transport {
    Http {
        client: Client<HttpConnector, BodyType>,
    },
    #[cfg(unix)]
    Unix {
        client: Client<hyperlocal::UnixConnector, BodyType>,
    },
}

/// The daemon API client.
///
/// Cloning is cheap and shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct Moby {
    transport: Arc<Transport>,
    client_type: ClientType,
    client_addr: String,
    client_timeout: u64,
    version: Arc<(AtomicUsize, AtomicUsize)>,
}

impl Moby {
    /// Connect using defaults common to the standard daemon configuration:
    /// `DOCKER_HOST` when set, otherwise the standard unix socket location.
    pub fn connect_with_defaults() -> Result<Moby, Error> {
        match std::env::var("DOCKER_HOST") {
            Ok(host) => Moby::connect_with_endpoint(&host),
            #[cfg(unix)]
            Err(_) => Moby::connect_with_unix(DEFAULT_SOCKET, DEFAULT_TIMEOUT, API_DEFAULT_VERSION),
            #[cfg(not(unix))]
            Err(_) => Moby::connect_with_endpoint(DEFAULT_DOCKER_HOST),
        }
    }

    /// Connect to an endpoint string, dispatching on its scheme.
    ///
    /// `unix://` and absolute paths use the unix socket transport; `tcp://`
    /// and `http://` use TCP.
    pub fn connect_with_endpoint(endpoint: &str) -> Result<Moby, Error> {
        #[cfg(unix)]
        if endpoint.starts_with("unix://") || endpoint.starts_with('/') {
            return Moby::connect_with_unix(endpoint, DEFAULT_TIMEOUT, API_DEFAULT_VERSION);
        }
        if let Some(addr) = endpoint
            .strip_prefix("tcp://")
            .or_else(|| endpoint.strip_prefix("http://"))
        {
            return Moby::connect_with_http(addr, DEFAULT_TIMEOUT, API_DEFAULT_VERSION);
        }
        let scheme = endpoint.split("://").next().unwrap_or(endpoint);
        Err(Error::UnsupportedSchemeError {
            scheme: scheme.to_string(),
        })
    }

    /// Connect using a Unix socket.
    ///
    /// # Arguments
    ///
    ///  - `path`: socket path, with or without the `unix://` prefix.
    ///  - `timeout`: the read/write timeout (seconds) applied to every request.
    ///  - `client_version`: the API version to communicate with the server.
    #[cfg(unix)]
    pub fn connect_with_unix(
        path: &str,
        timeout: u64,
        client_version: &ClientVersion,
    ) -> Result<Moby, Error> {
        let client_addr = path.replacen("unix://", "", 1);

        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder.pool_max_idle_per_host(0);
        let client = client_builder.build(hyperlocal::UnixConnector);

        Ok(Moby {
            transport: Arc::new(Transport::Unix { client }),
            client_type: ClientType::Unix,
            client_addr,
            client_timeout: timeout,
            version: Arc::new((
                AtomicUsize::new(client_version.major_version),
                AtomicUsize::new(client_version.minor_version),
            )),
        })
    }

    /// Connect over TCP.
    ///
    /// # Arguments
    ///
    ///  - `addr`: `host:port` of the daemon.
    ///  - `timeout`: the read/write timeout (seconds) applied to every request.
    ///  - `client_version`: the API version to communicate with the server.
    pub fn connect_with_http(
        addr: &str,
        timeout: u64,
        client_version: &ClientVersion,
    ) -> Result<Moby, Error> {
        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder.pool_max_idle_per_host(0);
        let client = client_builder.build(HttpConnector::new());

        Ok(Moby {
            transport: Arc::new(Transport::Http { client }),
            client_type: ClientType::Http,
            client_addr: addr.to_string(),
            client_timeout: timeout,
            version: Arc::new((
                AtomicUsize::new(client_version.major_version),
                AtomicUsize::new(client_version.minor_version),
            )),
        })
    }

    /// The currently negotiated client version.
    pub fn client_version(&self) -> ClientVersion {
        (&self.version).into()
    }

    /// Check with the server for a supported version, and downgrade the
    /// client version if appropriate.
    pub async fn negotiate_version(self) -> Result<Moby, Error> {
        let res = self.version().await?;
        let Some(api_version) = res.api_version else {
            return Err(Error::APIVersionParseError);
        };
        let mut parts = api_version.split('.').map(str::parse::<usize>);
        let server_version = match (parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor))) => ClientVersion {
                major_version: major,
                minor_version: minor,
            },
            _ => return Err(Error::APIVersionParseError),
        };
        if server_version < self.client_version() {
            self.version
                .0
                .store(server_version.major_version, Ordering::Relaxed);
            self.version
                .1
                .store(server_version.minor_version, Ordering::Relaxed);
        }
        Ok(self)
    }

    /// Ping the daemon.
    pub async fn ping(&self) -> Result<String, Error> {
        let req = self.build_request(
            "/_ping",
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_string(req).await
    }

    /// Daemon version information.
    pub async fn version(&self) -> Result<VersionResponse, Error> {
        let req = self.build_request(
            "/version",
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_value(req).await
    }

    /// System-wide daemon information.
    pub async fn info(&self) -> Result<SystemInfo, Error> {
        let req = self.build_request(
            "/info",
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_value(req).await
    }

    /// Inspect a container by name or id.
    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse, Error> {
        let url = format!("/containers/{name}/json");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_value(req).await
    }

    /// Create a named container.
    pub async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<ContainerCreateResponse, Error> {
        #[derive(SerializeDerive)]
        struct CreateContainerQuery<'a> {
            name: &'a str,
        }
        let req = self.build_request(
            "/containers/create",
            Builder::new().method(Method::POST),
            Some(CreateContainerQuery { name }),
            Moby::serialize_payload(Some(body)),
        );
        self.process_into_value(req).await
    }

    /// Start a created container.
    pub async fn start_container(&self, name: &str) -> Result<(), Error> {
        let url = format!("/containers/{name}/start");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_unit(req).await
    }

    /// Kill a running container.
    pub async fn kill_container(&self, name: &str) -> Result<(), Error> {
        let url = format!("/containers/{name}/kill");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_unit(req).await
    }

    /// Remove a container, optionally forcing removal of a running one and
    /// dropping its anonymous volumes.
    pub async fn remove_container(
        &self,
        name: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), Error> {
        #[derive(SerializeDerive)]
        struct RemoveContainerQuery {
            force: bool,
            v: bool,
        }
        let url = format!("/containers/{name}");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::DELETE),
            Some(RemoveContainerQuery {
                force,
                v: remove_volumes,
            }),
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_unit(req).await
    }

    /// Remove a named volume.
    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<(), Error> {
        #[derive(SerializeDerive)]
        struct RemoveVolumeQuery {
            force: bool,
        }
        let url = format!("/volumes/{name}");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::DELETE),
            Some(RemoveVolumeQuery { force }),
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_unit(req).await
    }

    /// Pull an image, draining the progress stream. A mid-stream error
    /// record fails the pull.
    pub async fn create_image(&self, from_image: &str) -> Result<(), Error> {
        #[derive(SerializeDerive)]
        #[serde(rename_all = "camelCase")]
        struct CreateImageQuery<'a> {
            from_image: &'a str,
        }
        let req = self.build_request(
            "/images/create",
            Builder::new().method(Method::POST),
            Some(CreateImageQuery { from_image }),
            Ok(Full::new(Bytes::new())),
        );
        let mut progress = self.process_into_stream::<CreateImageInfo>(req);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(error) = info.error {
                return Err(Error::DaemonResponseError {
                    status_code: 500,
                    message: error,
                });
            }
            trace!("pull {from_image}: {}", info.status.unwrap_or_default());
        }
        Ok(())
    }

    /// Create an exec instance in a running container.
    ///
    /// # Arguments
    ///
    ///  - Container name as a string slice.
    ///  - [`ExecConfig`] describing the process and which streams to attach.
    ///
    /// # Returns
    ///
    ///  - An [`ExecCreateResponse`] carrying the exec id.
    pub async fn create_exec(
        &self,
        container_name: &str,
        config: ExecConfig,
    ) -> Result<ExecCreateResponse, Error> {
        let url = format!("/containers/{container_name}/exec");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::POST),
            None::<String>,
            Moby::serialize_payload(Some(config)),
        );
        self.process_into_value(req).await
    }

    /// Start an exec instance and hijack the connection into a raw duplex
    /// byte stream.
    ///
    /// The returned halves carry the multiplexed attach framing unless the
    /// exec was created with a TTY; the stream-frame decoder strips the
    /// framing.
    pub async fn start_exec_attached(
        &self,
        exec_id: &str,
    ) -> Result<(impl AsyncRead + Send, impl AsyncWrite + Send), Error> {
        #[derive(SerializeDerive)]
        #[serde(rename_all = "PascalCase")]
        struct StartExecBody {
            detach: bool,
        }
        let url = format!("/exec/{exec_id}/start");
        let req = self.build_request(
            &url,
            Builder::new()
                .method(Method::POST)
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, "tcp"),
            None::<String>,
            Moby::serialize_payload(Some(StartExecBody { detach: false })),
        );
        self.process_upgraded(req).await
    }

    /// Inspect an exec instance.
    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, Error> {
        let url = format!("/exec/{exec_id}/json");
        let req = self.build_request(
            &url,
            Builder::new().method(Method::GET),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_into_value(req).await
    }

    /// Hijack an arbitrary daemon endpoint into a raw duplex stream. The
    /// moby driver uses this to upgrade `/grpc` for its solver session.
    pub(crate) async fn upgraded_request(
        &self,
        path: &str,
        builder: Builder,
    ) -> Result<(impl AsyncRead + Send, impl AsyncWrite + Send), Error> {
        let req = self.build_request(
            path,
            builder
                .method(Method::POST)
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, "h2c"),
            None::<String>,
            Ok(Full::new(Bytes::new())),
        );
        self.process_upgraded(req).await
    }
}

// The implementation block for request plumbing.
impl Moby {
    pub(crate) fn build_request<O>(
        &self,
        path: &str,
        builder: Builder,
        query: Option<O>,
        payload: Result<BodyType, Error>,
    ) -> Result<Request<BodyType>, Error>
    where
        O: Serialize,
    {
        let uri = uri::parse(
            &self.client_addr,
            self.client_type,
            path,
            query,
            &self.client_version(),
        )?;
        debug!("{uri}");
        Ok(builder
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(payload?)?)
    }

    pub(crate) fn serialize_payload<S>(body: Option<S>) -> Result<BodyType, Error>
    where
        S: Serialize,
    {
        match body.map(|inst| serde_json::to_string(&inst)) {
            Some(Ok(res)) => Ok(res),
            Some(Err(e)) => Err(e.into()),
            None => Ok(String::new()),
        }
        .map(|payload| {
            trace!("{payload}");
            Full::new(Bytes::from(payload))
        })
    }

    async fn process_request(
        &self,
        request: Result<Request<BodyType>, Error>,
    ) -> Result<Response<Incoming>, Error> {
        let request = request?;
        trace!("request: {request:?}");
        let response = self.execute_request(request).await?;

        let status = response.status();
        match status {
            s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(response),
            StatusCode::SWITCHING_PROTOCOLS => Ok(response),
            _ => {
                let contents = Moby::decode_into_string(response).await?;
                let message = if contents.is_empty() {
                    String::new()
                } else {
                    serde_json::from_str::<ServerErrorMessage>(&contents)
                        .map(|msg| msg.message)
                        .or_else(|e| if e.is_data() { Ok(contents) } else { Err(e) })?
                };
                Err(Error::DaemonResponseError {
                    status_code: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn execute_request(&self, req: Request<BodyType>) -> Result<Response<Incoming>, Error> {
        let request = match &*self.transport {
            Transport::Http { client } => client.request(req),
            #[cfg(unix)]
            Transport::Unix { client } => client.request(req),
        };
        match tokio::time::timeout(Duration::from_secs(self.client_timeout), request).await {
            Ok(v) => Ok(v?),
            Err(_) => Err(Error::RequestTimeoutError),
        }
    }

    async fn process_into_value<T>(
        &self,
        req: Result<Request<BodyType>, Error>,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let response = self.process_request(req).await?;
        Moby::decode_response(response).await
    }

    async fn process_into_unit(&self, req: Result<Request<BodyType>, Error>) -> Result<(), Error> {
        self.process_request(req).await?;
        Ok(())
    }

    async fn process_into_string(
        &self,
        req: Result<Request<BodyType>, Error>,
    ) -> Result<String, Error> {
        let response = self.process_request(req).await?;
        Moby::decode_into_string(response).await
    }

    fn process_into_stream<'a, T>(
        &'a self,
        req: Result<Request<BodyType>, Error>,
    ) -> impl Stream<Item = Result<T, Error>> + Unpin + 'a
    where
        T: DeserializeOwned + 'a,
    {
        Box::pin(async_stream(self, req).try_flatten_stream())
    }

    async fn process_upgraded(
        &self,
        req: Result<Request<BodyType>, Error>,
    ) -> Result<(impl AsyncRead + Send, impl AsyncWrite + Send), Error> {
        let res = self.process_request(req).await?;
        let upgraded = hyper::upgrade::on(res).await?;
        Ok(split(TokioIo::new(upgraded)))
    }

    async fn decode_into_string(response: Response<Incoming>) -> Result<String, Error> {
        let body = response.into_body().collect().await?.to_bytes();
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    async fn decode_response<T>(response: Response<Incoming>) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let bytes = response.into_body().collect().await?.to_bytes();
        trace!("decoding: {}", String::from_utf8_lossy(&bytes));
        serde_json::from_slice::<T>(&bytes).map_err(|e| {
            if e.is_data() {
                Error::JsonDataError {
                    message: e.to_string(),
                    #[cfg(feature = "json_data_content")]
                    contents: String::from_utf8_lossy(&bytes).to_string(),
                }
            } else {
                e.into()
            }
        })
    }
}

async fn async_stream<T>(
    moby: &Moby,
    req: Result<Request<BodyType>, Error>,
) -> Result<impl Stream<Item = Result<T, Error>>, Error>
where
    T: DeserializeOwned,
{
    let response = moby.process_request(req).await?;
    let reader = StreamReader::new(
        response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other),
    );
    Ok(FramedRead::new(reader, JsonLineDecoder::new()))
}
