//! The remote driver connects to a solver daemon that is already running
//! somewhere else, over TCP (optionally TLS) or a unix socket. It creates
//! no resources of its own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use super::{
    reject_unknown_opts, DriverInfo, Feature, Features, InitConfig, Status,
    BOOTSTRAP_POLL_INTERVAL, PRIORITY_UNSUPPORTED,
};
use crate::errors::Error;
use crate::solver::DialStream;

const DRIVER_NAME: &str = "remote";

/// Environment variable providing the default remote endpoint.
pub const BUILDKIT_HOST_ENV: &str = "BUILDKIT_HOST";

/// Factory for the remote driver.
#[derive(Debug)]
pub struct RemoteFactory;

#[async_trait::async_trait]
impl super::Factory for RemoteFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn usage(&self) -> &'static str {
        "connect to an externally managed solver endpoint"
    }

    fn priority(&self, endpoint: &str, _api: Option<&crate::moby::Moby>) -> u8 {
        let endpoint = if endpoint.is_empty() {
            std::env::var(BUILDKIT_HOST_ENV).unwrap_or_default()
        } else {
            endpoint.to_string()
        };
        if endpoint.starts_with("tcp://") || endpoint.starts_with("unix://") {
            40
        } else {
            PRIORITY_UNSUPPORTED
        }
    }

    fn allows_instances(&self) -> bool {
        true
    }

    async fn new_driver(
        &self,
        config: InitConfig,
    ) -> Result<Arc<dyn super::Driver>, Error> {
        Ok(Arc::new(Remote::new(config)?))
    }
}

#[derive(Debug, Clone, Default)]
struct TlsOpts {
    cacert: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    servername: Option<String>,
}

impl TlsOpts {
    fn configured(&self) -> bool {
        self.cacert.is_some() || self.cert.is_some() || self.key.is_some()
    }
}

#[derive(Debug, Clone)]
enum RemoteEndpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

/// The remote driver instance for one endpoint.
#[derive(Debug)]
pub struct Remote {
    endpoint: RemoteEndpoint,
    tls: TlsOpts,
    default_load: bool,
    timeout: std::time::Duration,
}

impl Remote {
    fn new(mut config: InitConfig) -> Result<Remote, Error> {
        config.parse_timeout_opt()?;
        let timeout = config.bootstrap_timeout();

        let mut tls = TlsOpts::default();
        tls.cacert = config.driver_opts.remove("cacert").map(PathBuf::from);
        tls.cert = config.driver_opts.remove("cert").map(PathBuf::from);
        tls.key = config.driver_opts.remove("key").map(PathBuf::from);
        tls.servername = config.driver_opts.remove("servername");
        let default_load = match config.driver_opts.remove("default-load") {
            Some(raw) => raw.parse().map_err(|_| {
                Error::invalid(format!("invalid default-load value {raw:?}"))
            })?,
            None => false,
        };
        reject_unknown_opts(&config.driver_opts, DRIVER_NAME)?;

        if tls.cert.is_some() != tls.key.is_some() {
            return Err(Error::invalid(
                "cert and key driver options must be set together",
            ));
        }
        if !config.flags.is_empty() || config.config_file.is_some() {
            return Err(Error::invalid(
                "daemon flags and configuration cannot be set for an external endpoint",
            ));
        }

        let raw_endpoint = if config.endpoint.is_empty() {
            std::env::var(BUILDKIT_HOST_ENV)
                .map_err(|_| Error::invalid("no remote endpoint and BUILDKIT_HOST is unset"))?
        } else {
            config.endpoint
        };
        let url = Url::parse(&raw_endpoint).map_err(|err| Error::UrlParseError {
            endpoint: raw_endpoint.clone(),
            err,
        })?;
        let endpoint = match url.scheme() {
            "tcp" => RemoteEndpoint::Tcp {
                host: url
                    .host_str()
                    .ok_or_else(|| Error::invalid(format!("no host in {raw_endpoint}")))?
                    .to_string(),
                port: url.port().unwrap_or(1234),
            },
            #[cfg(unix)]
            "unix" => RemoteEndpoint::Unix {
                path: PathBuf::from(url.path()),
            },
            scheme => {
                return Err(Error::UnsupportedSchemeError {
                    scheme: scheme.to_string(),
                })
            }
        };
        if !matches!(endpoint, RemoteEndpoint::Tcp { .. }) && tls.configured() {
            return Err(Error::invalid("TLS options require a tcp endpoint"));
        }

        Ok(Remote {
            endpoint,
            tls,
            default_load,
            timeout,
        })
    }

    fn tls_connector(&self) -> Result<TlsConnector, Error> {
        let mut roots = rustls::RootCertStore::empty();
        match &self.tls.cacert {
            Some(cacert) => {
                for cert in CertificateDer::pem_file_iter(cacert)
                    .map_err(|e| Error::invalid(format!("unable to read {cacert:?}: {e}")))?
                {
                    let cert = cert
                        .map_err(|e| Error::invalid(format!("unable to read {cacert:?}: {e}")))?;
                    roots
                        .add(cert)
                        .map_err(|e| Error::TlsError { err: e })?;
                }
            }
            None => {
                for cert in rustls_native_certs::load_native_certs().certs {
                    // Unusable system certificates are skipped, matching
                    // what the platform TLS stack does.
                    let _ = roots.add(cert);
                }
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsError { err: e })?
            .with_root_certificates(roots);
        let config = match (&self.tls.cert, &self.tls.key) {
            (Some(cert), Some(key)) => {
                let certs = CertificateDer::pem_file_iter(cert)
                    .map_err(|e| Error::invalid(format!("unable to read {cert:?}: {e}")))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| Error::invalid(format!("unable to read {cert:?}: {e}")))?;
                let key = PrivateKeyDer::from_pem_file(key)
                    .map_err(|e| Error::invalid(format!("unable to read {key:?}: {e}")))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::TlsError { err: e })?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    async fn connect(&self) -> Result<DialStream, Error> {
        match &self.endpoint {
            RemoteEndpoint::Tcp { host, port } => {
                debug!("dialing solver at tcp://{host}:{port}");
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                if self.tls.configured() {
                    let connector = self.tls_connector()?;
                    let name = self
                        .tls
                        .servername
                        .clone()
                        .unwrap_or_else(|| host.clone());
                    let name = ServerName::try_from(name)
                        .map_err(|_| Error::invalid("invalid TLS server name"))?;
                    let tls = connector.connect(name, stream).await?;
                    let (read, write) = tokio::io::split(tls);
                    Ok(DialStream::new(Box::pin(read), Box::pin(write)))
                } else {
                    let (read, write) = tokio::io::split(stream);
                    Ok(DialStream::new(Box::pin(read), Box::pin(write)))
                }
            }
            #[cfg(unix)]
            RemoteEndpoint::Unix { path } => {
                debug!("dialing solver at unix://{}", path.display());
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (read, write) = tokio::io::split(stream);
                Ok(DialStream::new(Box::pin(read), Box::pin(write)))
            }
        }
    }
}

#[async_trait::async_trait]
impl super::Driver for Remote {
    fn kind(&self) -> &'static str {
        DRIVER_NAME
    }

    /// The endpoint is externally managed; bootstrap waits until it accepts
    /// connections.
    async fn bootstrap(&self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last: Option<Error> = None;
        loop {
            match self.connect().await {
                Ok(_) => return Ok(()),
                Err(e) => last = Some(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::TimeoutError {
                    driver: DRIVER_NAME,
                    seconds: self.timeout.as_secs(),
                    last: last.map(Box::new),
                });
            }
            tokio::time::sleep(BOOTSTRAP_POLL_INTERVAL).await;
        }
    }

    async fn info(&self) -> Result<DriverInfo, Error> {
        let status = match self.connect().await {
            Ok(_) => Status::Running,
            Err(_) => Status::Inactive,
        };
        Ok(DriverInfo::with_status(status))
    }

    // Version is negotiated over the solver's own control API, which is
    // opaque here.
    async fn version(&self) -> Result<String, Error> {
        Ok(String::new())
    }

    async fn stop(&self, _force: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn rm(&self, _force: bool, _rm_volume: bool, _rm_daemon: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn dial(&self) -> Result<DialStream, Error> {
        self.connect().await.map_err(|e| e.for_driver(DRIVER_NAME))
    }

    async fn features(&self) -> Features {
        HashMap::from([
            (Feature::OciExporter, true),
            (Feature::DockerExporter, false),
            (Feature::CacheExport, true),
            (Feature::MultiPlatform, true),
            (Feature::DefaultLoad, self.default_load),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str, opts: &[(&str, &str)]) -> InitConfig {
        InitConfig {
            name: String::from("r0"),
            endpoint: endpoint.to_string(),
            driver_opts: opts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_tcp_endpoints() {
        let remote = Remote::new(config("tcp://10.0.0.1:8372", &[])).unwrap();
        match remote.endpoint {
            RemoteEndpoint::Tcp { ref host, port } => {
                assert_eq!(host, "10.0.0.1");
                assert_eq!(port, 8372);
            }
            #[cfg(unix)]
            _ => panic!("expected tcp endpoint"),
        }
    }

    #[test]
    fn rejects_cert_without_key() {
        let err = Remote::new(config("tcp://h:1", &[("cert", "/c.pem")])).unwrap_err();
        assert!(err.to_string().contains("cert and key"));
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(Remote::new(config("https://h:1", &[])).is_err());
    }
}
