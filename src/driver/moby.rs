//! The moby driver drives the solver embedded in the docker daemon itself,
//! dialing it by upgrading the daemon's `/grpc` endpoint.

use std::collections::HashMap;

use http::request::Builder;
use log::debug;

use super::{
    reject_unknown_opts, DriverInfo, Feature, Features, InitConfig, Status, PRIORITY_UNSUPPORTED,
};
use crate::errors::Error;
use crate::moby::Moby;
use crate::solver::DialStream;

const DRIVER_NAME: &str = "docker";

/// Factory for the moby driver.
#[derive(Debug)]
pub struct MobyFactory;

#[async_trait::async_trait]
impl super::Factory for MobyFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn usage(&self) -> &'static str {
        "build with the solver embedded in the docker daemon"
    }

    fn priority(&self, endpoint: &str, api: Option<&Moby>) -> u8 {
        // The embedded solver is only reachable through a daemon client.
        if api.is_none() {
            return PRIORITY_UNSUPPORTED;
        }
        if endpoint.is_empty()
            || endpoint.starts_with("unix://")
            || endpoint.starts_with("tcp://")
            || endpoint.starts_with("npipe://")
        {
            20
        } else {
            PRIORITY_UNSUPPORTED
        }
    }

    // The driver maps one-to-one onto daemon endpoints; it cannot be
    // instantiated under a user chosen name.
    fn allows_instances(&self) -> bool {
        false
    }

    async fn new_driver(
        &self,
        config: InitConfig,
    ) -> Result<std::sync::Arc<dyn super::Driver>, Error> {
        reject_unknown_opts(&config.driver_opts, DRIVER_NAME)?;
        if !config.flags.is_empty() {
            return Err(Error::invalid(
                "daemon flags cannot be set for the docker driver",
            ));
        }
        if config.config_file.is_some() {
            return Err(Error::invalid(
                "a configuration file cannot be set for the docker driver",
            ));
        }
        let docker = if config.endpoint.is_empty() {
            Moby::connect_with_defaults()
        } else {
            Moby::connect_with_endpoint(&config.endpoint)
        }
        .map_err(|e| e.for_driver(DRIVER_NAME))?;
        Ok(std::sync::Arc::new(MobyDriver { docker }))
    }
}

/// The moby driver instance for one daemon endpoint.
#[derive(Debug)]
pub struct MobyDriver {
    docker: Moby,
}

#[async_trait::async_trait]
impl super::Driver for MobyDriver {
    fn kind(&self) -> &'static str {
        DRIVER_NAME
    }

    // The daemon is externally managed; bootstrap only verifies it answers.
    async fn bootstrap(&self) -> Result<(), Error> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| e.for_driver(DRIVER_NAME))
    }

    async fn info(&self) -> Result<DriverInfo, Error> {
        let status = match self.docker.ping().await {
            Ok(_) => Status::Running,
            Err(_) => Status::Stopped,
        };
        Ok(DriverInfo::with_status(status))
    }

    async fn version(&self) -> Result<String, Error> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| e.for_driver(DRIVER_NAME))?;
        Ok(version.version.unwrap_or_default())
    }

    async fn stop(&self, _force: bool) -> Result<(), Error> {
        Ok(())
    }

    // The daemon cannot be removed through a builder; only the builder
    // record goes away.
    async fn rm(&self, _force: bool, _rm_volume: bool, _rm_daemon: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn dial(&self) -> Result<DialStream, Error> {
        debug!("upgrading daemon /grpc endpoint");
        let (read, write) = self
            .docker
            .upgraded_request("/grpc", Builder::new())
            .await
            .map_err(|e| e.for_driver(DRIVER_NAME))?;
        Ok(DialStream::new(Box::pin(read), Box::pin(write)))
    }

    async fn features(&self) -> Features {
        HashMap::from([
            (Feature::OciExporter, false),
            (Feature::DockerExporter, true),
            (Feature::CacheExport, false),
            (Feature::MultiPlatform, false),
            (Feature::DefaultLoad, true),
        ])
    }
}
