//! The container driver runs a solver daemon in a privileged container next
//! to the docker daemon, and dials it by hooking into an execution
//! stdin/stdout pipe.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use log::{debug, info, trace};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;

use super::{
    reject_unknown_opts, DriverInfo, Feature, Features, InitConfig, Status,
    BOOTSTRAP_POLL_INTERVAL, PRIORITY_UNSUPPORTED,
};
use crate::errors::Error;
use crate::moby::models::{
    ContainerCreateBody, ExecConfig, HostConfig, Mount, RestartPolicy,
};
use crate::moby::read::StreamFrame;
use crate::moby::Moby;
use crate::solver::DialStream;

/// The default solver image to run when the node does not name one.
pub const DEFAULT_IMAGE: &str = "moby/buildkit:master";

const DRIVER_NAME: &str = "docker-container";
const CONTAINER_PREFIX: &str = "capstan_buildkit_";
const STATE_DIR: &str = "/var/lib/buildkit";
const CONFIG_PATH: &str = "/etc/buildkit/buildkitd.toml";
const DUPLEX_BUF_SIZE: usize = 8 * 1024;

/// Factory for the container driver.
#[derive(Debug)]
pub struct DockerContainerFactory;

#[async_trait::async_trait]
impl super::Factory for DockerContainerFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn usage(&self) -> &'static str {
        "run a solver daemon in a container on the docker endpoint"
    }

    fn priority(&self, endpoint: &str, api: Option<&Moby>) -> u8 {
        // Without a daemon client there is nothing to run the container on.
        if api.is_none() {
            return PRIORITY_UNSUPPORTED;
        }
        if endpoint.is_empty()
            || endpoint.starts_with("unix://")
            || endpoint.starts_with("tcp://")
            || endpoint.starts_with("npipe://")
        {
            30
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
    ) -> Result<std::sync::Arc<dyn super::Driver>, Error> {
        let docker = if config.endpoint.is_empty() {
            Moby::connect_with_defaults()
        } else {
            Moby::connect_with_endpoint(&config.endpoint)
        }
        .map_err(|e| e.for_driver(DRIVER_NAME))?;
        Ok(std::sync::Arc::new(DockerContainer::new(docker, config)?))
    }
}

#[derive(Debug, Clone, Default)]
struct ContainerOpts {
    image: Option<String>,
    network: Option<String>,
    cgroup_parent: Option<String>,
    memory: Option<i64>,
    cpuset_cpus: Option<String>,
    env: Vec<String>,
    restart_policy: Option<String>,
    default_load: bool,
}

impl ContainerOpts {
    fn parse(opts: &mut HashMap<String, String>) -> Result<ContainerOpts, Error> {
        let mut parsed = ContainerOpts::default();
        parsed.image = opts.remove("image");
        parsed.network = opts.remove("network");
        parsed.cgroup_parent = opts.remove("cgroup-parent");
        parsed.cpuset_cpus = opts.remove("cpuset-cpus");
        parsed.restart_policy = opts.remove("restart-policy");
        if let Some(raw) = opts.remove("memory") {
            parsed.memory = Some(raw.parse().map_err(|_| {
                Error::invalid(format!("invalid memory limit {raw:?}"))
            })?);
        }
        if let Some(raw) = opts.remove("default-load") {
            parsed.default_load = raw.parse().map_err(|_| {
                Error::invalid(format!("invalid default-load value {raw:?}"))
            })?;
        }
        let env_keys: Vec<String> = opts
            .keys()
            .filter(|k| k.starts_with("env."))
            .cloned()
            .collect();
        for key in env_keys {
            let value = opts.remove(&key).unwrap_or_default();
            parsed.env.push(format!("{}={value}", &key["env.".len()..]));
        }
        reject_unknown_opts(opts, DRIVER_NAME)?;
        Ok(parsed)
    }
}

/// The container driver instance for one node.
#[derive(Debug)]
pub struct DockerContainer {
    docker: Moby,
    container_name: String,
    flags: Vec<String>,
    config_file: Option<std::path::PathBuf>,
    opts: ContainerOpts,
    timeout: Duration,
    default_load: bool,
    // Serializes concurrent bootstraps on this instance.
    bootstrap_gate: Mutex<()>,
}

impl DockerContainer {
    fn new(docker: Moby, mut config: InitConfig) -> Result<DockerContainer, Error> {
        config.parse_timeout_opt()?;
        let timeout = config.bootstrap_timeout();
        let opts = ContainerOpts::parse(&mut config.driver_opts)?;
        let default_load = opts.default_load;
        Ok(DockerContainer {
            docker,
            container_name: format!("{CONTAINER_PREFIX}{}", config.name),
            flags: config.flags,
            config_file: config.config_file,
            timeout,
            opts,
            default_load,
            bootstrap_gate: Mutex::new(()),
        })
    }

    /// The container name backing this node.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn create(&self) -> Result<(), Error> {
        let image_name = self.opts.image.as_deref().unwrap_or(DEFAULT_IMAGE);

        debug!("pulling image {image_name}");
        self.docker.create_image(image_name).await?;

        debug!("creating container {}", self.container_name);

        let mut cmd: Vec<String> = Vec::new();
        if self.config_file.is_some() {
            cmd.push(format!("--config={CONFIG_PATH}"));
        }
        if self.opts.network.as_deref() == Some("host") {
            cmd.push(String::from("--allow-insecure-entitlement=network.host"));
        }
        cmd.extend(self.flags.iter().cloned());

        let info = self.docker.info().await?;
        let cgroup_parent = match info.cgroup_driver.as_deref() {
            // place all solver containers into one cgroup so limits apply
            // across the whole host
            Some("cgroupfs") => Some(
                self.opts
                    .cgroup_parent
                    .clone()
                    .unwrap_or_else(|| String::from("/docker/capstan")),
            ),
            _ => None,
        };

        let userns_mode = match &info.security_options {
            Some(options) if options.iter().any(|o| o == "userns") => {
                Some(String::from("host"))
            }
            _ => None,
        };

        let mut mounts = vec![Mount {
            typ: Some(String::from("volume")),
            source: Some(format!("{}_state", self.container_name)),
            target: Some(String::from(STATE_DIR)),
        }];
        if let Some(config_file) = &self.config_file {
            mounts.push(Mount {
                typ: Some(String::from("bind")),
                source: Some(config_file.display().to_string()),
                target: Some(String::from(CONFIG_PATH)),
            });
        }

        let host_config = HostConfig {
            privileged: Some(true),
            init: Some(true),
            network_mode: self.opts.network.clone(),
            cgroup_parent,
            userns_mode,
            memory: self.opts.memory,
            cpuset_cpus: self.opts.cpuset_cpus.clone(),
            mounts: Some(mounts),
            restart_policy: self.opts.restart_policy.as_ref().map(|name| RestartPolicy {
                name: Some(name.clone()),
            }),
        };

        let body = ContainerCreateBody {
            image: Some(String::from(image_name)),
            env: Some(self.opts.env.clone()),
            cmd: Some(cmd),
            labels: None,
            host_config: Some(host_config),
        };

        self.docker
            .create_container(&self.container_name, body)
            .await?;
        Ok(())
    }

    async fn start(&self) -> Result<(), Error> {
        debug!("starting container {}", self.container_name);
        self.docker.start_container(&self.container_name).await?;
        Ok(())
    }

    /// Poll the solver daemon until it answers, the deadline passes, or the
    /// caller drops the future.
    async fn wait_ready(&self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last: Option<Error> = None;
        loop {
            match self.exec_capture(vec!["buildctl", "debug", "workers"]).await {
                Ok((0, _)) => return Ok(()),
                Ok((code, output)) => {
                    trace!("solver not ready in {}: {output}", self.container_name);
                    last = Some(Error::ExecStreamError {
                        code,
                        message: output,
                    });
                }
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

    /// Run a command inside the container and capture its combined output
    /// and exit code.
    async fn exec_capture(&self, cmd: Vec<&str>) -> Result<(i64, String), Error> {
        let exec = self
            .docker
            .create_exec(
                &self.container_name,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd.into_iter().map(String::from).collect()),
                    ..Default::default()
                },
            )
            .await?
            .id;

        let (read, _write) = self.docker.start_exec_attached(&exec).await?;
        let mut frames = FramedRead::new(read, crate::moby::read::FrameDecoder::new());
        let mut output = BytesMut::new();
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(StreamFrame::StdIn { .. }) => {}
                Ok(frame) => output.extend_from_slice(frame.as_ref()),
                Err(e) => return Err(e.into()),
            }
        }

        let inspect = self.docker.inspect_exec(&exec).await?;
        let code = inspect.exit_code.unwrap_or(-1);
        Ok((code, String::from_utf8_lossy(&output).to_string()))
    }
}

#[async_trait::async_trait]
impl super::Driver for DockerContainer {
    fn kind(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn bootstrap(&self) -> Result<(), Error> {
        let _gate = self.bootstrap_gate.lock().await;

        match self.docker.inspect_container(&self.container_name).await {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if !running {
                    self.start().await.map_err(|e| e.for_driver(DRIVER_NAME))?;
                }
            }
            Err(Error::DaemonResponseError {
                status_code: 404, ..
            }) => {
                self.create().await.map_err(|e| e.for_driver(DRIVER_NAME))?;
                self.start().await.map_err(|e| e.for_driver(DRIVER_NAME))?;
            }
            Err(e) => return Err(e.for_driver(DRIVER_NAME)),
        }

        self.wait_ready().await?;
        info!("solver container {} is ready", self.container_name);
        Ok(())
    }

    async fn info(&self) -> Result<DriverInfo, Error> {
        let status = match self.docker.inspect_container(&self.container_name).await {
            Ok(inspect) => match inspect.state {
                Some(state) if state.running.unwrap_or(false) => Status::Running,
                Some(state) => match state.status.as_deref() {
                    Some("exited") | Some("dead") => Status::Stopped,
                    Some("created") | Some("restarting") => Status::Starting,
                    _ => Status::Error,
                },
                None => Status::Error,
            },
            Err(Error::DaemonResponseError {
                status_code: 404, ..
            }) => Status::Inactive,
            Err(e) => return Err(e.for_driver(DRIVER_NAME)),
        };
        Ok(DriverInfo::with_status(status))
    }

    async fn version(&self) -> Result<String, Error> {
        let (code, output) = self.exec_capture(vec!["buildctl", "--version"]).await?;
        if code != 0 {
            return Err(Error::ExecStreamError {
                code,
                message: output,
            }
            .for_driver(DRIVER_NAME));
        }
        Ok(output.trim().to_string())
    }

    async fn stop(&self, _force: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn rm(&self, force: bool, rm_volume: bool, rm_daemon: bool) -> Result<(), Error> {
        if !rm_daemon {
            return Ok(());
        }
        match self
            .docker
            .remove_container(&self.container_name, force, rm_volume)
            .await
        {
            Ok(()) => {}
            Err(Error::DaemonResponseError {
                status_code: 404, ..
            }) => return Ok(()),
            Err(e) => return Err(e.for_driver(DRIVER_NAME)),
        }
        if rm_volume {
            match self
                .docker
                .remove_volume(&format!("{}_state", self.container_name), force)
                .await
            {
                Ok(())
                | Err(Error::DaemonResponseError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.for_driver(DRIVER_NAME)),
            }
        }
        Ok(())
    }

    async fn dial(&self) -> Result<DialStream, Error> {
        let exec = self
            .docker
            .create_exec(
                &self.container_name,
                ExecConfig {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        String::from("buildctl"),
                        String::from("dial-stdio"),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.for_driver(DRIVER_NAME))?
            .id;

        let (read, write) = self
            .docker
            .start_exec_attached(&exec)
            .await
            .map_err(|e| e.for_driver(DRIVER_NAME))?;
        Ok(DialStream::framed(
            Box::pin(read),
            Box::pin(write),
            DUPLEX_BUF_SIZE,
        ))
    }

    async fn features(&self) -> Features {
        HashMap::from([
            (Feature::OciExporter, true),
            (Feature::DockerExporter, true),
            (Feature::CacheExport, true),
            (Feature::MultiPlatform, true),
            (Feature::DefaultLoad, self.default_load),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_driver_opts() {
        let mut opts = HashMap::from([
            (String::from("image"), String::from("custom/buildkit")),
            (String::from("network"), String::from("host")),
            (String::from("memory"), String::from("1073741824")),
            (String::from("env.HTTP_PROXY"), String::from("http://p")),
            (String::from("default-load"), String::from("true")),
        ]);
        let parsed = ContainerOpts::parse(&mut opts).unwrap();
        assert_eq!(parsed.image.as_deref(), Some("custom/buildkit"));
        assert_eq!(parsed.network.as_deref(), Some("host"));
        assert_eq!(parsed.memory, Some(1073741824));
        assert_eq!(parsed.env, vec![String::from("HTTP_PROXY=http://p")]);
        assert!(parsed.default_load);
    }

    #[test]
    fn rejects_unknown_driver_opts() {
        let mut opts = HashMap::from([(String::from("bogus"), String::from("1"))]);
        let err = ContainerOpts::parse(&mut opts).unwrap_err();
        assert!(err.to_string().contains("invalid driver option bogus"));
    }
}
