//! The pod-group driver schedules solver pods on a Kubernetes cluster and
//! dials them with an exec-attach through the API server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Pod, PodSpec, PodTemplateSpec, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use log::{debug, info};
use rand::seq::IndexedRandom;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use super::{
    reject_unknown_opts, DriverInfo, DynamicNode, Feature, Features, InitConfig, Status,
    BOOTSTRAP_POLL_INTERVAL, PRIORITY_UNSUPPORTED,
};
use crate::errors::Error;
use crate::platform::Platform;
use crate::solver::DialStream;

const DRIVER_NAME: &str = "kubernetes";

/// The default solver image for cluster pods.
pub const DEFAULT_IMAGE: &str = "moby/buildkit:master";
/// Rootless variant of the default solver image.
pub const DEFAULT_ROOTLESS_IMAGE: &str = "moby/buildkit:master-rootless";

/// Pod annotation listing the platforms a pod covers, comma separated.
pub const PLATFORM_ANNOTATION: &str = "capstan.io/platforms";

const APP_LABEL: &str = "app";
const CONFIG_VOLUME: &str = "buildkitd-config";
const CONFIG_DIR: &str = "/etc/buildkit";

/// How dial picks among the running pods of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LoadBalance {
    /// Deterministically use the first pod, keeping cache locality.
    #[default]
    Sticky,
    /// Pick a random running pod.
    Random,
}

/// Factory for the pod-group driver.
#[derive(Debug)]
pub struct KubernetesFactory;

#[async_trait::async_trait]
impl super::Factory for KubernetesFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn usage(&self) -> &'static str {
        "schedule solver pods on a kubernetes cluster"
    }

    fn priority(&self, endpoint: &str, _api: Option<&crate::moby::Moby>) -> u8 {
        if endpoint.starts_with("kubernetes://") {
            50
        } else {
            PRIORITY_UNSUPPORTED
        }
    }

    fn allows_instances(&self) -> bool {
        true
    }

    async fn new_driver(&self, config: InitConfig) -> Result<Arc<dyn super::Driver>, Error> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::from(e).for_driver(DRIVER_NAME))?;
        Ok(Arc::new(Kubernetes::new(client, config)?))
    }
}

#[derive(Debug, Clone)]
struct KubernetesOpts {
    namespace: String,
    image: Option<String>,
    replicas: i32,
    rootless: bool,
    loadbalance: LoadBalance,
}

impl KubernetesOpts {
    fn parse(opts: &mut HashMap<String, String>) -> Result<KubernetesOpts, Error> {
        let namespace = opts
            .remove("namespace")
            .unwrap_or_else(|| String::from("default"));
        let image = opts.remove("image");
        let replicas = match opts.remove("replicas") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::invalid(format!("invalid replicas count {raw:?}")))?,
            None => 1,
        };
        let rootless = match opts.remove("rootless") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::invalid(format!("invalid rootless value {raw:?}")))?,
            None => false,
        };
        let loadbalance = match opts.remove("loadbalance").as_deref() {
            None | Some("sticky") => LoadBalance::Sticky,
            Some("random") => LoadBalance::Random,
            Some(other) => {
                return Err(Error::invalid(format!(
                    "invalid loadbalance strategy {other:?}"
                )))
            }
        };
        reject_unknown_opts(opts, DRIVER_NAME)?;
        Ok(KubernetesOpts {
            namespace,
            image,
            replicas,
            rootless,
            loadbalance,
        })
    }
}

/// The pod-group driver instance for one node.
pub struct Kubernetes {
    client: Client,
    deployment_name: String,
    platforms: Vec<Platform>,
    flags: Vec<String>,
    config_file: Option<std::path::PathBuf>,
    opts: KubernetesOpts,
    timeout: std::time::Duration,
    bootstrap_gate: Mutex<()>,
}

impl std::fmt::Debug for Kubernetes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubernetes")
            .field("deployment_name", &self.deployment_name)
            .field("namespace", &self.opts.namespace)
            .finish()
    }
}

impl Kubernetes {
    fn new(client: Client, mut config: InitConfig) -> Result<Kubernetes, Error> {
        config.parse_timeout_opt()?;
        let timeout = config.bootstrap_timeout();
        let opts = KubernetesOpts::parse(&mut config.driver_opts)?;
        Ok(Kubernetes {
            client,
            deployment_name: config.name.replace('_', "-"),
            platforms: config.platforms,
            flags: config.flags,
            config_file: config.config_file,
            timeout,
            opts,
            bootstrap_gate: Mutex::new(()),
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.opts.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.opts.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.opts.namespace)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(String::from(APP_LABEL), self.deployment_name.clone())])
    }

    fn deployment(&self) -> Deployment {
        let image = self.opts.image.clone().unwrap_or_else(|| {
            String::from(if self.opts.rootless {
                DEFAULT_ROOTLESS_IMAGE
            } else {
                DEFAULT_IMAGE
            })
        });

        let mut args = self.flags.clone();
        if self.opts.rootless {
            args.push(String::from("--oci-worker-no-process-sandbox"));
        }
        if self.config_file.is_some() {
            args.push(format!("--config={CONFIG_DIR}/buildkitd.toml"));
        }

        let mut volumes = Vec::new();
        let mut volume_mounts = Vec::new();
        if self.config_file.is_some() {
            volumes.push(Volume {
                name: String::from(CONFIG_VOLUME),
                config_map: Some(ConfigMapVolumeSource {
                    name: self.deployment_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: String::from(CONFIG_VOLUME),
                mount_path: String::from(CONFIG_DIR),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let annotations = if self.platforms.is_empty() {
            None
        } else {
            Some(BTreeMap::from([(
                String::from(PLATFORM_ANNOTATION),
                crate::platform::format_list(&self.platforms),
            )]))
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.deployment_name.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.opts.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        annotations,
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: String::from("buildkitd"),
                            image: Some(image),
                            args: Some(args),
                            security_context: Some(SecurityContext {
                                privileged: Some(!self.opts.rootless),
                                ..Default::default()
                            }),
                            volume_mounts: if volume_mounts.is_empty() {
                                None
                            } else {
                                Some(volume_mounts)
                            },
                            ..Default::default()
                        }],
                        volumes: if volumes.is_empty() {
                            None
                        } else {
                            Some(volumes)
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create(&self) -> Result<(), Error> {
        if let Some(config_file) = &self.config_file {
            let data = std::fs::read_to_string(config_file)?;
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.deployment_name.clone()),
                    labels: Some(self.labels()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(String::from("buildkitd.toml"), data)])),
                ..Default::default()
            };
            match self
                .config_maps()
                .create(&PostParams::default(), &config_map)
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!("creating deployment {}", self.deployment_name);
        match self
            .deployments()
            .create(&PostParams::default(), &self.deployment())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn running_pods(&self) -> Result<Vec<Pod>, Error> {
        let selector = format!("{APP_LABEL}={}", self.deployment_name);
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        let mut running: Vec<Pod> = pods
            .items
            .into_iter()
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|phase| phase == "Running")
                    .unwrap_or(false)
            })
            .collect();
        running.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(running)
    }

    async fn choose_pod(&self) -> Result<String, Error> {
        let running = self.running_pods().await?;
        let pod = match self.opts.loadbalance {
            LoadBalance::Sticky => running.first(),
            LoadBalance::Random => running.choose(&mut rand::rng()),
        };
        pod.and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| Error::not_found("pod", &*self.deployment_name))
    }

    async fn wait_ready(&self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last: Option<Error> = None;
        loop {
            match self.deployments().get(&self.deployment_name).await {
                Ok(deployment) => {
                    let ready = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or(0);
                    if ready >= self.opts.replicas {
                        return Ok(());
                    }
                }
                Err(e) => last = Some(e.into()),
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

    async fn exec_pipe(
        &self,
        pod: &str,
        command: Vec<&str>,
    ) -> Result<kube::api::AttachedProcess, Error> {
        let attached = self
            .pods()
            .exec(
                pod,
                command,
                &AttachParams::default()
                    .stdin(true)
                    .stdout(true)
                    .stderr(false),
            )
            .await?;
        Ok(attached)
    }
}

#[async_trait::async_trait]
impl super::Driver for Kubernetes {
    fn kind(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn bootstrap(&self) -> Result<(), Error> {
        let _gate = self.bootstrap_gate.lock().await;

        match self.deployments().get(&self.deployment_name).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                self.create().await.map_err(|e| e.for_driver(DRIVER_NAME))?;
            }
            Err(e) => return Err(Error::from(e).for_driver(DRIVER_NAME)),
        }

        self.wait_ready().await?;
        info!(
            "deployment {} has {} ready replica(s)",
            self.deployment_name, self.opts.replicas
        );
        Ok(())
    }

    async fn info(&self) -> Result<DriverInfo, Error> {
        match self.deployments().get(&self.deployment_name).await {
            Ok(deployment) => {
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                let status = if ready >= self.opts.replicas {
                    Status::Running
                } else {
                    Status::Starting
                };
                let dynamic_nodes = self
                    .running_pods()
                    .await?
                    .into_iter()
                    .filter_map(|pod| {
                        let name = pod.metadata.name.clone()?;
                        let platforms = pod
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(PLATFORM_ANNOTATION))
                            .map(|raw| Platform::parse_list(raw).unwrap_or_default())
                            .unwrap_or_default();
                        Some(DynamicNode { name, platforms })
                    })
                    .collect();
                Ok(DriverInfo {
                    status,
                    dynamic_nodes,
                })
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Ok(DriverInfo::with_status(Status::Inactive))
            }
            Err(e) => Err(Error::from(e).for_driver(DRIVER_NAME)),
        }
    }

    async fn version(&self) -> Result<String, Error> {
        let pod = self.choose_pod().await?;
        let mut attached = self.exec_pipe(&pod, vec!["buildctl", "--version"]).await?;
        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_string(&mut output).await?;
        }
        let _ = attached.join().await;
        Ok(output.trim().to_string())
    }

    async fn stop(&self, _force: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn rm(&self, _force: bool, _rm_volume: bool, rm_daemon: bool) -> Result<(), Error> {
        if !rm_daemon {
            return Ok(());
        }
        match self
            .deployments()
            .delete(&self.deployment_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::from(e).for_driver(DRIVER_NAME)),
        }
        match self
            .config_maps()
            .delete(&self.deployment_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::from(e).for_driver(DRIVER_NAME)),
        }
        Ok(())
    }

    async fn dial(&self) -> Result<DialStream, Error> {
        let pod = self.choose_pod().await?;
        debug!("dialing solver in pod {pod}");
        let mut attached = self
            .exec_pipe(&pod, vec!["buildctl", "dial-stdio"])
            .await
            .map_err(|e| e.for_driver(DRIVER_NAME))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::invalid("exec-attach returned no stdout stream"))?;
        let stdin = attached
            .stdin()
            .ok_or_else(|| Error::invalid("exec-attach returned no stdin stream"))?;
        // The attach session outlives this call; park its join so the exec
        // status is collected when the stream closes.
        tokio::spawn(async move {
            let _ = attached.join().await;
        });
        Ok(DialStream::new(Box::pin(stdout), Box::pin(stdin)))
    }

    async fn features(&self) -> Features {
        HashMap::from([
            (Feature::OciExporter, true),
            (Feature::DockerExporter, false),
            (Feature::CacheExport, true),
            (Feature::MultiPlatform, true),
            (Feature::DefaultLoad, false),
        ])
    }
}
