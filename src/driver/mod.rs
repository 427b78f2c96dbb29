//! Driver lifecycle and capability model.
//!
//! A driver brings one node of a builder online and hands out byte streams
//! to the solver running there. Driver kinds register a [`Factory`] in the
//! process-wide registry at startup; the store only records the kind tag.

/// Driver backed by a container running the solver daemon next to the
/// docker daemon.
pub mod docker_container;
/// Driver using the docker daemon's own embedded solver.
pub mod moby;
/// Driver connecting to an already running solver endpoint.
pub mod remote;
/// Driver scheduling solver pods on a Kubernetes cluster.
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;

use crate::errors::Error;
use crate::moby::Moby;
use crate::platform::Platform;
use crate::solver::{DialStream, SolverChannel};

/// Default deadline for a bootstrap readiness wait.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval at which bootstrap polls [`Driver::info`] while waiting for
/// readiness.
pub(crate) const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Priority value meaning a factory cannot handle an endpoint at all.
pub const PRIORITY_UNSUPPORTED: u8 = 99;

/// Lifecycle state of a driver's underlying resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The resource does not exist yet.
    Inactive,
    /// The resource exists but is not ready to accept work.
    Starting,
    /// The resource is ready.
    Running,
    /// The resource exists but was stopped.
    Stopped,
    /// The resource is in a failed state.
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Inactive => "inactive",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// A node discovered at runtime by a cluster driver, such as one running
/// pod of a pod group.
#[derive(Debug, Clone)]
pub struct DynamicNode {
    /// Discovered node name, such as the pod name.
    pub name: String,
    /// Platforms advertised by the node's annotations.
    pub platforms: Vec<Platform>,
}

/// The result of [`Driver::info`].
#[derive(Debug, Clone)]
pub struct DriverInfo {
    /// Lifecycle state of the underlying resource.
    pub status: Status,
    /// Nodes discovered at runtime; empty for single-resource drivers.
    pub dynamic_nodes: Vec<DynamicNode>,
}

impl DriverInfo {
    pub(crate) fn with_status(status: Status) -> DriverInfo {
        DriverInfo {
            status,
            dynamic_nodes: Vec::new(),
        }
    }
}

/// Capabilities a driver advertises; advisory and consulted by the node
/// resolver and the build controller to reject incompatible export requests
/// early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// The node can export OCI layouts.
    OciExporter,
    /// The node can export docker tarballs.
    DockerExporter,
    /// The node can export build caches.
    CacheExport,
    /// The node can build multi-platform images.
    MultiPlatform,
    /// Build results load into the local daemon without an explicit export.
    DefaultLoad,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Feature::OciExporter => "OCI exporter",
            Feature::DockerExporter => "Docker exporter",
            Feature::CacheExport => "Cache export",
            Feature::MultiPlatform => "Multi-platform build",
            Feature::DefaultLoad => "Automatically load images to the Docker Engine image store",
        };
        f.write_str(s)
    }
}

/// Feature map returned by [`Driver::features`].
pub type Features = HashMap<Feature, bool>;

/// Configuration handed to a factory when constructing a driver for one
/// node.
#[derive(Debug, Clone, Default)]
pub struct InitConfig {
    /// Name of the underlying resource, derived from builder and node name.
    pub name: String,
    /// The node endpoint.
    pub endpoint: String,
    /// Platforms the node declares.
    pub platforms: Vec<Platform>,
    /// Extra flags for the solver daemon.
    pub flags: Vec<String>,
    /// Solver daemon configuration file to install on bootstrap.
    pub config_file: Option<PathBuf>,
    /// Driver specific options; unknown keys are rejected by the driver.
    pub driver_opts: HashMap<String, String>,
    /// Bootstrap readiness deadline.
    pub timeout: Option<Duration>,
}

impl InitConfig {
    pub(crate) fn bootstrap_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_BOOTSTRAP_TIMEOUT)
    }

    /// Parse the `timeout` driver option, shared by the bootstrapping
    /// drivers.
    pub(crate) fn parse_timeout_opt(&mut self) -> Result<(), Error> {
        if let Some(raw) = self.driver_opts.remove("timeout") {
            let seconds: u64 = raw
                .parse()
                .map_err(|_| Error::invalid(format!("invalid timeout duration {raw:?}")))?;
            self.timeout = Some(Duration::from_secs(seconds));
        }
        Ok(())
    }
}

/// A single node brought online by a driver kind.
///
/// Bootstrap is idempotent and internally single-flight: concurrent calls
/// on the same instance serialize, and a second caller observes the first
/// caller's result.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// The kind tag of the factory that built this driver.
    fn kind(&self) -> &'static str;

    /// Bring the underlying resource online and wait for readiness.
    async fn bootstrap(&self) -> Result<(), Error>;

    /// The resource's current state, plus dynamically discovered nodes for
    /// cluster drivers.
    async fn info(&self) -> Result<DriverInfo, Error>;

    /// The solver version running on the node. Requires a running node.
    async fn version(&self) -> Result<String, Error>;

    /// Stop the underlying resource. Currently a placeholder for future
    /// scale-to-zero support; drivers accept the call and do nothing.
    async fn stop(&self, force: bool) -> Result<(), Error>;

    /// Remove the underlying resource. With `rm_daemon`, the workload and
    /// any associated configuration are removed too. A resource that is
    /// already gone is not an error.
    async fn rm(&self, force: bool, rm_volume: bool, rm_daemon: bool) -> Result<(), Error>;

    /// Open a byte-stream connection to the solver on this node.
    async fn dial(&self) -> Result<DialStream, Error>;

    /// Capabilities of the solver on this node.
    async fn features(&self) -> Features;
}

/// Layer a solver channel over a driver's dial.
pub async fn client(driver: &Arc<dyn Driver>) -> Result<SolverChannel, Error> {
    SolverChannel::connect(Arc::clone(driver)).await
}

/// Constructor and metadata for one driver kind.
#[async_trait::async_trait]
pub trait Factory: Send + Sync {
    /// The kind tag, recorded in the store.
    fn name(&self) -> &'static str;

    /// One line of display-only usage text.
    fn usage(&self) -> &'static str;

    /// Preference for handling `endpoint`; lower is more preferred,
    /// [`PRIORITY_UNSUPPORTED`] rules the factory out. `api` is a daemon
    /// client for the endpoint when one could be established; kinds that
    /// build through the daemon are unsupported without it.
    fn priority(&self, endpoint: &str, api: Option<&Moby>) -> u8;

    /// Whether driver instances of this kind can be named and re-used
    /// across commands.
    fn allows_instances(&self) -> bool;

    /// Construct a driver for one node.
    async fn new_driver(&self, config: InitConfig) -> Result<Arc<dyn Driver>, Error>;
}

fn registry() -> &'static Mutex<Vec<Arc<dyn Factory>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<dyn Factory>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a driver factory. The registry is append-only; registering two
/// factories with the same name is a programming error and panics.
pub fn register(factory: Arc<dyn Factory>) {
    let mut factories = registry().lock().unwrap();
    assert!(
        factories.iter().all(|f| f.name() != factory.name()),
        "driver factory {} registered twice",
        factory.name()
    );
    factories.push(factory);
}

/// Register the built-in driver kinds. Idempotent.
pub fn register_default_factories() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register(Arc::new(moby::MobyFactory));
        register(Arc::new(docker_container::DockerContainerFactory));
        register(Arc::new(remote::RemoteFactory));
        #[cfg(feature = "kubernetes")]
        register(Arc::new(kubernetes::KubernetesFactory));
    });
}

/// All registered factories, in registration order.
pub fn factories() -> Vec<Arc<dyn Factory>> {
    registry().lock().unwrap().clone()
}

/// Look up a factory by kind tag.
pub fn factory_by_name(name: &str) -> Result<Arc<dyn Factory>, Error> {
    factories()
        .into_iter()
        .find(|f| f.name() == name)
        .ok_or_else(|| Error::not_found("driver", name))
}

/// Choose the factory for an endpoint when the user named none.
///
/// Only factories allowing instances participate. A single supported
/// factory wins outright; otherwise the smallest priority wins, with
/// registration order breaking ties. `api` is forwarded to every factory's
/// priority check.
pub fn default_factory(
    endpoint: &str,
    api: Option<&Moby>,
    factories: &[Arc<dyn Factory>],
) -> Result<Arc<dyn Factory>, Error> {
    let mut candidates: Vec<(u8, &Arc<dyn Factory>)> = factories
        .iter()
        .filter(|f| f.allows_instances())
        .map(|f| (f.priority(endpoint, api), f))
        .filter(|(p, _)| *p < PRIORITY_UNSUPPORTED)
        .collect();
    if candidates.is_empty() {
        return Err(Error::invalid(format!(
            "no driver supports endpoint {endpoint:?}"
        )));
    }
    // Stable: ties keep registration order.
    candidates.sort_by_key(|(p, _)| *p);
    Ok(Arc::clone(candidates[0].1))
}

/// Reject driver options outside the recognized key set.
pub(crate) fn reject_unknown_opts(
    opts: &HashMap<String, String>,
    driver: &'static str,
) -> Result<(), Error> {
    if let Some(key) = opts.keys().next() {
        return Err(Error::invalid(format!(
            "invalid driver option {key} for driver {driver}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFactory {
        name: &'static str,
        priority: u8,
        instances: bool,
    }

    #[async_trait::async_trait]
    impl Factory for FakeFactory {
        fn name(&self) -> &'static str {
            self.name
        }
        fn usage(&self) -> &'static str {
            ""
        }
        fn priority(&self, _endpoint: &str, _api: Option<&Moby>) -> u8 {
            self.priority
        }
        fn allows_instances(&self) -> bool {
            self.instances
        }
        async fn new_driver(&self, _config: InitConfig) -> Result<Arc<dyn Driver>, Error> {
            unimplemented!("fake factory")
        }
    }

    fn fake(name: &'static str, priority: u8, instances: bool) -> Arc<dyn Factory> {
        Arc::new(FakeFactory {
            name,
            priority,
            instances,
        })
    }

    #[test]
    fn default_factory_prefers_lowest_priority() {
        let fs = vec![fake("a", 30, true), fake("b", 20, true)];
        assert_eq!(default_factory("tcp://x", None, &fs).unwrap().name(), "b");
    }

    #[test]
    fn default_factory_breaks_ties_by_registration_order() {
        let fs = vec![fake("a", 20, true), fake("b", 20, true)];
        assert_eq!(default_factory("tcp://x", None, &fs).unwrap().name(), "a");
    }

    #[test]
    fn default_factory_skips_instanceless_and_unsupported() {
        let fs = vec![
            fake("a", 10, false),
            fake("b", PRIORITY_UNSUPPORTED, true),
            fake("c", 40, true),
        ];
        assert_eq!(default_factory("tcp://x", None, &fs).unwrap().name(), "c");
    }

    #[test]
    fn default_factory_errors_with_no_candidates() {
        let fs = vec![fake("a", PRIORITY_UNSUPPORTED, true)];
        assert!(default_factory("tcp://x", None, &fs).is_err());
    }
}
