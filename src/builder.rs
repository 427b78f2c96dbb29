//! Glue between the store and the drivers: a [`Builder`] materializes the
//! driver instance behind every node of a [`NodeGroup`], boots them, and
//! feeds the node resolver.

use std::sync::Arc;

use futures_util::future::join_all;
use log::debug;

use crate::driver::{self, Driver, DriverInfo, InitConfig};
use crate::errors::Error;
use crate::platform::{Matcher, Platform};
use crate::resolver::{self, Resolution, ResolverNode};
use crate::store::{Node, NodeGroup};

/// One node of a builder with its driver instance attached.
pub struct BuilderNode {
    /// The stored node record.
    pub node: Node,
    /// The driver brought up for it.
    pub driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for BuilderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderNode")
            .field("node", &self.node.name)
            .field("driver", &self.driver.kind())
            .finish()
    }
}

/// A builder instance ready to run builds: the persistent group plus one
/// driver per node.
#[derive(Debug)]
pub struct Builder {
    group: NodeGroup,
    nodes: Vec<BuilderNode>,
}

impl Builder {
    /// Materialize drivers for every node of `group` using the registered
    /// factory for its driver kind.
    pub async fn from_group(group: NodeGroup) -> Result<Builder, Error> {
        let factory = driver::factory_by_name(&group.driver)?;
        let mut nodes = Vec::with_capacity(group.nodes.len());
        for node in &group.nodes {
            let config = InitConfig {
                name: format!("{}-{}", group.name, node.name),
                endpoint: node.endpoint.clone(),
                platforms: node.platforms.clone(),
                flags: node.flags.clone(),
                config_file: node.config_file.clone(),
                driver_opts: node.driver_opts.clone(),
                timeout: None,
            };
            let driver = factory.new_driver(config).await?;
            nodes.push(BuilderNode {
                node: node.clone(),
                driver,
            });
        }
        Ok(Builder { group, nodes })
    }

    /// The builder's name.
    pub fn name(&self) -> &str {
        &self.group.name
    }

    /// The stored group backing this builder.
    pub fn group(&self) -> &NodeGroup {
        &self.group
    }

    /// The nodes with their drivers.
    pub fn nodes(&self) -> &[BuilderNode] {
        &self.nodes
    }

    /// Bootstrap every node in parallel, failing with the first error.
    pub async fn boot(&self) -> Result<(), Error> {
        debug!("booting {} node(s) of {}", self.nodes.len(), self.group.name);
        let results = join_all(self.nodes.iter().map(|n| n.driver.bootstrap())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Query every node's driver info in node order.
    pub async fn infos(&self) -> Result<Vec<DriverInfo>, Error> {
        let results = join_all(self.nodes.iter().map(|n| n.driver.info())).await;
        results.into_iter().collect()
    }

    /// Resolve the requested platforms onto this builder's nodes.
    ///
    /// Platforms discovered at runtime by cluster drivers extend each
    /// node's declared set.
    pub async fn resolve(
        &self,
        requested: &[Platform],
        matcher: Matcher,
    ) -> Result<Resolution, Error> {
        let infos = self.infos().await?;
        let resolver_nodes: Vec<ResolverNode> = self
            .nodes
            .iter()
            .map(|n| ResolverNode {
                name: n.node.name.clone(),
                platforms: n.node.platforms.clone(),
            })
            .collect();
        let additional = |index: usize, _node: &ResolverNode| -> Vec<Platform> {
            infos
                .get(index)
                .map(|info| {
                    info.dynamic_nodes
                        .iter()
                        .flat_map(|d| d.platforms.iter().cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        resolver::resolve(&resolver_nodes, requested, matcher, Some(&additional))
    }
}
