#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]
//! # Capstan: an asynchronous multi-node container image build orchestrator
//!
//! Capstan is the core of a build orchestrator: users declare named
//! *builders* made of one or more *nodes*, each brought online by a
//! *driver* (a container next to the docker daemon, the daemon's own
//! embedded solver, a remote endpoint, or a pod group on a cluster), and
//! run builds that may target several CPU architectures at once. The crate
//! persists builder configuration, picks the right nodes per platform,
//! serializes builds per session, and keeps the last build result alive so
//! processes can be launched against it afterwards, including an
//! interactive breakpoint-driven walk over the build graph.
//!
//! The build execution engine itself is external: drivers hand out byte
//! streams ([`solver::DialStream`]) and the [`solver::Solver`] trait keeps
//! its wire protocol opaque.
//!
//! # Install
//!
//! Add the following to your `Cargo.toml` file
//!
//! ```nocompile
//! [dependencies]
//! capstan = "0.1"
//! ```
//!
//! # Usage
//!
//! ## Creating a builder
//!
//! Builders live in a file-locked store below the configuration root. All
//! mutations happen inside a transaction.
//!
//! ```rust,no_run
//! use capstan::config::Root;
//! use capstan::store::{Node, NodeGroup, Store};
//!
//! # fn main() -> Result<(), capstan::errors::Error> {
//! let store = Store::new(Root::from_env()?)?;
//! let txn = store.txn()?;
//!
//! let mut group = NodeGroup::new("mybuilder", "docker-container")?;
//! group.append(Node {
//!     name: String::new(), // auto-named mybuilder0
//!     endpoint: String::from("unix:///var/run/docker.sock"),
//!     platforms: vec![],
//!     flags: vec![],
//!     config_file: None,
//!     driver_opts: Default::default(),
//! })?;
//! txn.save(&mut group)?;
//! txn.set_current("scopeA", "mybuilder", false, true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Booting drivers and resolving platforms
//!
//! ```rust,no_run
//! use capstan::builder::Builder;
//! use capstan::platform::{Matcher, Platform};
//!
//! # async fn run(group: capstan::store::NodeGroup) -> Result<(), capstan::errors::Error> {
//! capstan::driver::register_default_factories();
//!
//! let builder = Builder::from_group(group).await?;
//! builder.boot().await?;
//!
//! let requested = Platform::parse_list("linux/amd64,linux/arm64")?;
//! let resolution = builder.resolve(&requested, Matcher::Only).await?;
//! for selection in &resolution.selections {
//!     println!("{} builds {:?}", selection.node, selection.platforms);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Running a build
//!
//! The controller runs at most one build at a time and retains the result
//! handle of the last build, successful or not, for post-mortem process
//! execution.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use capstan::build::BuildOptions;
//! use capstan::controller::BuildController;
//!
//! # async fn run(solver: Arc<dyn capstan::solver::Solver>) -> Result<(), capstan::errors::Error> {
//! let controller = BuildController::new(solver);
//! let (status_tx, mut status_rx) =
//!     tokio::sync::mpsc::channel::<capstan::solver::SolveStatus>(64);
//!
//! tokio::spawn(async move {
//!     while let Some(status) = status_rx.recv().await {
//!         for vertex in status.vertexes {
//!             println!("{} cached={}", vertex.name, vertex.cached);
//!         }
//!     }
//! });
//!
//! let options = BuildOptions {
//!     context_path: String::from("."),
//!     ..Default::default()
//! };
//! let (response, _dockerfiles) = controller.build(options, None, status_tx).await?;
//! println!("built ref {}", response.ref_id);
//! # Ok(())
//! # }
//! ```

/// Build options and build-input normalization.
pub mod build;
/// Builder materialization: store records to booted drivers.
pub mod builder;
/// The process-wide configuration root.
pub mod config;
/// The build controller and process manager.
pub mod controller;
/// The message-driven debug adapter.
pub mod dap;
/// Driver lifecycle, capability model and registry.
pub mod driver;
/// Crate-wide error types.
pub mod errors;
/// Slim docker daemon API client used by the local drivers.
pub mod moby;
/// Platform triples and matchers.
pub mod platform;
/// Platform-aware node resolution.
pub mod resolver;
/// The opaque solver contract and dial transports.
pub mod solver;
/// The persistent builder store and per-build local state.
pub mod store;
/// The breakpoint-driven build-graph walker.
pub mod walker;

pub use builder::Builder;
pub use config::Root;
pub use controller::BuildController;
pub use errors::Error;
pub use store::{Node, NodeGroup, Store};
