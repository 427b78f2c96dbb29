//! Local per-build state records.
//!
//! Every build mints an opaque ref; its [`State`] is written under
//! `refs/<builder>/<node>/<ref>` so history inspection can recover the
//! context path, Dockerfile and target after the build finished. Refs that
//! belong to one user invocation are bundled into a [`StateGroup`] under the
//! reserved `__group__` builder directory.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serializer};
use serde_derive::{Deserialize as DeserializeDerive, Serialize as SerializeDerive};

use crate::config::Root;
use crate::errors::Error;

pub(crate) const REFS_DIR: &str = "refs";
const GROUP_DIR: &str = "__group__";

/// Mint an opaque ref id for one build instance.
pub fn new_ref_id() -> String {
    let mut p = [0u8; 16];
    rand::rng().fill_bytes(&mut p);
    hex::encode(p)
}

/// Per-build record keyed by `(builder, node, ref)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, SerializeDerive, DeserializeDerive)]
pub struct State {
    /// Named build target within the context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    /// Absolute path of a local context, or the remote context URL.
    pub local_path: String,
    /// Dockerfile path; absolute for local contexts, relative for remote
    /// ones.
    pub dockerfile_path: String,
    /// Identifier of the [`StateGroup`] bundling this ref, when the build
    /// was part of a multi-target invocation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_ref: String,
}

/// A bundle of refs produced by one user invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, SerializeDerive, DeserializeDerive)]
pub struct StateGroup {
    /// Opaque description of the group's source, for example the serialized
    /// bake definition that produced it.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "ser_base64",
        deserialize_with = "de_base64"
    )]
    pub definition: Vec<u8>,
    /// Target names requested by the invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    /// Free-form input descriptions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Member refs as `builder/node/ref` triples.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
}

fn ser_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
}

fn de_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(raw.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Reader/writer for per-build state under the configuration root.
///
/// Mutations within one process are serialized by an internal mutex; the
/// individual record writes are atomic, so concurrent readers never observe
/// torn records.
#[derive(Debug, Clone)]
pub struct LocalState {
    root: Root,
    mutate: Arc<Mutex<()>>,
}

impl LocalState {
    pub(crate) fn new(root: Root) -> LocalState {
        LocalState {
            root,
            mutate: Arc::new(Mutex::new(())),
        }
    }

    /// Read the state of one build ref.
    pub fn read_ref(&self, builder: &str, node: &str, id: &str) -> Result<State, Error> {
        let path = self.ref_path(builder, node, id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("ref", format!("{builder}/{node}/{id}")))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persist the state of one build ref, creating the node directory on
    /// first use.
    pub fn save_ref(&self, builder: &str, node: &str, id: &str, state: &State) -> Result<(), Error> {
        let path = self.ref_path(builder, node, id)?;
        let _guard = self.mutate.lock().unwrap();
        self.root
            .mkdir_all(format!("{REFS_DIR}/{builder}/{node}"), 0o700)?;
        let data = serde_json::to_vec(state)?;
        self.root
            .atomic_write_file(relative(&path, self.root.dir()), &data, 0o600)
    }

    /// Read a state group by id.
    pub fn read_group(&self, id: &str) -> Result<StateGroup, Error> {
        let path = self.group_path(id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("group", id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persist a state group.
    pub fn save_group(&self, id: &str, group: &StateGroup) -> Result<(), Error> {
        let path = self.group_path(id)?;
        let _guard = self.mutate.lock().unwrap();
        self.root.mkdir_all(format!("{REFS_DIR}/{GROUP_DIR}"), 0o700)?;
        let data = serde_json::to_vec(group)?;
        self.root
            .atomic_write_file(relative(&path, self.root.dir()), &data, 0o600)
    }

    /// Drop all state recorded for a builder, including group records whose
    /// refs all belonged to it.
    pub fn remove_builder(&self, builder: &str) -> Result<(), Error> {
        non_empty(builder)?;

        let builder_dir = self.root.dir().join(REFS_DIR).join(builder);
        if !builder_dir.exists() {
            return Ok(());
        }
        let nodes: Vec<String> = fs::read_dir(&builder_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        for node in nodes {
            self.remove_builder_node(builder, &node)?;
        }
        let _guard = self.mutate.lock().unwrap();
        if builder_dir.exists() {
            fs::remove_dir_all(&builder_dir)?;
        }
        Ok(())
    }

    /// Drop all state recorded for one node, pruning its refs out of any
    /// state groups. A group whose refs are all being removed is removed
    /// with them.
    pub fn remove_builder_node(&self, builder: &str, node: &str) -> Result<(), Error> {
        non_empty(builder)?;
        non_empty(node)?;

        let node_dir = self.root.dir().join(REFS_DIR).join(builder).join(node);
        if !node_dir.exists() {
            return Ok(());
        }

        let _guard = self.mutate.lock().unwrap();
        let mut removed: HashSet<String> = HashSet::new();
        let mut groups: HashSet<String> = HashSet::new();
        for entry in fs::read_dir(&node_dir)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Ok(data) = fs::read(entry.path()) {
                if let Ok(state) = serde_json::from_slice::<State>(&data) {
                    if !state.group_ref.is_empty() {
                        groups.insert(state.group_ref);
                    }
                }
            }
            removed.insert(format!("{builder}/{node}/{id}"));
        }

        for group_id in groups {
            let path = self.group_path(&group_id)?;
            let group = match fs::read(&path) {
                Ok(data) => match serde_json::from_slice::<StateGroup>(&data) {
                    Ok(group) => group,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            let remaining: Vec<String> = group
                .refs
                .iter()
                .filter(|r| !removed.contains(*r))
                .cloned()
                .collect();
            if remaining.is_empty() {
                debug!("removing emptied state group {group_id}");
                fs::remove_file(&path)?;
            } else if remaining.len() != group.refs.len() {
                let pruned = StateGroup {
                    refs: remaining,
                    ..group
                };
                let data = serde_json::to_vec(&pruned)?;
                self.root
                    .atomic_write_file(relative(&path, self.root.dir()), &data, 0o600)?;
            }
        }

        fs::remove_dir_all(&node_dir)?;
        Ok(())
    }

    fn ref_path(&self, builder: &str, node: &str, id: &str) -> Result<PathBuf, Error> {
        non_empty(builder)?;
        non_empty(node)?;
        non_empty(id)?;
        Ok(self
            .root
            .dir()
            .join(REFS_DIR)
            .join(builder)
            .join(node)
            .join(id))
    }

    fn group_path(&self, id: &str) -> Result<PathBuf, Error> {
        non_empty(id)?;
        Ok(self.root.dir().join(REFS_DIR).join(GROUP_DIR).join(id))
    }
}

fn non_empty(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid("name empty"));
    }
    Ok(())
}

fn relative(path: &std::path::Path, root: &std::path::Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}
