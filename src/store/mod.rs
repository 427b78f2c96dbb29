//! The persistent builder store.
//!
//! A *builder* is a named [`NodeGroup`]: one or more [`Node`]s sharing a
//! driver kind. Groups are serialized as JSON under the configuration root
//! and every mutation happens inside a [`Txn`], which holds an exclusive
//! file lock so concurrent processes see a consistent view.
//!
//! On-disk layout, all below [`crate::config::Root`]:
//!
//! ```text
//! ./instances/<name>    JSON-encoded NodeGroup
//! ./activity/<name>     RFC3339 UTC last-activity timestamp
//! ./defaults/<20-hex>   builder name for a per-scope default
//! ./current             JSON {Key, Name, Global}
//! ./refs/...            per-build local state, see [`state`]
//! ./.lock               file-lock cookie
//! ```

pub mod state;

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Root;
use crate::errors::Error;
use crate::platform::Platform;
use state::LocalState;

const INSTANCES_DIR: &str = "instances";
const ACTIVITY_DIR: &str = "activity";
const DEFAULTS_DIR: &str = "defaults";
const CURRENT_FILE: &str = "current";
const LOCK_FILE: &str = ".lock";

/// The builder name reserved for the daemon's own builtin builder; it can
/// never name a stored group.
pub const RESERVED_DEFAULT: &str = "default";

/// Validate a builder or node identifier.
///
/// Identifiers are non-empty, start with an ASCII alphanumeric and continue
/// with alphanumerics, `.`, `_` or `-`. The literal `default` is reserved.
/// Validation runs before any filesystem access.
pub fn validate_name(name: &str) -> Result<&str, Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        _ => false,
    };
    if !valid {
        return Err(Error::invalid(format!("invalid name {name:?}")));
    }
    if name == RESERVED_DEFAULT {
        return Err(Error::invalid(format!("{name:?} is a reserved name")));
    }
    Ok(name)
}

/// A single execution endpoint inside a [`NodeGroup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name, unique within its group.
    pub name: String,
    /// Opaque address: URL, socket path, or context name, depending on the
    /// driver kind.
    pub endpoint: String,
    /// Platforms this node is declared to build for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Platform>,
    /// Extra flags handed to the solver daemon on bootstrap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Solver daemon configuration file copied into the node on bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Driver specific key/value options; the recognized key set belongs to
    /// the driver.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub driver_opts: HashMap<String, String>,
}

/// The persistent unit of a builder: a named, driver-homogeneous list of
/// nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Builder name; unique across the store.
    pub name: String,
    /// Driver kind tag, immutable once the group exists.
    pub driver: String,
    /// Ordered node list; order is meaningful for resolver tie-breaks.
    pub nodes: Vec<Node>,
    /// Refreshed on every save; persisted beside the instance record.
    #[serde(skip)]
    pub last_activity: Option<DateTime<Utc>>,
}

impl NodeGroup {
    /// A new, empty group. It only becomes valid once a node is appended.
    pub fn new(name: &str, driver: &str) -> Result<NodeGroup, Error> {
        validate_name(name)?;
        Ok(NodeGroup {
            name: name.to_string(),
            driver: driver.to_string(),
            nodes: Vec::new(),
            last_activity: None,
        })
    }

    /// Next free auto-generated node name: `<group>0`, `<group>1`, …,
    /// skipping names already taken.
    pub fn next_node_name(&self) -> String {
        let mut i = 0usize;
        loop {
            let candidate = format!("{}{}", self.name, i);
            if self.node(&candidate).is_none() {
                return candidate;
            }
            i += 1;
        }
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Append a node, auto-naming it when `node.name` is empty.
    pub fn append(&mut self, mut node: Node) -> Result<(), Error> {
        if node.name.is_empty() {
            node.name = self.next_node_name();
        } else {
            validate_name(&node.name)?;
        }
        if self.node(&node.name).is_some() {
            return Err(Error::conflict(format!(
                "node {} already exists in builder {}",
                node.name, self.name
            )));
        }
        if self.nodes.iter().any(|n| n.endpoint == node.endpoint) {
            return Err(Error::conflict(format!(
                "invalid duplicate endpoint {}",
                node.endpoint
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Replace the configuration of the node called `name`, keeping its
    /// position. The endpoint must stay unique within the group.
    pub fn update(&mut self, name: &str, node: Node) -> Result<(), Error> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| Error::not_found("node", name))?;
        if self
            .nodes
            .iter()
            .enumerate()
            .any(|(i, n)| i != idx && n.endpoint == node.endpoint)
        {
            return Err(Error::conflict(format!(
                "invalid duplicate endpoint {}",
                node.endpoint
            )));
        }
        let mut node = node;
        node.name = name.to_string();
        self.nodes[idx] = node;
        Ok(())
    }

    /// Remove the node called `name`. Removing the last node of a group is
    /// refused; remove the group instead.
    pub fn leave(&mut self, name: &str) -> Result<(), Error> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| Error::not_found("node", name))?;
        if self.nodes.len() == 1 {
            return Err(Error::conflict(format!(
                "cannot leave last node {}, rm the builder instead",
                name
            )));
        }
        self.nodes.remove(idx);
        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        validate_name(&self.name)?;
        if self.nodes.is_empty() {
            return Err(Error::invalid(format!(
                "builder {} has no nodes",
                self.name
            )));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            validate_name(&node.name)?;
            if self.nodes[..i].iter().any(|n| n.endpoint == node.endpoint) {
                return Err(Error::conflict(format!(
                    "invalid duplicate endpoint {}",
                    node.endpoint
                )));
            }
        }
        Ok(())
    }
}

/// The persisted current-builder selection, the JSON shape of `./current`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CurrentRecord {
    /// Scope key of the selection, typically the endpoint of the ambient
    /// context.
    #[serde(rename = "Key")]
    key: String,
    /// Selected builder name; empty means no selection.
    #[serde(rename = "Name")]
    name: String,
    /// Whether the selection applies to every scope.
    #[serde(rename = "Global")]
    global: bool,
}

/// Store of builder instances below a configuration root.
#[derive(Debug, Clone)]
pub struct Store {
    root: Root,
}

impl Store {
    /// Open the store, creating its directory skeleton.
    pub fn new(root: Root) -> Result<Store, Error> {
        root.mkdir_all(INSTANCES_DIR, 0o700)?;
        root.mkdir_all(ACTIVITY_DIR, 0o700)?;
        root.mkdir_all(DEFAULTS_DIR, 0o700)?;
        root.mkdir_all(state::REFS_DIR, 0o700)?;
        Ok(Store { root })
    }

    /// Begin a transaction, taking the exclusive store lock. The lock is
    /// held until the returned [`Txn`] is dropped; other transactions, in
    /// this or any other process, block until then.
    pub fn txn(&self) -> Result<Txn<'_>, Error> {
        let lock = self.root.open_lock_file(LOCK_FILE)?;
        lock.lock_exclusive()?;
        debug!("store lock acquired");
        Ok(Txn { store: self, lock })
    }

    /// Local per-build state bookkeeping sharing this store's root.
    pub fn local_state(&self) -> LocalState {
        LocalState::new(self.root.clone())
    }

    fn instance_path(&self, name: &str) -> PathBuf {
        self.root.dir().join(INSTANCES_DIR).join(name)
    }

    fn activity_path(&self, name: &str) -> PathBuf {
        self.root.dir().join(ACTIVITY_DIR).join(name)
    }
}

/// An exclusive view of the store. All reads and writes of builder records
/// go through a transaction.
#[derive(Debug)]
pub struct Txn<'a> {
    store: &'a Store,
    lock: File,
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.lock) {
            warn!("failed to release store lock: {e}");
        }
        debug!("store lock released");
    }
}

impl Txn<'_> {
    /// All groups, sorted by name. Records that fail to parse are deleted
    /// and skipped rather than failing the listing.
    pub fn list(&self) -> Result<Vec<NodeGroup>, Error> {
        let dir = self.store.root.dir().join(INSTANCES_DIR);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.load(&name) {
                Ok(ng) => out.push(ng),
                Err(Error::CorruptRecordError { path, source }) => {
                    warn!("removing corrupt instance record {}: {source}", path.display());
                    let _ = fs::remove_file(path);
                }
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Fetch one group by name, with `last_activity` populated.
    pub fn node_group_by_name(&self, name: &str) -> Result<NodeGroup, Error> {
        validate_name(name)?;
        self.load(name)
    }

    /// Validate and persist a group, refreshing its last-activity stamp.
    /// The driver kind of an existing group may not change.
    pub fn save(&self, ng: &mut NodeGroup) -> Result<(), Error> {
        ng.validate()?;
        match self.load(&ng.name) {
            Ok(existing) if existing.driver != ng.driver => {
                return Err(Error::conflict(format!(
                    "builder {} uses driver {}, the driver of an existing builder cannot be changed",
                    ng.name, existing.driver
                )));
            }
            _ => {}
        }
        let data = serde_json::to_vec(ng)?;
        self.store
            .root
            .atomic_write_file(format!("{INSTANCES_DIR}/{}", ng.name), &data, 0o600)?;

        let now = Utc::now();
        self.store.root.atomic_write_file(
            format!("{ACTIVITY_DIR}/{}", ng.name),
            now.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes(),
            0o600,
        )?;
        ng.last_activity = Some(now);
        Ok(())
    }

    /// Delete a group, its activity stamp, and any per-build state recorded
    /// for it.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let path = self.store.instance_path(name);
        if !path.exists() {
            return Err(Error::not_found("builder", name));
        }
        fs::remove_file(path)?;
        let _ = fs::remove_file(self.store.activity_path(name));
        self.store.local_state().remove_builder(name)?;
        Ok(())
    }

    /// Record `name` as the current builder for `scope_key`. With `global`
    /// the selection applies to every scope. With `default_for_scope` the
    /// selection is additionally remembered as the scope's fallback, keyed
    /// by a truncated digest of the scope key, and survives later
    /// re-selections.
    pub fn set_current(
        &self,
        scope_key: &str,
        name: &str,
        global: bool,
        default_for_scope: bool,
    ) -> Result<(), Error> {
        if !name.is_empty() {
            validate_name(name)?;
        }
        let record = CurrentRecord {
            key: if global { String::new() } else { scope_key.to_string() },
            name: name.to_string(),
            global,
        };
        self.write_current(&record)?;

        if default_for_scope && !global {
            self.store.root.atomic_write_file(
                format!("{DEFAULTS_DIR}/{}", scope_digest(scope_key)),
                name.as_bytes(),
                0o600,
            )?;
        }
        Ok(())
    }

    /// Resolve the current builder for `scope_key`.
    ///
    /// Resolution order: a global selection wins; then a selection recorded
    /// for this exact scope; then the scope's persisted default, which is
    /// re-promoted to the current selection. A stale selection naming a
    /// removed builder resets to none.
    pub fn current(&self, scope_key: &str) -> Result<Option<NodeGroup>, Error> {
        let record = self.read_current();

        if !record.name.is_empty() && (record.global || record.key == scope_key) {
            match self.load(&record.name) {
                Ok(ng) => return Ok(Some(ng)),
                Err(e) if e.is_not_found() => {
                    self.write_current(&CurrentRecord::default())?;
                }
                Err(e) => return Err(e),
            }
        }

        let default_path = self
            .store
            .root
            .dir()
            .join(DEFAULTS_DIR)
            .join(scope_digest(scope_key));
        if let Ok(name) = fs::read_to_string(&default_path) {
            let name = name.trim();
            if let Ok(ng) = self.load(name) {
                self.set_current(scope_key, name, false, false)?;
                return Ok(Some(ng));
            }
        }

        if !record.name.is_empty() {
            self.write_current(&CurrentRecord::default())?;
        }
        Ok(None)
    }

    fn read_current(&self) -> CurrentRecord {
        let path = self.store.root.dir().join(CURRENT_FILE);
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(record) => record,
                Err(e) => {
                    // A corrupt pointer must not poison subsequent reads.
                    warn!("resetting corrupt current record: {e}");
                    CurrentRecord::default()
                }
            },
            Err(_) => CurrentRecord::default(),
        }
    }

    fn write_current(&self, record: &CurrentRecord) -> Result<(), Error> {
        let data = serde_json::to_vec(record)?;
        self.store.root.atomic_write_file(CURRENT_FILE, &data, 0o600)
    }

    fn load(&self, name: &str) -> Result<NodeGroup, Error> {
        let path = self.store.instance_path(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("builder", name))
            }
            Err(e) => return Err(e.into()),
        };
        let mut ng: NodeGroup = serde_json::from_slice(&data)
            .map_err(|source| Error::CorruptRecordError { path, source })?;
        ng.last_activity = self.read_activity(name);
        Ok(ng)
    }

    fn read_activity(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(self.store.activity_path(name)).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Defaults are keyed by the first twenty hex characters of the scope key's
/// SHA-256.
fn scope_digest(scope_key: &str) -> String {
    let digest = Sha256::digest(scope_key.as_bytes());
    hex::encode(digest)[..20].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("mybuilder").is_ok());
        assert!(validate_name("b0.x_y-z").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name(".dot").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("default").is_err());
    }

    #[test]
    fn auto_names_skip_taken_slots() {
        let mut ng = NodeGroup::new("b", "docker-container").unwrap();
        ng.append(Node {
            name: "b0".into(),
            endpoint: "tcp://a".into(),
            platforms: vec![],
            flags: vec![],
            config_file: None,
            driver_opts: HashMap::new(),
        })
        .unwrap();
        assert_eq!(ng.next_node_name(), "b1");

        ng.append(Node {
            name: String::new(),
            endpoint: "tcp://b".into(),
            platforms: vec![],
            flags: vec![],
            config_file: None,
            driver_opts: HashMap::new(),
        })
        .unwrap();
        assert_eq!(ng.nodes[1].name, "b1");
    }

    #[test]
    fn duplicate_endpoints_conflict() {
        let mut ng = NodeGroup::new("b", "docker-container").unwrap();
        for (name, ep) in [("b0", "tcp://a"), ("b1", "tcp://b")] {
            ng.append(Node {
                name: name.into(),
                endpoint: ep.into(),
                platforms: vec![],
                flags: vec![],
                config_file: None,
                driver_opts: HashMap::new(),
            })
            .unwrap();
        }
        let err = ng
            .append(Node {
                name: "b2".into(),
                endpoint: "tcp://a".into(),
                platforms: vec![],
                flags: vec![],
                config_file: None,
                driver_opts: HashMap::new(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid duplicate endpoint tcp://a");
    }

    #[test]
    fn leave_refuses_last_node() {
        let mut ng = NodeGroup::new("b", "remote").unwrap();
        ng.append(Node {
            name: "b0".into(),
            endpoint: "tcp://a".into(),
            platforms: vec![],
            flags: vec![],
            config_file: None,
            driver_opts: HashMap::new(),
        })
        .unwrap();
        assert!(ng.leave("b0").is_err());
    }
}
