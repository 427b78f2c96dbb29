//! Hand-written models for the slice of the daemon API the drivers use.
//!
//! Field sets are intentionally partial; unknown fields in responses are
//! ignored on deserialization.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

/// Response payload of `/version`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    /// Daemon version string.
    pub version: Option<String>,
    /// Highest API version the daemon supports.
    pub api_version: Option<String>,
    /// Operating system the daemon runs on.
    pub os: Option<String>,
    /// CPU architecture the daemon runs on.
    pub arch: Option<String>,
}

/// Response payload of `/info`, reduced to the fields bootstrap consults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    /// Daemon host name.
    pub name: Option<String>,
    /// Total number of containers.
    pub containers: Option<i64>,
    /// The driver the daemon uses for control groups.
    pub cgroup_driver: Option<String>,
    /// Security options applied to the daemon, such as `userns`.
    pub security_options: Option<Vec<String>>,
    /// Operating system kind, `linux` or `windows`.
    #[serde(rename = "OSType")]
    pub os_type: Option<String>,
    /// CPU architecture reported by the daemon.
    pub architecture: Option<String>,
}

/// The `State` block of a container inspect response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Whether the container is currently running.
    pub running: Option<bool>,
    /// Lifecycle status string: `created`, `running`, `exited`, …
    pub status: Option<String>,
    /// Exit code of the last run, when stopped.
    pub exit_code: Option<i64>,
}

/// Response payload of `/containers/<id>/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspectResponse {
    /// Container id.
    pub id: Option<String>,
    /// Container name, with the leading slash the daemon adds.
    pub name: Option<String>,
    /// Runtime state.
    pub state: Option<ContainerState>,
}

/// A mount entry in a container's host configuration.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    /// Mount kind: `volume`, `bind` or `tmpfs`.
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Volume name or host path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Mount point inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Host-level configuration of a container create request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// Run with extended privileges; the solver daemon requires this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// Run an init process as PID 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    /// Network mode, for example `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Parent cgroup for the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_parent: Option<String>,
    /// User namespace mode, for example `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userns_mode: Option<String>,
    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    /// CPUs in which to allow execution, for example `0-3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,
    /// Mounts attached to the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,
    /// Always restart the container on daemon restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

/// Restart policy of a container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    /// Policy name, for example `unless-stopped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Body of a container create request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateBody {
    /// Image reference to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Environment entries, `KEY=value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Command arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Container labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    /// Host-level configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

/// Response payload of a container create request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    /// Id of the created container.
    pub id: String,
    /// Warnings emitted during creation; the daemon may send null.
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Body of an exec create request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    /// Attach to stdin of the exec command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_stdin: Option<bool>,
    /// Attach to stdout of the exec command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_stdout: Option<bool>,
    /// Attach to stderr of the exec command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_stderr: Option<bool>,
    /// Allocate a pseudo terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    /// Environment entries, `KEY=value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Command to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// User to run the command as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Working directory inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Run with extended privileges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
}

/// Response payload of an exec create request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateResponse {
    /// Id of the created exec instance.
    pub id: String,
}

/// Response payload of an exec inspect request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspectResponse {
    /// Whether the exec process is still running.
    pub running: Option<bool>,
    /// Exit code once the process stopped.
    pub exit_code: Option<i64>,
    /// Id of the container hosting the exec instance.
    #[serde(rename = "ContainerID")]
    pub container_id: Option<String>,
}

/// One progress record of an image pull stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateImageInfo {
    /// Progress status line.
    pub status: Option<String>,
    /// Error reported mid-stream, if the pull failed.
    pub error: Option<String>,
}

/// Error body the daemon sends with failing status codes.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerErrorMessage {
    pub(crate) message: String,
}
