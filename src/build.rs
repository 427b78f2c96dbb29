//! Build options handed to the controller, and normalization of the build
//! inputs they reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::Error;
use crate::platform::Platform;
use crate::solver::SolveRequest;
use crate::store::state::new_ref_id;

/// Prefix selecting an OCI layout directory as the build context.
pub const OCI_LAYOUT_PREFIX: &str = "oci-layout://";

/// An export destination for the build result.
#[derive(Debug, Clone, Default)]
pub struct ExportEntry {
    /// Exporter kind: `oci`, `docker`, `image`, `local`.
    pub kind: String,
    /// Exporter attributes, such as `dest` or `name`.
    pub attrs: HashMap<String, String>,
}

/// Options for one build invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build context: local path, URL, `-`, or an `oci-layout://` ref.
    pub context_path: String,
    /// Dockerfile path; resolved relative to the context when relative.
    pub dockerfile_name: Option<String>,
    /// Named build stage to stop at.
    pub target: Option<String>,
    /// Platforms to build for.
    pub platforms: Vec<Platform>,
    /// Build arguments.
    pub build_args: HashMap<String, String>,
    /// Image labels.
    pub labels: HashMap<String, String>,
    /// Additional named contexts.
    pub named_contexts: HashMap<String, String>,
    /// Export destinations.
    pub exports: Vec<ExportEntry>,
    /// Cache export destinations.
    pub cache_to: Vec<String>,
    /// Cache import sources.
    pub cache_from: Vec<String>,
    /// Disable build cache.
    pub no_cache: bool,
    /// Always attempt to pull newer base images.
    pub pull: bool,
}

impl BuildOptions {
    /// Normalize the context path in place and derive a [`SolveRequest`]
    /// with a freshly minted ref.
    pub fn to_solve_request(&mut self) -> Result<SolveRequest, Error> {
        self.context_path = normalize_build_input(&self.context_path)?;

        let mut frontend_attrs = HashMap::new();
        if let Some(dockerfile) = &self.dockerfile_name {
            frontend_attrs.insert(String::from("filename"), dockerfile.clone());
        }
        if let Some(target) = &self.target {
            frontend_attrs.insert(String::from("target"), target.clone());
        }
        for (key, value) in &self.build_args {
            frontend_attrs.insert(format!("build-arg:{key}"), value.clone());
        }
        for (key, value) in &self.labels {
            frontend_attrs.insert(format!("label:{key}"), value.clone());
        }
        for (name, value) in &self.named_contexts {
            frontend_attrs.insert(format!("context:{name}"), value.clone());
        }
        if self.no_cache {
            frontend_attrs.insert(String::from("no-cache"), String::new());
        }
        if self.pull {
            frontend_attrs.insert(String::from("image-resolve-mode"), String::from("pull"));
        }
        if !self.platforms.is_empty() {
            frontend_attrs.insert(
                String::from("platform"),
                crate::platform::format_list(&self.platforms),
            );
        }

        let (exporter, exporter_attrs) = match self.exports.first() {
            Some(entry) => (Some(entry.kind.clone()), entry.attrs.clone()),
            None => (None, HashMap::new()),
        };

        Ok(SolveRequest {
            ref_id: new_ref_id(),
            frontend: String::from("dockerfile.v0"),
            frontend_attrs,
            platforms: self.platforms.iter().map(ToString::to_string).collect(),
            exporter,
            exporter_attrs,
            cache_to: self.cache_to.clone(),
            cache_from: self.cache_from.clone(),
            evaluate: true,
        })
    }
}

/// Normalize a build context input.
///
/// `"."` and relative paths become absolute; `"-"` (stdin), URLs and git
/// refs pass through unchanged; `oci-layout://` refs have their path
/// component expanded.
pub fn normalize_build_input(input: &str) -> Result<String, Error> {
    if input == "-" || is_remote_input(input) {
        return Ok(input.to_string());
    }
    if let Some(layout_path) = input.strip_prefix(OCI_LAYOUT_PREFIX) {
        let abs = absolute_path(layout_path)?;
        return Ok(format!("{OCI_LAYOUT_PREFIX}{}", abs.display()));
    }
    Ok(absolute_path(input)?.display().to_string())
}

/// Whether a context input refers to a remote location rather than the
/// local filesystem.
pub fn is_remote_input(input: &str) -> bool {
    if input.starts_with("http://")
        || input.starts_with("https://")
        || input.starts_with("git://")
        || input.starts_with("git@")
        || input.starts_with("ssh://")
    {
        return true;
    }
    // Host-prefixed git shorthand: github.com/user/repo.git#branch
    input
        .split_once('/')
        .map(|(host, _)| host.contains('.') && input.contains(".git"))
        .unwrap_or(false)
}

fn absolute_path(input: &str) -> Result<PathBuf, Error> {
    let path = Path::new(input);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::path::absolute(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_becomes_working_directory() {
        let normalized = normalize_build_input(".").unwrap();
        assert_eq!(
            normalized,
            std::env::current_dir().unwrap().display().to_string()
        );
    }

    #[test]
    fn stdin_marker_is_untouched() {
        assert_eq!(normalize_build_input("-").unwrap(), "-");
    }

    #[test]
    fn urls_and_git_refs_pass_through() {
        for input in [
            "https://example.com/ctx.tar.gz",
            "git://example.com/repo",
            "git@example.com:user/repo.git",
            "github.com/user/repo.git#main",
        ] {
            assert_eq!(normalize_build_input(input).unwrap(), input);
        }
    }

    #[test]
    fn oci_layout_paths_are_expanded() {
        let normalized = normalize_build_input("oci-layout://store").unwrap();
        let expected = format!(
            "oci-layout://{}",
            std::env::current_dir().unwrap().join("store").display()
        );
        assert_eq!(normalized, expected);
    }

    #[test]
    fn solve_request_carries_frontend_attrs() {
        let mut opts = BuildOptions {
            context_path: String::from("."),
            dockerfile_name: Some(String::from("Dockerfile.release")),
            target: Some(String::from("app")),
            build_args: HashMap::from([(String::from("V"), String::from("1"))]),
            platforms: Platform::parse_list("linux/amd64").unwrap(),
            ..Default::default()
        };
        let req = opts.to_solve_request().unwrap();
        assert_eq!(req.frontend, "dockerfile.v0");
        assert_eq!(
            req.frontend_attrs.get("filename").map(String::as_str),
            Some("Dockerfile.release")
        );
        assert_eq!(
            req.frontend_attrs.get("target").map(String::as_str),
            Some("app")
        );
        assert_eq!(
            req.frontend_attrs.get("build-arg:V").map(String::as_str),
            Some("1")
        );
        assert_eq!(req.platforms, vec![String::from("linux/amd64")]);
        assert_eq!(req.ref_id.len(), 32);
    }
}
