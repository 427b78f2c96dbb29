//! The process-wide configuration root.
//!
//! Every piece of persistent state owned by this crate lives under a single
//! directory, resolved once at startup. All writes beneath the root go
//! through [`Root::atomic_write_file`] so that concurrent readers observe
//! either the previous or the new content of a record, never a torn mix.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::Error;

/// Environment variable overriding the default configuration directory.
pub const ROOT_ENV: &str = "CAPSTAN_ROOT";

const DEFAULT_DIR: &str = ".capstan";

/// The configuration root directory.
///
/// Cloning is cheap; all clones refer to the same on-disk location.
#[derive(Debug, Clone)]
pub struct Root {
    dir: PathBuf,
}

impl Root {
    /// Open the configuration root at an explicit directory, creating it if
    /// missing.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Root, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Root { dir })
    }

    /// Resolve the configuration root from `CAPSTAN_ROOT`, falling back to
    /// `$HOME/.capstan`.
    pub fn from_env() -> Result<Root, Error> {
        if let Some(dir) = std::env::var_os(ROOT_ENV) {
            return Root::new(PathBuf::from(dir));
        }
        let home = home::home_dir()
            .ok_or_else(|| Error::invalid("unable to determine a home directory"))?;
        Root::new(home.join(DEFAULT_DIR))
    }

    /// The root directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a directory (and any missing parents) below the root, returning
    /// its absolute path.
    pub fn mkdir_all<P: AsRef<Path>>(&self, rel: P, mode: u32) -> Result<PathBuf, Error> {
        let path = self.dir.join(rel);
        fs::create_dir_all(&path)?;
        set_mode(&path, mode)?;
        Ok(path)
    }

    /// Write `data` to a file below the root so the update becomes observable
    /// as a single rename.
    ///
    /// The payload is staged in a temporary file in the target's directory,
    /// synced, renamed over the destination, and the directory itself is
    /// synced so the rename survives a crash.
    pub fn atomic_write_file<P: AsRef<Path>>(
        &self,
        rel: P,
        data: &[u8],
        mode: u32,
    ) -> Result<(), Error> {
        let path = self.dir.join(rel);
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid(format!("no parent directory for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        set_mode(tmp.path(), mode)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        // Readers race with the rename, not with partial content; the
        // directory fsync pins the rename itself.
        File::open(parent)?.sync_all()?;
        Ok(())
    }

    /// Open a file below the root for locking, creating it if missing.
    pub(crate) fn open_lock_file<P: AsRef<Path>>(&self, rel: P) -> Result<File, Error> {
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Root::new(tmp.path()).unwrap();

        root.atomic_write_file("instances/alpha", b"one", 0o600)
            .unwrap();
        assert_eq!(
            fs::read(tmp.path().join("instances/alpha")).unwrap(),
            b"one"
        );

        root.atomic_write_file("instances/alpha", b"two", 0o600)
            .unwrap();
        assert_eq!(
            fs::read(tmp.path().join("instances/alpha")).unwrap(),
            b"two"
        );

        // No stray temp files survive the write.
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("instances"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn mkdir_all_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Root::new(tmp.path()).unwrap();
        let a = root.mkdir_all("refs/b/n", 0o700).unwrap();
        let b = root.mkdir_all("refs/b/n", 0o700).unwrap();
        assert_eq!(a, b);
        assert!(a.is_dir());
    }
}
