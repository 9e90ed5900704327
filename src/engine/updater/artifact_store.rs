//! Artifact Store
//!
//! Filesystem layout for the downloaded blocklist:
//!
//! ```text
//! <base>/<artifact>/            artifact family directory
//! <base>/<artifact>/<version>/  one directory per installed version
//! <base>/<artifact>/.staging/   in-flight downloads
//! ```
//!
//! The store knows nothing about which version is current; that lives in
//! the timestamp store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::state::VersionStamp;

const STAGING_DIR: &str = ".staging";

/// Locates and erases the on-disk blocklist directories
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Platform data directory for blocklists
    ///
    /// Linux: ~/.local/share/blocklist-updater/
    /// Windows: %LOCALAPPDATA%\blocklist-updater\
    pub fn platform_base_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("blocklist-updater"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding every version of `artifact_name`
    pub fn path(&self, artifact_name: &str) -> PathBuf {
        self.base_dir.join(artifact_name)
    }

    pub fn version_path(&self, artifact_name: &str, version: VersionStamp) -> PathBuf {
        self.path(artifact_name).join(version.as_millis().to_string())
    }

    pub fn staging_path(&self, artifact_name: &str) -> PathBuf {
        self.path(artifact_name).join(STAGING_DIR)
    }

    pub fn has_version(&self, artifact_name: &str, version: VersionStamp) -> bool {
        version.is_set() && self.version_path(artifact_name, version).is_dir()
    }

    /// Installed version directories, oldest first
    pub fn list_versions(&self, artifact_name: &str) -> io::Result<Vec<VersionStamp>> {
        let family = self.path(artifact_name);
        if !family.exists() {
            return Ok(vec![]);
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&family)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Staging and other dot-directories are skipped by the parse
            if let Some(millis) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                versions.push(VersionStamp::from_millis(millis));
            }
        }

        versions.sort();
        Ok(versions)
    }

    /// Move a downloaded payload into its version directory
    pub fn install(
        &self,
        artifact_name: &str,
        payload: &Path,
        version: VersionStamp,
    ) -> io::Result<PathBuf> {
        let final_path = self.version_path(artifact_name, version);
        if !payload.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("staged payload {} not found", payload.display()),
            ));
        }

        fs::create_dir_all(self.path(artifact_name))?;
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(payload, &final_path)?;

        Ok(final_path)
    }

    /// Remove every version directory except `keep`; returns how many went
    pub fn prune_except(&self, artifact_name: &str, keep: Option<VersionStamp>) -> io::Result<usize> {
        let mut removed = 0;
        for version in self.list_versions(artifact_name)? {
            if Some(version) == keep {
                continue;
            }
            self.remove_all(&self.version_path(artifact_name, version))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn clear_staging(&self, artifact_name: &str) -> io::Result<()> {
        self.remove_all(&self.staging_path(artifact_name))
    }

    /// Recursively remove a directory. A missing path is not an error.
    pub fn remove_all(&self, location: &Path) -> io::Result<()> {
        match fs::remove_dir_all(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
