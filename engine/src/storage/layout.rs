//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Directory layout for the engine's durable state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Queue directory for jobs not yet claimed by a worker
    pub fn queue_pending_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("queue").join("pending"))
    }

    /// Queue directory for claimed, in-flight jobs
    pub fn queue_claimed_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("queue").join("claimed"))
    }

    /// Root for per-resource working directories
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// Working directory for one compose project.
    ///
    /// Keyed by project name, which includes the isolation suffix for
    /// preview deployments, so concurrent deployments of the same resource
    /// never share a checkout.
    pub fn work_dir(&self, project_name: &str) -> Dir {
        self.deployments_dir().subdir(project_name)
    }

    /// Per-job deployment log directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::EngineError> {
        self.queue_pending_dir().create().await?;
        self.queue_claimed_dir().create().await?;
        self.deployments_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // Use /var/lib/dockhand on Linux, or the user home directory on
        // other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/dockhand");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".dockhand"))
            .unwrap_or_else(|_| PathBuf::from(".dockhand"));

        Self { base_dir }
    }
}
