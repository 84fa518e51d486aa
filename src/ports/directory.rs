use super::PortSnapshot;
use crate::config::HardwareConfig;
use crate::error::{ModuleError, ModuleResult};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Reads the module device namespace.
///
/// Enumeration is read-only and can be shared freely. Each call is a
/// point-in-time view; callers deal with staleness by diffing snapshots.
#[derive(Debug, Clone)]
pub struct PortDirectory {
    root: PathBuf,
    live: bool,
    retry_delay: Duration,
}

impl PortDirectory {
    /// Directory reader for `root`. When `live` is false nothing is read.
    pub fn new(root: impl Into<PathBuf>, live: bool) -> Self {
        Self {
            root: root.into(),
            live,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Reader configured from the `[hardware]` section.
    pub fn from_config(config: &HardwareConfig) -> Self {
        Self::new(config.device_dir.clone(), config.live)
            .with_retry_delay(config.enumerate_retry_delay)
    }

    /// Reader that never touches the filesystem.
    pub fn simulated() -> Self {
        Self::new(PathBuf::new(), false)
    }

    /// Set the delay before retrying a missing directory.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Directory being enumerated.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether real hardware is being read.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Absolute path of a directory entry.
    pub fn port_path(&self, entry: &str) -> String {
        self.root.join(entry).to_string_lossy().into_owned()
    }

    /// Current device paths, sorted by entry name.
    ///
    /// The directory can briefly vanish while a device re-enumerates, so a
    /// missing directory is retried once after the retry delay before giving up
    /// with [`ModuleError::Discovery`].
    pub async fn enumerate(&self) -> ModuleResult<PortSnapshot> {
        if !self.live {
            return Ok(PortSnapshot::empty());
        }

        let names = match self.read_entries().await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    dir = %self.root.display(),
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "Device directory missing, retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                self.read_entries().await.map_err(|e| self.discovery_error(e))?
            }
            other => other.map_err(|e| self.discovery_error(e))?,
        };

        Ok(PortSnapshot::new(names.iter().map(|name| self.port_path(name))))
    }

    async fn read_entries(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn discovery_error(&self, err: io::Error) -> ModuleError {
        warn!(dir = %self.root.display(), error = %err, "Device directory unreadable");
        ModuleError::Discovery(format!(
            "No {} found ({err}). Try again",
            self.root.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_directory_is_empty() {
        let dir = PortDirectory::new("/definitely/not/here", false);
        let snapshot = dir.enumerate().await.unwrap();
        assert!(snapshot.is_empty());
        assert!(PortDirectory::simulated().enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_lists_sorted_absolute_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ttyACM1_magdeck"), b"").unwrap();
        std::fs::write(tmp.path().join("ttyACM0_tempdeck"), b"").unwrap();

        let dir = PortDirectory::new(tmp.path(), true);
        let snapshot = dir.enumerate().await.unwrap();

        assert_eq!(
            snapshot.paths(),
            &[dir.port_path("ttyACM0_tempdeck"), dir.port_path("ttyACM1_magdeck")]
        );
    }

    #[tokio::test]
    async fn test_missing_directory_fails_after_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = PortDirectory::new(tmp.path().join("modules"), true)
            .with_retry_delay(Duration::from_millis(10));

        let err = dir.enumerate().await.unwrap_err();
        assert!(matches!(err, ModuleError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_unreadable_directory_fails_without_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("modules");
        std::fs::write(&root, b"not a directory").unwrap();
        let dir = PortDirectory::new(&root, true).with_retry_delay(Duration::from_secs(30));

        let started = std::time::Instant::now();
        let err = dir.enumerate().await.unwrap_err();

        assert!(matches!(err, ModuleError::Discovery(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_directory_appearing_during_retry_is_read() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("modules");
        let dir = PortDirectory::new(&root, true).with_retry_delay(Duration::from_millis(200));

        let creator = {
            let root = root.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::create_dir(&root).unwrap();
                std::fs::write(root.join("ttyACM0_tempdeck"), b"").unwrap();
            })
        };

        let snapshot = dir.enumerate().await.unwrap();
        creator.await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&dir.port_path("ttyACM0_tempdeck")));
    }
}
