use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::paths;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no listener published at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("discovery file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Well-known file a listener publishes its bound TCP port to.
///
/// Last writer wins: only one listener per role is expected to run locally,
/// so a second instance simply overwrites the first one's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFile {
    path: PathBuf,
}

impl DiscoveryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config-dir>/<role>_port`.
    pub fn for_role(role: &str) -> Self {
        Self::new(paths::port_file_path(role))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `port` as plain text, replacing any previous content.
    pub fn publish(&self, port: u16) -> Result<(), DiscoveryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        // Write-then-rename so a concurrent reader never sees a torn value.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, port.to_string()).map_err(|source| self.io_error(source))?;
        std::fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;
        tracing::debug!(path = %self.path.display(), port, "published listener port");
        Ok(())
    }

    /// Remove the file. A missing file is not an error.
    pub fn unpublish(&self) -> Result<(), DiscoveryError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Read the published port. Missing, unreadable, or non-numeric content
    /// all report `NotFound`.
    pub fn discover(&self) -> Result<u16, DiscoveryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), err = %e, "discovery file unreadable");
                return Err(self.not_found());
            }
        };
        match contents.trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => {
                tracing::warn!(
                    path = %self.path.display(),
                    contents = %contents.trim(),
                    "discovery file holds no valid port"
                );
                Err(self.not_found())
            }
        }
    }

    fn not_found(&self) -> DiscoveryError {
        DiscoveryError::NotFound {
            path: self.path.clone(),
        }
    }

    fn io_error(&self, source: io::Error) -> DiscoveryError {
        DiscoveryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_discover() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("nested/tray_port"));
        file.publish(43123).unwrap();
        assert_eq!(file.discover().unwrap(), 43123);
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "43123".to_string()
        );
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("tray_port"));
        file.publish(1000).unwrap();
        file.publish(2000).unwrap();
        assert_eq!(file.discover().unwrap(), 2000);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("absent"));
        assert!(matches!(
            file.discover(),
            Err(DiscoveryError::NotFound { .. })
        ));
    }

    #[test]
    fn non_numeric_content_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("tray_port"));
        std::fs::write(file.path(), "not-a-port").unwrap();
        assert!(matches!(
            file.discover(),
            Err(DiscoveryError::NotFound { .. })
        ));

        std::fs::write(file.path(), "0").unwrap();
        assert!(file.discover().is_err());

        std::fs::write(file.path(), "70000").unwrap();
        assert!(file.discover().is_err());
    }

    #[test]
    fn discover_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("tray_port"));
        std::fs::write(file.path(), " 8123\n").unwrap();
        assert_eq!(file.discover().unwrap(), 8123);
    }

    #[test]
    fn unpublish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = DiscoveryFile::new(dir.path().join("tray_port"));
        file.publish(9000).unwrap();
        file.unpublish().unwrap();
        assert!(!file.path().exists());
        file.unpublish().unwrap();
    }

    #[test]
    fn role_file_name() {
        let file = DiscoveryFile::for_role("tray");
        assert!(file.path().ends_with("tray_port"));
    }
}
