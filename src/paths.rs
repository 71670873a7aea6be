//! Control-plane paths shared by the daemon, the CLI client and the
//! test launcher.
//!
//! Everything lives under one scratch root (the test's `TEST_TMPDIR`).
//! The paths are derived through a value rather than read from the
//! environment at use sites so that tests can point a whole controller
//! at a private temp directory.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const SVCD_PORT_FILE: &str = "svcd-port";
const CURRENT_DEFS_VERSION_FILE: &str = "current-svc-defs-version";
const FROZEN_DEFS_VERSION_FILE: &str = "frozen-svc-defs-version";
const SERVICE_LOGS_DIR: &str = "logs/service_logs";

/// Well-known file locations under a single scratch root.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    root: PathBuf,
}

impl ControlPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build paths rooted at `$TEST_TMPDIR`.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var("TEST_TMPDIR").map_err(|_| {
            Error::Config(
                "TEST_TMPDIR not set. Service tests must be run under the test runner."
                    .to_string(),
            )
        })?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the daemon's listen port as UTF-8 decimal.
    pub fn port_file(&self) -> PathBuf {
        self.root.join(SVCD_PORT_FILE)
    }

    /// Symlink to the version file of the definitions currently in force.
    pub fn current_defs_version_file(&self) -> PathBuf {
        self.root.join(CURRENT_DEFS_VERSION_FILE)
    }

    /// Copy of the version file frozen at first start.
    pub fn frozen_defs_version_file(&self) -> PathBuf {
        self.root.join(FROZEN_DEFS_VERSION_FILE)
    }

    /// Per-service log file, `logs/service_logs/<name>/service.log`.
    pub fn service_log_file(&self, service: &str) -> PathBuf {
        self.root
            .join(SERVICE_LOGS_DIR)
            .join(service.trim_start_matches('/'))
            .join("service.log")
    }

    /// Directory the launcher symlinks into the test's output tree.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Write `content` to `path` atomically: write a sibling temp file and
/// rename it into place. Readers polling the file never observe a
/// partial write.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("no parent directory for {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, content)?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_log_path_strips_leading_slash() {
        let paths = ControlPaths::new("/tmp/root");
        assert_eq!(
            paths.service_log_file("/deep/name"),
            PathBuf::from("/tmp/root/logs/service_logs/deep/name/service.log")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("port");
        write_file_atomic(&target, b"1234").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"1234");
        write_file_atomic(&target, b"5678").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"5678");
    }
}
