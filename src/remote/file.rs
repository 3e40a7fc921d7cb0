//! Remote document kept as a JSON file on a shared path (team drive, NFS
//! mount). Both cells live in one file and are replaced together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{envelope_from_cells, Envelope, RemoteStore, StampMinter};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::snapshot::DomainSnapshot;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Cells {
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

pub struct FileRemote {
    path: PathBuf,
    minter: StampMinter,
}

impl FileRemote {
    pub fn new(
        path: impl AsRef<Path>,
        writer: impl Into<String>,
        updated_by: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            minter: StampMinter::new(writer, updated_by, clock),
        }
    }

    async fn read_cells(&self) -> Result<Cells> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Cells::default()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| SyncError::Parse(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SyncError::NotFound(
                format!("remote document {}", self.path.display()),
            )),
            Err(e) => Err(SyncError::Transient(format!(
                "reading {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Per-writer staging file next to the document, so writers on other
    /// machines never share one.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, self.minter.writer()))
    }

    async fn write_cells(&self, cells: &Cells) -> Result<()> {
        let staged = self.staging_path();
        let body = serde_json::to_vec_pretty(cells)?;
        tokio::fs::write(&staged, body)
            .await
            .map_err(|e| SyncError::Transient(format!("writing {}: {}", staged.display(), e)))?;
        tokio::fs::rename(&staged, &self.path)
            .await
            .map_err(|e| SyncError::Transient(format!("replacing {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl RemoteStore for FileRemote {
    async fn fetch(&self) -> Result<Option<Envelope>> {
        let cells = self.read_cells().await?;
        envelope_from_cells(cells.payload.as_deref(), cells.version.as_deref())
    }

    async fn write(&self, snapshot: &DomainSnapshot) -> Result<Envelope> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(SyncError::NotFound(format!(
                "remote document {}",
                self.path.display()
            )));
        }
        let (raw, envelope) = self.minter.prepare(snapshot)?;
        let cells = Cells {
            payload: Some(raw),
            version: Some(envelope.version.as_str().to_string()),
        };
        self.write_cells(&cells).await?;
        debug!(path = %self.path.display(), version = %envelope.version, "Wrote remote document");
        Ok(envelope)
    }

    async fn provision(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            self.write_cells(&Cells::default()).await?;
            debug!(path = %self.path.display(), "Provisioned remote document");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::snapshot::default_stages;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_not_found_then_provisioned() {
        let dir = TempDir::new().unwrap();
        let remote = FileRemote::new(
            dir.path().join("team/board.json"),
            "proc-a",
            "client_a",
            Arc::new(SystemClock),
        );

        assert!(remote.fetch().await.unwrap_err().is_not_found());
        let snapshot = DomainSnapshot::new(vec![], default_stages());
        assert!(remote.write(&snapshot).await.unwrap_err().is_not_found());

        remote.provision().await.unwrap();
        assert!(remote.fetch().await.unwrap().is_none());

        let written = remote.write(&snapshot).await.unwrap();
        let fetched = remote.fetch().await.unwrap().unwrap();
        assert_eq!(fetched.version, written.version);
        assert_eq!(fetched.snapshot, snapshot);
    }

    #[tokio::test]
    async fn test_writers_stage_separately_and_leave_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        let a = FileRemote::new(&path, "proc-a", "client_a", Arc::new(SystemClock));
        let b = FileRemote::new(&path, "proc-b", "client_b", Arc::new(SystemClock));
        assert_ne!(a.staging_path(), b.staging_path());
        assert_eq!(a.staging_path().parent(), path.parent());

        a.provision().await.unwrap();
        let snapshot = DomainSnapshot::new(vec![], default_stages());
        a.write(&snapshot).await.unwrap();
        let written = b.write(&snapshot).await.unwrap();

        assert_eq!(a.fetch().await.unwrap().unwrap().version, written.version);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.json");
        std::fs::write(&path, "{ not json").unwrap();
        let remote = FileRemote::new(&path, "proc-a", "client_a", Arc::new(SystemClock));

        assert!(matches!(remote.fetch().await, Err(SyncError::Parse(_))));
    }
}
