//! Temporary holding storage for cargo containers
//!
//! Cargo is transient: containers collected from a courier are staged
//! here, processed, and deleted regardless of per-item outcomes. The
//! directory is also cleared wholesale at the start of a run so a
//! crashed previous run cannot leave stale cargo behind.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreResult;

/// A cargo container sitting in the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCargo {
    pub name: String,
    path: PathBuf,
}

/// Disk-backed staging area for cargo containers
pub struct CargoStagingStore {
    dir: PathBuf,
}

impl CargoStagingStore {
    pub async fn open(dir: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Stage a cargo container, returning its handle
    pub async fn store(&self, cargo: &[u8]) -> StoreResult<StagedCargo> {
        let name = format!("{}.cargo", hex::encode(blake3::hash(cargo).as_bytes()));
        let path = self.dir.join(&name);

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(cargo).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &path).await?;

        debug!(name, size = cargo.len(), "Staged cargo container");
        Ok(StagedCargo { name, path })
    }

    /// Every container currently staged
    pub async fn list(&self) -> StoreResult<Vec<StagedCargo>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("cargo") {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    out.push(StagedCargo {
                        name: name.to_string(),
                        path,
                    });
                }
            }
        }
        Ok(out)
    }

    pub async fn read(&self, staged: &StagedCargo) -> StoreResult<Bytes> {
        Ok(Bytes::from(fs::read(&staged.path).await?))
    }

    /// Delete one staged container; idempotent
    pub async fn delete(&self, staged: &StagedCargo) -> StoreResult<bool> {
        match fs::remove_file(&staged.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every staged container
    pub async fn clear(&self) -> StoreResult<usize> {
        let staged = self.list().await?;
        let mut removed = 0;
        for cargo in &staged {
            match self.delete(cargo).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(name = cargo.name, error = %e, "Failed to clear staged cargo"),
            }
        }
        Ok(removed)
    }
}
