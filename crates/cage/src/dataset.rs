//! Storage-dataset collaborator.
//!
//! Named volumes and container roots are backed by snapshot-capable datasets
//! managed outside this process. The trait covers exactly what provisioning
//! needs: existence queries, idempotent creation, and mount-point
//! resolution. Production uses the `zfs` binary; tests substitute an
//! in-memory implementation.

use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Result type for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;

/// Errors that can occur while querying or creating datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The dataset tool exited non-zero.
    #[error("dataset operation failed for {dataset}: {stderr}")]
    CommandFailed { dataset: String, stderr: String },

    /// Generic IO error (tool missing, spawn failure, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dataset layer used by the provisioner.
#[async_trait]
pub trait Datasets: Send + Sync {
    /// Whether the named dataset exists.
    async fn exists(&self, name: &str) -> DatasetResult<bool>;

    /// Create the named dataset (and missing parents). Idempotent.
    async fn create(&self, name: &str) -> DatasetResult<()>;

    /// Filesystem path the named dataset is mounted at.
    async fn mountpoint(&self, name: &str) -> DatasetResult<PathBuf>;
}

/// `zfs`-backed dataset layer shelling out to the system binary.
#[derive(Debug, Clone, Default)]
pub struct ZfsDatasets;

impl ZfsDatasets {
    async fn zfs(&self, args: &[&str], dataset: &str) -> DatasetResult<std::process::Output> {
        debug!("zfs {}", args.join(" "));
        let output = Command::new("zfs").args(args).output().await?;
        if !output.status.success() {
            return Err(DatasetError::CommandFailed {
                dataset: dataset.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Datasets for ZfsDatasets {
    async fn exists(&self, name: &str) -> DatasetResult<bool> {
        // `zfs list` exits non-zero for a missing dataset.
        let output = Command::new("zfs")
            .args(["list", "-Ho", "name", name])
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn create(&self, name: &str) -> DatasetResult<()> {
        self.zfs(&["create", "-p", name], name).await?;
        Ok(())
    }

    async fn mountpoint(&self, name: &str) -> DatasetResult<PathBuf> {
        let output = self
            .zfs(&["get", "-Ho", "value", "mountpoint", name], name)
            .await?;
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(PathBuf::from(path))
    }
}
