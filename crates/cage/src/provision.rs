//! Mount and volume provisioning for a container's filesystem root.
//!
//! Resolves CLI bind mounts and named volumes (manifest-declared first, CLI
//! second) into one ordered binding list, creating target directories and
//! backing datasets as needed. Volume bindings always precede explicit
//! mounts in the final list; the engine treats later entries with the same
//! destination as winning, and nothing is deduplicated here.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use log::{debug, info};
use thiserror::Error;

use cage_protocol::MountBinding;

use crate::dataset::{DatasetError, Datasets};
use crate::fsutil;
use crate::manifest::VolumeDecl;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors that abort a launch during provisioning. Partial state (already
/// created directories or datasets) is left in place; there is no rollback.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid mount spec '{0}' (expected SRC[:DST])")]
    InvalidMountSpec(String),

    #[error("invalid volume spec '{0}' (expected NAME:PATH)")]
    InvalidVolumeSpec(String),

    /// A directory creation, seed copy, or ownership change failed.
    #[error("provisioning failed for {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A dataset query or creation failed.
    #[error("provisioning failed for volume '{volume}': {source}")]
    Volume {
        volume: String,
        #[source]
        source: DatasetError,
    },
}

/// Resolve a possibly-relative path against `cwd` and normalize `.`/`..`
/// components lexically. The path need not exist.
fn absolutize(raw: &str, cwd: &Path) -> PathBuf {
    let joined = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        cwd.join(raw)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Join an absolute container path onto the filesystem root.
fn rooted(root: &Path, container_path: &Path) -> PathBuf {
    let rel: PathBuf = container_path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    root.join(rel)
}

/// A CLI bind mount, parsed from `SRC[:DST]`. Both sides are resolved to
/// absolute paths; a missing destination means destination = source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub src: PathBuf,
    pub dst: PathBuf,
}

impl MountSpec {
    pub fn parse(raw: &str, cwd: &Path) -> ProvisionResult<Self> {
        let (src, dst) = match raw.split_once(':') {
            Some((src, dst)) if !dst.is_empty() => (src, dst),
            Some((src, _)) => (src, src),
            None => (raw, raw),
        };
        if src.is_empty() {
            return Err(ProvisionError::InvalidMountSpec(raw.to_string()));
        }
        Ok(Self {
            src: absolutize(src, cwd),
            dst: absolutize(dst, cwd),
        })
    }
}

/// A CLI named-volume request, parsed from `NAME:PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub to: PathBuf,
}

impl VolumeSpec {
    pub fn parse(raw: &str, cwd: &Path) -> ProvisionResult<Self> {
        match raw.split_once(':') {
            Some((name, to)) if !name.is_empty() && !to.is_empty() => Ok(Self {
                name: name.to_string(),
                to: absolutize(to, cwd),
            }),
            _ => Err(ProvisionError::InvalidVolumeSpec(raw.to_string())),
        }
    }
}

/// Provisions the filesystem surface a container will see.
pub struct Provisioner {
    rootfs: PathBuf,
    volumes_location: String,
    datasets: Arc<dyn Datasets>,
}

impl Provisioner {
    pub fn new(
        rootfs: impl Into<PathBuf>,
        volumes_location: impl Into<String>,
        datasets: Arc<dyn Datasets>,
    ) -> Self {
        Self {
            rootfs: rootfs.into(),
            volumes_location: volumes_location.into(),
            datasets,
        }
    }

    /// Resolve and provision everything, returning the final ordered binding
    /// list: volumes (manifest-declared first, CLI-declared second) followed
    /// by explicit mounts.
    pub async fn provision(
        &self,
        manifest_volumes: &[VolumeDecl],
        cli_volumes: &[VolumeSpec],
        cli_mounts: &[MountSpec],
    ) -> ProvisionResult<Vec<MountBinding>> {
        // Manifest volumes first, CLI volumes second: later entries with a
        // colliding container path win when the engine applies the list.
        // Manifest paths are container paths; a relative one resolves from
        // the container root so bindings always carry absolute sides.
        let mut volumes: Vec<VolumeSpec> = manifest_volumes
            .iter()
            .map(|decl| VolumeSpec {
                name: decl.name.clone(),
                to: absolutize(&decl.to, Path::new("/")),
            })
            .collect();
        volumes.extend(cli_volumes.iter().cloned());

        let mut bindings = Vec::with_capacity(volumes.len() + cli_mounts.len());
        for volume in &volumes {
            bindings.push(self.provision_volume(volume).await?);
        }

        // Mount targets have no ordering dependency on each other; provision
        // them concurrently but keep input order in the result.
        let mounts = try_join_all(cli_mounts.iter().map(|m| self.provision_mount(m))).await?;
        bindings.extend(mounts);

        Ok(bindings)
    }

    /// Ensure the target directory for one bind mount exists. A host source
    /// that does not exist is a container-local directory seeded from
    /// nothing; no content is copied either way.
    async fn provision_mount(&self, mount: &MountSpec) -> ProvisionResult<MountBinding> {
        let target = rooted(&self.rootfs, &mount.dst);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|source| ProvisionError::Filesystem {
                path: target.clone(),
                source,
            })?;
        debug!(
            "mount {} -> {} (target {})",
            mount.src.display(),
            mount.dst.display(),
            target.display()
        );
        Ok(MountBinding {
            src: mount.src.clone(),
            dst: mount.dst.clone(),
        })
    }

    /// Provision one named volume: ensure the target directory, resolve or
    /// create the backing dataset, seed the dataset once on creation, and
    /// sync its ownership to the target's. Steps for a single volume are
    /// strictly sequential; existence-check-then-create is one logical step
    /// per volume name, so volumes are never provisioned concurrently.
    async fn provision_volume(&self, volume: &VolumeSpec) -> ProvisionResult<MountBinding> {
        let volume_err = |source| ProvisionError::Volume {
            volume: volume.name.clone(),
            source,
        };
        let fs_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ProvisionError::Filesystem { path, source }
        };

        let target = rooted(&self.rootfs, &volume.to);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(fs_err(&target))?;

        let dataset = format!("{}/{}", self.volumes_location, volume.name);
        let existed = self.datasets.exists(&dataset).await.map_err(volume_err)?;
        if !existed {
            self.datasets.create(&dataset).await.map_err(volume_err)?;
            let mountpoint = self.datasets.mountpoint(&dataset).await.map_err(volume_err)?;

            // Copy-on-first-use: seed the fresh dataset from whatever the
            // image shipped at the target path. Skipped when the dataset
            // already existed, since it is assumed already seeded.
            info!(
                "seeding new volume '{}' from {}",
                volume.name,
                target.display()
            );
            let (seed_src, seed_dst) = (target.clone(), mountpoint.clone());
            tokio::task::spawn_blocking(move || fsutil::seed_dir(&seed_src, &seed_dst))
                .await
                .map_err(std::io::Error::other)
                .map_err(fs_err(&target))?
                .map_err(fs_err(&mountpoint))?;
        }

        let mountpoint = self.datasets.mountpoint(&dataset).await.map_err(volume_err)?;

        // Contents inherit container-visible ownership.
        let (chown_path, reference) = (mountpoint.clone(), target.clone());
        tokio::task::spawn_blocking(move || fsutil::chown_to_match(&chown_path, &reference))
            .await
            .map_err(std::io::Error::other)
            .map_err(fs_err(&mountpoint))?
            .map_err(fs_err(&mountpoint))?;

        Ok(MountBinding {
            src: mountpoint,
            dst: volume.to.clone(),
        })
    }
}
