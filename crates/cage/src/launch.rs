//! Launch orchestration: manifest, provisioning, engine, tty.
//!
//! Composition root for one launch: load and merge the manifest, provision
//! mounts and volumes, build the launch request, start the container, and
//! optionally attach an interactive terminal. A background `wait_container`
//! call cancels a shutdown token when the container exits; the foreground
//! flow finishes as soon as that happens.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use cage_protocol::{LaunchRequest, MountBinding};

use crate::config::Config;
use crate::dataset::Datasets;
use crate::engine::EngineClient;
use crate::manifest::{Manifest, ManifestPatch};
use crate::provision::{MountSpec, Provisioner, VolumeSpec};
use crate::tty::TtySession;

/// CLI inputs for one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub name: String,
    /// Base image reference override.
    pub from: Option<String>,
    /// Entry command override.
    pub entry: Option<String>,
    /// Trailing free-text command words.
    pub command: Vec<String>,
    /// `KEY=VALUE` environment assignments.
    pub env: Vec<String>,
    /// `KEY=VALUE` resource-rule assignments.
    pub rules: Vec<String>,
    /// `SRC[:DST]` bind-mount specs.
    pub mounts: Vec<String>,
    /// `NAME:PATH` volume specs.
    pub volumes: Vec<String>,
    /// Attach an interactive terminal after start.
    pub tty: bool,
    /// Network-interface hint passed through to the engine.
    pub interface: Option<String>,
}

/// Parse repeated `KEY=VALUE` assignments, keeping values verbatim.
fn parse_assignments(items: &[String]) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("invalid assignment '{item}' (expected KEY=VALUE)"))
        })
        .collect()
}

/// Compose the engine-facing launch body from the merged manifest, the CLI
/// overrides, and the provisioned bindings. CLI values win per key; rule
/// values stay uncoerced strings.
pub fn build_launch_request(
    manifest: &Manifest,
    opts: &LaunchOptions,
    path: &Path,
    rootfs: &Path,
    mounts: Vec<MountBinding>,
) -> Result<LaunchRequest> {
    let entry = opts
        .entry
        .clone()
        .unwrap_or_else(|| manifest.entry.clone());
    let command = if opts.command.is_empty() {
        manifest.command.clone()
    } else {
        opts.command.join(" ")
    };

    let mut env: BTreeMap<String, String> = manifest.env.clone();
    env.extend(parse_assignments(&opts.env)?);

    let mut rules = manifest.rules.clone();
    for (key, value) in parse_assignments(&opts.rules)? {
        rules.insert(key, value.into());
    }

    Ok(LaunchRequest {
        name: opts.name.clone(),
        path: path.to_path_buf(),
        rootfs: rootfs.to_path_buf(),
        workdir: manifest.workdir.clone(),
        command,
        entry,
        env,
        mounts,
        rules,
        interface: opts.interface.clone(),
    })
}

/// Run one launch end to end. Returns the process exit code to mirror.
pub async fn launch(
    config: &Config,
    datasets: Arc<dyn Datasets>,
    engine: &EngineClient,
    opts: LaunchOptions,
) -> Result<i32> {
    let dataset = format!("{}/{}", config.containers_location, opts.name);
    let path = datasets
        .mountpoint(&dataset)
        .await
        .with_context(|| format!("resolving container dataset '{dataset}'"))?;
    let rootfs = path.join("rootfs");
    let manifest_file = path.join("manifest.json");

    // Fatal before any provisioning; no fallback to defaults.
    let patch = ManifestPatch::load(&manifest_file)?;
    let mut manifest = Manifest::default().merge(std::slice::from_ref(&patch));
    if let Some(from) = &opts.from {
        manifest.from = Some(from.clone());
    }

    let cwd = std::env::current_dir()?;
    let mount_specs = opts
        .mounts
        .iter()
        .map(|raw| MountSpec::parse(raw, &cwd))
        .collect::<Result<Vec<_>, _>>()?;
    let volume_specs = opts
        .volumes
        .iter()
        .map(|raw| VolumeSpec::parse(raw, &cwd))
        .collect::<Result<Vec<_>, _>>()?;

    let provisioner = Provisioner::new(
        rootfs.clone(),
        config.volumes_location.clone(),
        datasets.clone(),
    );
    let bindings = provisioner
        .provision(&manifest.volumes, &volume_specs, &mount_specs)
        .await?;

    let body = build_launch_request(&manifest, &opts, &path, &rootfs, bindings)?;

    // Background wait: its completion (the container exiting) ends the
    // foreground flow through the shutdown token. Errors are logged only.
    let shutdown = CancellationToken::new();
    let wait_task = {
        let engine = engine.clone();
        let name = opts.name.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.wait_container(&name).await {
                warn!("wait_container for '{name}' failed: {err}");
            }
            shutdown.cancel();
        })
    };

    let result = engine
        .run_container(&body)
        .await
        .with_context(|| format!("starting container '{}'", opts.name))?;
    info!("engine accepted launch of '{}': {result}", opts.name);

    let code = if opts.tty {
        let endpoints = engine
            .get_tty(&opts.name)
            .await
            .context("allocating terminal")?;
        let session = TtySession::connect(&endpoints)
            .await
            .context("connecting terminal channels")?;
        tokio::select! {
            outcome = session.attach() => outcome.context("terminal session")?.exit_code(),
            _ = shutdown.cancelled() => 0,
        }
    } else {
        shutdown.cancelled().await;
        0
    };

    wait_task.abort();
    Ok(code)
}
