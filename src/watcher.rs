//! Resource stream: complete policy/tenant replacements from a source.
//!
//! A source publishes [`ResourceUpdate`]s on an mpsc channel; the
//! [`ResourceWatcher`] task applies each one to the stores with a single
//! snapshot swap. [`FileSource`] is the bundled source: a YAML file with
//! `tenants:` and `policies:` lists, watched with `notify` and debounced.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TenantConfig;
use crate::policy::{PolicySpec, PolicyStore, decode_policy_spec};
use crate::tenant::{Tenant, TenantRegistry};
use crate::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// One complete replacement.
#[derive(Debug, Clone)]
pub enum ResourceUpdate {
    /// All active policy specs, in delivery order
    Policies(Vec<PolicySpec>),
    /// All registered tenants
    Tenants(Vec<Tenant>),
}

/// Apply one update to the stores.
pub fn apply_update(store: &PolicyStore, registry: &TenantRegistry, update: ResourceUpdate) {
    match update {
        ResourceUpdate::Policies(specs) => {
            let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
            let rules: usize = specs.iter().map(|s| s.rules.len()).sum();
            info!(sources = ?names, rules, "Installing policy snapshot");
            store.replace_specs(specs);
        }
        ResourceUpdate::Tenants(tenants) => {
            let hosts: Vec<&str> = tenants.iter().map(|t| t.hostname.as_str()).collect();
            info!(hosts = ?hosts, "Installing tenant registry");
            registry.replace(tenants);
        }
    }
}

/// Task applying updates until the channel closes or shutdown fires.
pub struct ResourceWatcher;

impl ResourceWatcher {
    /// Spawn the apply loop.
    pub fn spawn(
        store: Arc<PolicyStore>,
        registry: Arc<TenantRegistry>,
        mut updates: mpsc::Receiver<ResourceUpdate>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => apply_update(&store, &registry, update),
                        None => {
                            debug!("Resource stream closed");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        info!("Resource watcher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceFile {
    tenants: Option<Vec<TenantConfig>>,
    policies: Option<Vec<serde_json::Value>>,
}

/// Decode a resource file into updates. Absent sections yield no update.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not YAML, or a policy
/// spec fails to decode.
pub fn load_resource_file(path: &Path, strict: bool) -> Result<Vec<ResourceUpdate>> {
    let text = std::fs::read_to_string(path)?;
    let file: ResourceFile = if text.trim().is_empty() {
        ResourceFile::default()
    } else {
        serde_yaml::from_str(&text)?
    };

    let mut updates = Vec::new();
    if let Some(tenants) = file.tenants {
        if let Some(t) = tenants.iter().find(|t| t.hostname.is_empty()) {
            return Err(Error::Config(format!(
                "tenant with client_id '{}' has no hostname",
                t.client_id
            )));
        }
        updates.push(ResourceUpdate::Tenants(
            tenants.iter().map(Tenant::from_config).collect(),
        ));
    }
    if let Some(policies) = file.policies {
        let specs = decode_specs(&path.display().to_string(), &policies, strict)?;
        updates.push(ResourceUpdate::Policies(specs));
    }
    Ok(updates)
}

/// Decode a list of specs; unnamed entries are called `<origin>#<index>`.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the first spec that fails to decode.
pub fn decode_specs(
    origin: &str,
    values: &[serde_json::Value],
    strict: bool,
) -> Result<Vec<PolicySpec>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let name = format!("{origin}#{i}");
            decode_policy_spec(&name, v, strict)
                .map_err(|e| Error::Config(format!("{name}: {e}")))
        })
        .collect()
}

/// Watches a resource file and publishes its contents on change.
pub struct FileSource {
    _watcher: RecommendedWatcher,
}

impl FileSource {
    /// Publish the current file contents, then republish after each burst of
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load fails or the `notify` watcher
    /// cannot be created.
    pub fn start(
        path: PathBuf,
        strict: bool,
        sender: mpsc::Sender<ResourceUpdate>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        for update in load_resource_file(&path, strict)? {
            sender
                .try_send(update)
                .map_err(|e| Error::Internal(format!("resource channel: {e}")))?;
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let watcher = create_notify_watcher(event_tx, &path)?;
        spawn_reload_task(path, strict, sender, event_rx, shutdown);

        Ok(Self { _watcher: watcher })
    }
}

fn create_notify_watcher(event_tx: mpsc::Sender<()>, path: &Path) -> Result<RecommendedWatcher> {
    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(ToOwned::to_owned);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let relevant = result.as_ref().is_ok_and(|e| {
                matches!(e.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && e.paths.iter().any(|p| p.file_name() == file_name.as_deref())
            });
            if relevant {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Internal(format!("Failed to create resource watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Internal(format!("Failed to watch {}: {e}", watch_dir.display())))?;

    Ok(watcher)
}

fn spawn_reload_task(
    path: PathBuf,
    strict: bool,
    sender: mpsc::Sender<ResourceUpdate>,
    mut event_rx: mpsc::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut last_event: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        last_event = None;
                        match load_resource_file(&path, strict) {
                            Ok(updates) => {
                                for update in updates {
                                    if sender.send(update).await.is_err() {
                                        debug!("Resource channel closed, stopping file source");
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "Resource file rejected, keeping current snapshot");
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(path = %path.display(), "File source shutting down");
                    break;
                }
            }
        }
    });
}
