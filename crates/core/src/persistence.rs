//! Best-effort snapshots of broker state.
//!
//! Snapshots are copied under the store and registry guards, then written
//! with no guard held. Nothing in the broker depends on a write succeeding.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use crate::registry::{ServerRecord, ServerRegistry};
use crate::store::{MessageStore, QueueDump};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub users: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub jobs: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

impl Snapshot {
    /// Copies both stores. Each guard is held only for the copy.
    pub fn capture(store: &MessageStore, registry: &ServerRegistry) -> BrokerResult<Self> {
        let QueueDump { users, jobs } = store.dump()?;
        let servers = registry.records()?;
        Ok(Self {
            taken_at: Some(Utc::now()),
            users,
            jobs,
            servers,
        })
    }
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Called once at startup.
    async fn load(&self) -> BrokerResult<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> BrokerResult<()>;

    /// Whether saves reach durable storage at all.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

#[async_trait]
impl PersistenceAdapter for NoPersistence {
    async fn load(&self) -> BrokerResult<Option<Snapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &Snapshot) -> BrokerResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Snapshot as one JSON document, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersistenceAdapter for JsonFileStore {
    async fn load(&self) -> BrokerResult<Option<Snapshot>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .map_err(|err| BrokerError::Persistence(err.to_string()))?
    }

    async fn save(&self, snapshot: &Snapshot) -> BrokerResult<()> {
        let path = self.path.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .map_err(|err| BrokerError::Persistence(err.to_string()))?
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "courier-snapshot.json".into());
    name.push(suffix);
    path.with_file_name(name)
}

fn read_snapshot(path: &Path) -> BrokerResult<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let snapshot = serde_json::from_reader(file).map_err(|err| {
        BrokerError::Persistence(format!("failed to parse snapshot {}: {}", path.display(), err))
    })?;
    Ok(Some(snapshot))
}

/// flock + fsync + atomic rename.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> BrokerResult<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let lock = File::create(sibling(path, ".lock"))?;
    lock.lock_exclusive()?;

    let temp_path = sibling(path, ".tmp");
    let mut temp = open_private(&temp_path)?;

    serde_json::to_writer_pretty(&mut temp, snapshot)?;
    temp.sync_all()?;
    drop(temp);

    std::fs::rename(&temp_path, path)?;
    sync_parent(path)?;

    drop(lock);
    Ok(())
}

#[cfg(target_family = "unix")]
fn open_private(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(target_family = "unix"))]
fn open_private(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(target_family = "unix")]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(target_family = "unix"))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Coalescing background writer. `mark_dirty` never blocks; changes that
/// arrive during a write trigger one more write afterwards.
#[derive(Clone, Default)]
pub struct SnapshotWriter {
    dirty: Arc<Notify>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    pub fn spawn(
        &self,
        adapter: Arc<dyn PersistenceAdapter>,
        store: MessageStore,
        registry: ServerRegistry,
        debounce: Duration,
    ) -> JoinHandle<()> {
        let dirty = self.dirty.clone();
        tokio::spawn(async move {
            loop {
                dirty.notified().await;
                if !debounce.is_zero() {
                    tokio::time::sleep(debounce).await;
                }

                let snapshot = match Snapshot::capture(&store, &registry) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!("Snapshot capture failed: {}", err);
                        continue;
                    }
                };

                match adapter.save(&snapshot).await {
                    Ok(()) => debug!(
                        queues = snapshot.users.len() + snapshot.jobs.len(),
                        servers = snapshot.servers.len(),
                        "Snapshot saved"
                    ),
                    Err(err) => warn!("Snapshot save failed: {}", err),
                }
            }
        })
    }
}
