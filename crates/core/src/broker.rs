//! Process-scoped broker state.
//!
//! One `Broker` is built at startup and cloned into every handler. All
//! clones share the same stores; background tasks are started separately
//! with [`Broker::spawn_background`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::janitor::JanitorSweep;
use crate::message::{Message, MessageId, Namespace};
use crate::persistence::{NoPersistence, PersistenceAdapter, Snapshot, SnapshotWriter};
use crate::poll::{PollCoordinator, PollResult};
use crate::registry::{Ping, ServerRecord, ServerRegistry};
use crate::store::{MessageStore, QueueDump};

/// Read-only view of the registry and both namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub servers: Vec<ServerRecord>,
    pub user_messages: BTreeMap<String, Vec<Message>>,
    #[serde(rename = "jobIdMessages")]
    pub job_messages: BTreeMap<String, Vec<Message>>,
}

/// Handles for the janitor and the snapshot writer.
pub struct BackgroundTasks {
    pub janitor: JoinHandle<()>,
    pub writer: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        self.janitor.abort();
        if let Some(writer) = self.writer {
            writer.abort();
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    store: MessageStore,
    registry: ServerRegistry,
    poller: PollCoordinator,
    persistence: Arc<dyn PersistenceAdapter>,
    writer: SnapshotWriter,
}

impl Broker {
    pub fn new(config: BrokerConfig, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        let store = MessageStore::new(&config);
        let registry = ServerRegistry::new();
        let poller = PollCoordinator::new(registry.clone(), store.clone());
        Self {
            config,
            store,
            registry,
            poller,
            persistence,
            writer: SnapshotWriter::new(),
        }
    }

    pub fn in_memory(config: BrokerConfig) -> Self {
        Self::new(config, Arc::new(NoPersistence))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Loads the last snapshot, if any. Call once, before serving.
    /// Returns the number of messages brought back.
    pub async fn restore(&self) -> BrokerResult<usize> {
        let Some(snapshot) = self.persistence.load().await? else {
            debug!("No snapshot to restore");
            return Ok(0);
        };

        let Snapshot {
            taken_at,
            users,
            jobs,
            servers,
        } = snapshot;
        let messages = self.store.restore(QueueDump { users, jobs }, Utc::now())?;
        let servers = self.registry.restore(servers)?;

        info!(
            messages,
            servers,
            taken_at = ?taken_at,
            "Restored broker snapshot"
        );
        Ok(messages)
    }

    pub fn enqueue(
        &self,
        namespace: Namespace,
        key: &str,
        payload: impl Into<String>,
    ) -> BrokerResult<MessageId> {
        let id = self.store.enqueue(namespace, key, payload)?;
        self.writer.mark_dirty();
        Ok(id)
    }

    pub fn mark_executed(
        &self,
        namespace: Namespace,
        key: &str,
        id: &MessageId,
        outcome: bool,
    ) -> BrokerResult<bool> {
        let found = self.store.mark_executed(namespace, key, id, outcome)?;
        if found {
            self.writer.mark_dirty();
        }
        Ok(found)
    }

    pub fn purge(&self, namespace: Namespace, key: &str) -> BrokerResult<usize> {
        let removed = self.store.purge(namespace, key)?;
        if removed > 0 {
            info!(namespace = %namespace, key, removed, "Queue purged on request");
            self.writer.mark_dirty();
        }
        Ok(removed)
    }

    pub fn poll_and_fetch(&self, ping: Ping) -> BrokerResult<PollResult> {
        let result = self.poller.poll_and_fetch(ping)?;
        self.writer.mark_dirty();
        Ok(result)
    }

    /// Unfiltered copy of both namespaces.
    pub fn dump(&self) -> BrokerResult<QueueDump> {
        self.store.dump()
    }

    pub fn status(&self) -> BrokerResult<BrokerStatus> {
        let servers = self.registry.records()?;
        let QueueDump { users, jobs } = self.store.dump()?;
        Ok(BrokerStatus {
            servers,
            user_messages: users,
            job_messages: jobs,
        })
    }

    pub fn snapshot(&self) -> BrokerResult<Snapshot> {
        Snapshot::capture(&self.store, &self.registry)
    }

    /// Synchronous save, used at shutdown.
    pub async fn persist_now(&self) -> BrokerResult<()> {
        if !self.persistence.is_durable() {
            return Ok(());
        }
        let snapshot = self.snapshot()?;
        self.persistence.save(&snapshot).await
    }

    pub fn janitor(&self) -> JanitorSweep {
        JanitorSweep::new(self.registry.clone(), self.store.clone(), &self.config)
            .with_writer(self.writer.clone())
    }

    pub fn spawn_background(&self) -> BackgroundTasks {
        let janitor = self.janitor().spawn();
        let writer = self.persistence.is_durable().then(|| {
            self.writer.spawn(
                self.persistence.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.config.snapshot_debounce(),
            )
        });
        BackgroundTasks { janitor, writer }
    }
}
