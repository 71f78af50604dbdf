use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, MessageId, MessageStatus, Namespace};
use crate::tracker::{ClockPhase, ClockTicket, ExecutionTracker};

type Queues = BTreeMap<String, Vec<Message>>;

/// Point-in-time copy of both namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDump {
    pub users: Queues,
    pub jobs: Queues,
}

impl QueueDump {
    pub fn message_count(&self) -> usize {
        self.users.values().chain(self.jobs.values()).map(Vec::len).sum()
    }
}

struct StoreState {
    users: Queues,
    jobs: Queues,
    tracker: ExecutionTracker,
}

impl StoreState {
    fn queues(&self, namespace: Namespace) -> &Queues {
        match namespace {
            Namespace::User => &self.users,
            Namespace::Job => &self.jobs,
        }
    }

    fn queues_mut(&mut self, namespace: Namespace) -> &mut Queues {
        match namespace {
            Namespace::User => &mut self.users,
            Namespace::Job => &mut self.jobs,
        }
    }

    fn find_mut(&mut self, namespace: Namespace, key: &str, id: &MessageId) -> Option<&mut Message> {
        self.queues_mut(namespace)
            .get_mut(key)?
            .iter_mut()
            .find(|message| message.id == *id)
    }

    /// Removes one message, cancels its clock and drops the queue key once
    /// it is empty.
    fn remove_message(&mut self, namespace: Namespace, key: &str, id: &MessageId) -> Option<Message> {
        let queues = self.queues_mut(namespace);
        let queue = queues.get_mut(key)?;
        let index = queue.iter().position(|message| message.id == *id)?;
        let removed = queue.remove(index);
        if queue.is_empty() {
            queues.remove(key);
        }
        self.tracker.cancel(id);
        Some(removed)
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
}

impl StoreInner {
    fn lock(&self) -> BrokerResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Poisoned("message store"))
    }

    fn on_clock(&self, namespace: Namespace, key: &str, ticket: ClockTicket) {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(err) => {
                warn!(message_id = %ticket.id, phase = %ticket.phase, "Dropping clock: {}", err);
                return;
            }
        };

        if !state.tracker.release(ticket) {
            debug!(message_id = %ticket.id, phase = %ticket.phase, "Ignoring superseded clock");
            return;
        }

        let applies = state
            .find_mut(namespace, key, &ticket.id)
            .map(|message| ExecutionTracker::expiry_applies(ticket.phase, &message.status))
            .unwrap_or(false);

        if applies && state.remove_message(namespace, key, &ticket.id).is_some() {
            debug!(
                namespace = %namespace,
                key,
                message_id = %ticket.id,
                phase = %ticket.phase,
                "Message expired"
            );
        }
    }
}

/// Per-namespace command queues.
///
/// `queues[namespace][key]` exists exactly while it holds at least one
/// message. Every mutation runs under one guard shared with the clock
/// table, so a mutation either applies fully or not at all.
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    users: Queues::new(),
                    jobs: Queues::new(),
                    tracker: ExecutionTracker::new(config.fallback(), config.grace()),
                }),
            }),
        }
    }

    fn schedule(
        &self,
        tracker: &mut ExecutionTracker,
        namespace: Namespace,
        key: &str,
        id: MessageId,
        phase: ClockPhase,
        delay: Duration,
    ) -> BrokerResult<ClockTicket> {
        let inner: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tracker.arm(id, phase, delay, move |ticket| async move {
            if let Some(inner) = inner.upgrade() {
                inner.on_clock(namespace, &key, ticket);
            }
        })
    }

    /// Appends a pending message and arms its fallback clock.
    pub fn enqueue(
        &self,
        namespace: Namespace,
        key: &str,
        payload: impl Into<String>,
    ) -> BrokerResult<MessageId> {
        let message = Message::pending(namespace, key, payload, Utc::now());
        let id = message.id;

        let mut state = self.inner.lock()?;
        let delay = state.tracker.duration(ClockPhase::Fallback);
        self.schedule(&mut state.tracker, namespace, key, id, ClockPhase::Fallback, delay)?;
        state
            .queues_mut(namespace)
            .entry(key.to_string())
            .or_default()
            .push(message);

        debug!(namespace = %namespace, key, message_id = %id, "Message enqueued");
        Ok(id)
    }

    /// Copy of the queue in insertion order, executed messages included.
    pub fn list_pending(&self, namespace: Namespace, key: &str) -> BrokerResult<Vec<Message>> {
        let state = self.inner.lock()?;
        Ok(state.queues(namespace).get(key).cloned().unwrap_or_default())
    }

    /// Records an execution report. Returns `false` if no pending message
    /// with `id` lives in the queue.
    pub fn mark_executed(
        &self,
        namespace: Namespace,
        key: &str,
        id: &MessageId,
        outcome: bool,
    ) -> BrokerResult<bool> {
        let mut state = self.inner.lock()?;

        let pending = state
            .find_mut(namespace, key, id)
            .map(|message| message.is_pending())
            .unwrap_or(false);
        if !pending {
            return Ok(false);
        }

        state.tracker.cancel(id);
        let delay = state.tracker.duration(ClockPhase::Grace);
        self.schedule(&mut state.tracker, namespace, key, *id, ClockPhase::Grace, delay)?;

        if let Some(message) = state.find_mut(namespace, key, id) {
            ExecutionTracker::apply_execution(message, outcome, Utc::now());
        }

        debug!(namespace = %namespace, key, message_id = %id, outcome, "Execution recorded");
        Ok(true)
    }

    /// Drops a whole queue and every clock its messages held. Returns the
    /// number of messages removed.
    pub fn purge(&self, namespace: Namespace, key: &str) -> BrokerResult<usize> {
        let mut state = self.inner.lock()?;
        let Some(queue) = state.queues_mut(namespace).remove(key) else {
            return Ok(0);
        };
        for message in &queue {
            state.tracker.cancel(&message.id);
        }
        debug!(namespace = %namespace, key, removed = queue.len(), "Queue purged");
        Ok(queue.len())
    }

    pub fn remove_by_id(&self, namespace: Namespace, key: &str, id: &MessageId) -> BrokerResult<bool> {
        let mut state = self.inner.lock()?;
        Ok(state.remove_message(namespace, key, id).is_some())
    }

    pub fn contains_key(&self, namespace: Namespace, key: &str) -> BrokerResult<bool> {
        let state = self.inner.lock()?;
        Ok(state.queues(namespace).contains_key(key))
    }

    pub fn dump(&self) -> BrokerResult<QueueDump> {
        let state = self.inner.lock()?;
        Ok(QueueDump {
            users: state.users.clone(),
            jobs: state.jobs.clone(),
        })
    }

    /// Keys holding at least one message created before `cutoff`.
    pub fn stale_keys(&self, cutoff: DateTime<Utc>) -> BrokerResult<Vec<(Namespace, String)>> {
        let state = self.inner.lock()?;
        let mut keys = Vec::new();
        for namespace in [Namespace::User, Namespace::Job] {
            for (key, queue) in state.queues(namespace) {
                if queue.iter().any(|message| message.created_at < cutoff) {
                    keys.push((namespace, key.clone()));
                }
            }
        }
        Ok(keys)
    }

    /// Force-removes messages of one queue created before `cutoff`,
    /// whatever their status.
    pub fn remove_older_than(
        &self,
        namespace: Namespace,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> BrokerResult<usize> {
        let mut state = self.inner.lock()?;
        let stale: Vec<MessageId> = state
            .queues(namespace)
            .get(key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|message| message.created_at < cutoff)
                    .map(|message| message.id)
                    .collect()
            })
            .unwrap_or_default();

        let mut removed = 0;
        for id in &stale {
            if state.remove_message(namespace, key, id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Loads messages from a snapshot, re-arming each clock with the time
    /// it had left. Messages whose id is already present are skipped.
    pub fn restore(&self, dump: QueueDump, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut state = self.inner.lock()?;
        let mut restored = 0;

        let QueueDump { users, jobs } = dump;
        let incoming = users
            .into_iter()
            .map(|entry| (Namespace::User, entry))
            .chain(jobs.into_iter().map(|entry| (Namespace::Job, entry)));

        for (namespace, (key, queue)) in incoming {
            for mut message in queue {
                if state.tracker.phase_of(&message.id).is_some() {
                    warn!(message_id = %message.id, "Skipping duplicate message in snapshot");
                    continue;
                }
                message.namespace = namespace;
                message.key = key.clone();

                let (phase, since) = match message.status {
                    MessageStatus::Pending => (ClockPhase::Fallback, message.created_at),
                    MessageStatus::Executed { executed_at, .. } => (ClockPhase::Grace, executed_at),
                };
                let delay = state.tracker.remaining(phase, since, now);
                self.schedule(&mut state.tracker, namespace, &key, message.id, phase, delay)?;

                state
                    .queues_mut(namespace)
                    .entry(key.clone())
                    .or_default()
                    .push(message);
                restored += 1;
            }
        }

        Ok(restored)
    }

    pub fn armed_clocks(&self) -> BrokerResult<usize> {
        let state = self.inner.lock()?;
        Ok(state.tracker.armed())
    }

    pub fn clock_phase(&self, id: &MessageId) -> BrokerResult<Option<ClockPhase>> {
        let state = self.inner.lock()?;
        Ok(state.tracker.phase_of(id))
    }
}
