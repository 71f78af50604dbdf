use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::error::BrokerResult;
use crate::message::{Message, Namespace};
use crate::registry::{Ping, ServerRegistry};
use crate::store::MessageStore;

/// Messages visible to one polling server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub job_id: String,
    /// Non-empty queues of players currently on the server's roster.
    pub user_messages: BTreeMap<String, Vec<Message>>,
    /// The server's own queue.
    pub job_messages: Vec<Message>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.user_messages.is_empty() && self.job_messages.is_empty()
    }
}

/// The ping/fetch cycle.
#[derive(Clone)]
pub struct PollCoordinator {
    registry: ServerRegistry,
    store: MessageStore,
}

impl PollCoordinator {
    pub fn new(registry: ServerRegistry, store: MessageStore) -> Self {
        Self { registry, store }
    }

    /// Refreshes the caller's liveness record, then collects what it may
    /// see: queues of players on its roster and its own job queue. Player
    /// queues of other servers stay invisible. Nothing is mutated besides
    /// the registry.
    pub fn poll_and_fetch(&self, ping: Ping) -> BrokerResult<PollResult> {
        let job_id = ping.job_id.clone();
        let roster: BTreeSet<String> = ping
            .roster
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        self.registry.register_ping(ping)?;

        let mut result = PollResult {
            job_id: job_id.clone(),
            ..PollResult::default()
        };

        for username in roster {
            let messages = self.store.list_pending(Namespace::User, &username)?;
            if !messages.is_empty() {
                result.user_messages.insert(username, messages);
            }
        }

        result.job_messages = self.store.list_pending(Namespace::Job, &job_id)?;

        debug!(
            job_id = %job_id,
            users = result.user_messages.len(),
            job_messages = result.job_messages.len(),
            "Poll served"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::message::MessageStatus;

    fn setup() -> (PollCoordinator, ServerRegistry, MessageStore) {
        let registry = ServerRegistry::new();
        let store = MessageStore::new(&BrokerConfig::default());
        (
            PollCoordinator::new(registry.clone(), store.clone()),
            registry,
            store,
        )
    }

    #[tokio::test]
    async fn roster_controls_user_visibility() {
        let (poller, _registry, store) = setup();
        let alice = store.enqueue(Namespace::User, "alice", "heal()").expect("enqueue");
        let job = store.enqueue(Namespace::Job, "J1", "announce()").expect("enqueue");

        let with_alice = poller
            .poll_and_fetch(Ping::new("J1", vec!["alice".into()]))
            .expect("poll");
        assert_eq!(with_alice.user_messages["alice"][0].id, alice);
        assert_eq!(with_alice.job_messages[0].id, job);

        let without = poller.poll_and_fetch(Ping::new("J1", Vec::new())).expect("poll");
        assert!(without.user_messages.is_empty());
        assert_eq!(without.job_messages.len(), 1);
    }

    #[tokio::test]
    async fn other_servers_queue_is_invisible() {
        let (poller, _registry, store) = setup();
        store.enqueue(Namespace::Job, "J2", "only for J2").expect("enqueue");

        let result = poller.poll_and_fetch(Ping::new("J1", Vec::new())).expect("poll");
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn poll_registers_server_and_does_not_consume() {
        let (poller, registry, store) = setup();
        store.enqueue(Namespace::User, "bob", "x").expect("enqueue");

        let roster = vec!["bob".to_string(), "bob".to_string(), " ".to_string()];
        let mut ping = Ping::new("J9", roster);
        ping.place_id = Some("1818".into());

        for _ in 0..2 {
            let result = poller.poll_and_fetch(ping.clone()).expect("poll");
            assert_eq!(result.user_messages.len(), 1);
            assert_eq!(result.user_messages["bob"].len(), 1);
            assert_eq!(result.user_messages["bob"][0].status, MessageStatus::Pending);
        }

        let record = registry.get("J9").expect("get").expect("record");
        assert_eq!(record.place_id.as_deref(), Some("1818"));
        assert_eq!(record.player_count, 3);
    }
}
