// Janitor task - periodic liveness and age sweep

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::message::Namespace;
use crate::persistence::SnapshotWriter;
use crate::registry::ServerRegistry;
use crate::store::MessageStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_servers: Vec<String>,
    /// Messages dropped by cascade purge of evicted servers.
    pub purged_messages: usize,
    /// Messages dropped for exceeding the age ceiling.
    pub aged_out: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn changed(&self) -> bool {
        !self.evicted_servers.is_empty() || self.purged_messages > 0 || self.aged_out > 0
    }
}

/// Background sweep, independent of request traffic.
///
/// Pass one evicts servers that stopped pinging and purges their job
/// queues. Pass two drops any message older than the age ceiling, which
/// catches messages whose clock never fired. Every key is handled on its
/// own: a failure on one is logged and the sweep moves on.
#[derive(Clone)]
pub struct JanitorSweep {
    registry: ServerRegistry,
    store: MessageStore,
    liveness: Duration,
    max_age: Duration,
    interval: Duration,
    writer: Option<SnapshotWriter>,
}

impl JanitorSweep {
    pub fn new(registry: ServerRegistry, store: MessageStore, config: &BrokerConfig) -> Self {
        Self {
            registry,
            store,
            liveness: config.liveness_window(),
            max_age: config.max_message_age(),
            interval: config.sweep_interval(),
            writer: None,
        }
    }

    /// Marks the snapshot dirty after sweeps that changed something.
    pub fn with_writer(mut self, writer: SnapshotWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        // The purge runs under the registry guard: a server pinging back in
        // meanwhile re-registers only after its stale queue is gone.
        let (mut purged, mut failures) = (0, 0);
        let swept = self
            .registry
            .sweep_expired_with(now, self.liveness, |job_id| {
                match self.store.purge(Namespace::Job, job_id) {
                    Ok(removed) => purged += removed,
                    Err(err) => {
                        failures += 1;
                        warn!(job_id = %job_id, "Janitor: cascade purge failed: {}", err);
                    }
                }
            });
        report.purged_messages += purged;
        report.failures += failures;

        match swept {
            Ok(evicted) => report.evicted_servers.extend(evicted),
            Err(err) => {
                report.failures += 1;
                warn!("Janitor: liveness sweep failed: {}", err);
            }
        }

        let cutoff = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            match self.store.stale_keys(cutoff) {
                Ok(keys) => {
                    for (namespace, key) in keys {
                        match self.store.remove_older_than(namespace, &key, cutoff) {
                            Ok(removed) => {
                                if removed > 0 {
                                    warn!(
                                        namespace = %namespace,
                                        key = %key,
                                        removed,
                                        "Janitor: removed messages past the age ceiling"
                                    );
                                }
                                report.aged_out += removed;
                            }
                            Err(err) => {
                                report.failures += 1;
                                warn!(namespace = %namespace, key = %key, "Janitor: age sweep failed: {}", err);
                            }
                        }
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    warn!("Janitor: age scan failed: {}", err);
                }
            }
        }

        if report.changed() {
            if let Some(writer) = &self.writer {
                writer.mark_dirty();
            }
        }

        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval_secs = self.interval.as_secs(), "Janitor task started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = self.sweep_once(Utc::now());
                if report.changed() || report.failures > 0 {
                    info!(
                        evicted = report.evicted_servers.len(),
                        purged = report.purged_messages,
                        aged_out = report.aged_out,
                        failures = report.failures,
                        "Janitor sweep"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Ping;

    fn setup_with(config: BrokerConfig) -> (JanitorSweep, ServerRegistry, MessageStore) {
        let registry = ServerRegistry::new();
        let store = MessageStore::new(&config);
        let janitor = JanitorSweep::new(registry.clone(), store.clone(), &config);
        (janitor, registry, store)
    }

    fn setup() -> (JanitorSweep, ServerRegistry, MessageStore) {
        setup_with(BrokerConfig::default())
    }

    #[tokio::test]
    async fn eviction_cascades_to_job_queue() {
        let (janitor, registry, store) = setup_with(BrokerConfig {
            max_message_age_secs: 3600,
            ..BrokerConfig::default()
        });
        let t = Utc::now();
        registry
            .register_ping_at(Ping::new("J1", vec!["alice".into()]), t)
            .expect("ping");
        store.enqueue(Namespace::Job, "J1", "a").expect("enqueue");
        store.enqueue(Namespace::Job, "J1", "b").expect("enqueue");
        store.enqueue(Namespace::User, "alice", "c").expect("enqueue");

        let report = janitor.sweep_once(t + chrono::Duration::minutes(6) - chrono::Duration::seconds(61));
        assert!(report.evicted_servers.is_empty());

        let report = janitor.sweep_once(t + chrono::Duration::minutes(6));
        assert_eq!(report.evicted_servers, vec!["J1".to_string()]);
        assert_eq!(report.purged_messages, 2);
        assert!(store.list_pending(Namespace::Job, "J1").expect("list").is_empty());
        assert!(registry.get("J1").expect("get").is_none());
        // Player queues are not owned by the server.
        assert_eq!(store.list_pending(Namespace::User, "alice").expect("list").len(), 1);
    }

    #[tokio::test]
    async fn age_ceiling_removes_executed_and_pending_messages() {
        let (janitor, _registry, store) = setup();
        let pending = store.enqueue(Namespace::User, "bob", "a").expect("enqueue");
        let executed = store.enqueue(Namespace::Job, "J1", "b").expect("enqueue");
        store
            .mark_executed(Namespace::Job, "J1", &executed, true)
            .expect("mark");

        let report = janitor.sweep_once(Utc::now() + chrono::Duration::minutes(6));
        assert_eq!(report.aged_out, 2);
        assert_eq!(report.failures, 0);
        assert!(!store.contains_key(Namespace::User, "bob").expect("contains"));
        assert!(!store.contains_key(Namespace::Job, "J1").expect("contains"));
        assert!(store.clock_phase(&pending).expect("phase").is_none());
        assert_eq!(store.armed_clocks().expect("clocks"), 0);
    }

    #[tokio::test]
    async fn quiet_sweep_reports_no_change() {
        let (janitor, registry, store) = setup();
        registry.register_ping(Ping::new("J1", Vec::new())).expect("ping");
        store.enqueue(Namespace::Job, "J1", "a").expect("enqueue");

        let report = janitor.sweep_once(Utc::now());
        assert!(!report.changed());
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_janitor_runs_on_interval() {
        let config = BrokerConfig {
            sweep_interval_secs: 1,
            liveness_secs: 0,
            ..BrokerConfig::default()
        };
        let registry = ServerRegistry::new();
        let store = MessageStore::new(&config);
        registry
            .register_ping_at(
                Ping::new("J1", Vec::new()),
                Utc::now() - chrono::Duration::seconds(5),
            )
            .expect("ping");
        store.enqueue(Namespace::Job, "J1", "a").expect("enqueue");

        let task = JanitorSweep::new(registry.clone(), store.clone(), &config).spawn();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(registry.is_empty().expect("empty"));
        assert!(!store.contains_key(Namespace::Job, "J1").expect("contains"));
        task.abort();
    }
}
