use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};

/// What a game server reports on every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping {
    pub job_id: String,
    pub place_id: Option<String>,
    pub roster: Vec<String>,
    pub player_count: u32,
}

impl Ping {
    pub fn new(job_id: impl Into<String>, roster: Vec<String>) -> Self {
        let player_count = u32::try_from(roster.len()).unwrap_or(u32::MAX);
        Self {
            job_id: job_id.into(),
            place_id: None,
            roster,
            player_count,
        }
    }
}

/// Last known state of one game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub job_id: String,
    pub place_id: Option<String>,
    pub last_ping_at: DateTime<Utc>,
    pub roster: Vec<String>,
    pub player_count: u32,
}

impl ServerRecord {
    /// `now - last_ping_at > window`. A ping stamped in the future is
    /// never expired.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        (now - self.last_ping_at)
            .to_std()
            .map(|elapsed| elapsed > window)
            .unwrap_or(false)
    }
}

/// Liveness table keyed by job id.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    records: Arc<Mutex<HashMap<String, ServerRecord>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, HashMap<String, ServerRecord>>> {
        self.records
            .lock()
            .map_err(|_| BrokerError::Poisoned("server registry"))
    }

    pub fn register_ping(&self, ping: Ping) -> BrokerResult<()> {
        self.register_ping_at(ping, Utc::now())
    }

    /// Upserts the record for `ping.job_id`, stamping it with `at`.
    pub fn register_ping_at(&self, ping: Ping, at: DateTime<Utc>) -> BrokerResult<()> {
        let Ping {
            job_id,
            place_id,
            roster,
            player_count,
        } = ping;

        let mut records = self.lock()?;
        let fresh = !records.contains_key(&job_id);
        records.insert(
            job_id.clone(),
            ServerRecord {
                job_id: job_id.clone(),
                place_id,
                last_ping_at: at,
                roster,
                player_count,
            },
        );

        if fresh {
            info!(job_id = %job_id, "Server registered");
        } else {
            debug!(job_id = %job_id, player_count, "Server ping");
        }
        Ok(())
    }

    /// Removes every record whose last ping is older than `window` and
    /// returns the evicted job ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>, window: Duration) -> BrokerResult<BTreeSet<String>> {
        self.sweep_expired_with(now, window, |_| {})
    }

    /// Like [`sweep_expired`](Self::sweep_expired), calling `on_evict` for
    /// each evicted job id while the registry guard is still held. A ping
    /// for that job id cannot land until the callback returns.
    pub fn sweep_expired_with<F>(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        mut on_evict: F,
    ) -> BrokerResult<BTreeSet<String>>
    where
        F: FnMut(&str),
    {
        let mut records = self.lock()?;
        let expired: BTreeSet<String> = records
            .values()
            .filter(|record| record.is_expired(now, window))
            .map(|record| record.job_id.clone())
            .collect();

        for job_id in &expired {
            records.remove(job_id);
            info!(job_id = %job_id, "Server timed out");
            on_evict(job_id);
        }

        Ok(expired)
    }

    pub fn get(&self, job_id: &str) -> BrokerResult<Option<ServerRecord>> {
        Ok(self.lock()?.get(job_id).cloned())
    }

    /// All records, ordered by job id.
    pub fn records(&self) -> BrokerResult<Vec<ServerRecord>> {
        let records = self.lock()?;
        let mut all: Vec<ServerRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(all)
    }

    pub fn len(&self) -> BrokerResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> BrokerResult<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Reinstates records from a snapshot. Newer live pings win.
    pub fn restore(&self, snapshot: Vec<ServerRecord>) -> BrokerResult<usize> {
        let mut records = self.lock()?;
        let mut restored = 0;
        for record in snapshot {
            let newer = records
                .get(&record.job_id)
                .map(|current| current.last_ping_at >= record.last_ping_at)
                .unwrap_or(false);
            if newer {
                continue;
            }
            records.insert(record.job_id.clone(), record);
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn ping_upserts_record() {
        let registry = ServerRegistry::new();
        registry
            .register_ping(Ping::new("J1", roster(&["alice"])))
            .expect("ping");
        registry
            .register_ping(Ping::new("J1", roster(&["alice", "bob"])))
            .expect("ping");

        assert_eq!(registry.len().expect("len"), 1);
        let record = registry.get("J1").expect("get").expect("record");
        assert_eq!(record.roster, roster(&["alice", "bob"]));
        assert_eq!(record.player_count, 2);
    }

    #[test]
    fn sweep_evicts_only_stale_records() {
        let registry = ServerRegistry::new();
        let t = Utc::now();
        registry
            .register_ping_at(Ping::new("J1", Vec::new()), t)
            .expect("ping");
        registry
            .register_ping_at(Ping::new("J2", Vec::new()), t + chrono::Duration::minutes(3))
            .expect("ping");

        let window = Duration::from_secs(5 * 60);
        let evicted = registry
            .sweep_expired(t + chrono::Duration::minutes(6), window)
            .expect("sweep");

        assert_eq!(evicted.into_iter().collect::<Vec<_>>(), vec!["J1".to_string()]);
        assert!(registry.get("J1").expect("get").is_none());
        assert!(registry.get("J2").expect("get").is_some());
    }

    #[test]
    fn record_at_exact_window_is_kept() {
        let t = Utc::now();
        let record = ServerRecord {
            job_id: "J1".into(),
            place_id: None,
            last_ping_at: t,
            roster: Vec::new(),
            player_count: 0,
        };
        let window = Duration::from_secs(300);
        assert!(!record.is_expired(t + chrono::Duration::seconds(300), window));
        assert!(record.is_expired(t + chrono::Duration::seconds(301), window));
        assert!(!record.is_expired(t - chrono::Duration::seconds(10), window));
    }

    #[test]
    fn restore_does_not_override_newer_pings() {
        let registry = ServerRegistry::new();
        let t = Utc::now();
        registry
            .register_ping_at(Ping::new("J1", roster(&["live"])), t)
            .expect("ping");

        let stale = ServerRecord {
            job_id: "J1".into(),
            place_id: None,
            last_ping_at: t - chrono::Duration::minutes(1),
            roster: roster(&["stale"]),
            player_count: 1,
        };
        let other = ServerRecord {
            job_id: "J2".into(),
            ..stale.clone()
        };

        assert_eq!(registry.restore(vec![stale, other]).expect("restore"), 1);
        let record = registry.get("J1").expect("get").expect("record");
        assert_eq!(record.roster, roster(&["live"]));
        assert_eq!(registry.records().expect("records").len(), 2);
    }

    #[test]
    fn eviction_callback_runs_under_the_guard() {
        let registry = ServerRegistry::new();
        let t = Utc::now();
        registry
            .register_ping_at(Ping::new("J1", Vec::new()), t)
            .expect("ping");
        registry
            .register_ping_at(Ping::new("J2", Vec::new()), t + chrono::Duration::minutes(5))
            .expect("ping");

        let mut seen = Vec::new();
        let evicted = registry
            .sweep_expired_with(t + chrono::Duration::minutes(6), Duration::from_secs(300), |job_id| {
                assert!(registry.records.try_lock().is_err());
                seen.push(job_id.to_string());
            })
            .expect("sweep");

        assert_eq!(seen, vec!["J1".to_string()]);
        assert_eq!(evicted.into_iter().collect::<Vec<_>>(), seen);
        assert!(registry.get("J2").expect("get").is_some());
    }
}
