//! Store-driven polling.
//!
//! Instead of per-cadence timers, a single sweep periodically asks a roster
//! store which hosts are due and probes them as one batch. Hosts are marked
//! polled only after a conclusive result, so a failed probe stays due and is
//! retried on the next sweep.

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::pool::ProbePool;
use super::types::{BatchId, BatchIds, BatchOrigin, Host, ProbeBatch};
use crate::roster::Roster;

/// Persistent source of hosts and their last poll times
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Hosts whose cadence has elapsed since their last poll, or never polled
    async fn list_due_hosts(&self, now: SystemTime) -> anyhow::Result<Vec<Host>>;

    /// Record a conclusive poll of `address`; it is next due `cadence_seconds` after `at`
    async fn mark_polled(
        &self,
        address: &str,
        cadence_seconds: u64,
        at: SystemTime,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct StoreEntry {
    cadence_seconds: u64,
    last_polled: Option<SystemTime>,
    /// `None` until first polled, which makes the host due
    next_due: Option<SystemTime>,
}

impl StoreEntry {
    fn new(cadence_seconds: u64) -> Self {
        Self { cadence_seconds, last_polled: None, next_due: None }
    }

    fn is_due(&self, now: SystemTime) -> bool {
        self.next_due.is_none_or(|next_due| now >= next_due)
    }
}

/// In-process roster store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_roster(roster: &Roster) -> Self {
        let entries = roster
            .iter()
            .map(|(address, cadence_seconds)| (address.to_string(), StoreEntry::new(cadence_seconds)))
            .collect();
        Self { entries: RwLock::new(entries) }
    }

    /// Add a host or change its cadence. New hosts are due immediately; a
    /// changed cadence applies from the next poll.
    pub async fn upsert(&self, host: Host) {
        let mut entries = self.entries.write().await;
        entries
            .entry(host.address)
            .and_modify(|entry| entry.cadence_seconds = host.cadence_seconds)
            .or_insert_with(|| StoreEntry::new(host.cadence_seconds));
    }

    /// Make the store hold exactly the roster's hosts. Poll history of hosts
    /// that stay is kept. Returns how many hosts were removed.
    pub async fn sync(&self, roster: &Roster) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|address, _| roster.cadence_of(address).is_some());
        let removed = before - entries.len();

        for (address, cadence_seconds) in roster.iter() {
            entries
                .entry(address.to_string())
                .and_modify(|entry| entry.cadence_seconds = cadence_seconds)
                .or_insert_with(|| StoreEntry::new(cadence_seconds));
        }
        removed
    }

    pub async fn remove(&self, address: &str) -> bool {
        self.entries.write().await.remove(address).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn last_polled(&self, address: &str) -> Option<SystemTime> {
        self.entries.read().await.get(address).and_then(|entry| entry.last_polled)
    }
}

#[async_trait]
impl RosterStore for MemoryStore {
    async fn list_due_hosts(&self, now: SystemTime) -> anyhow::Result<Vec<Host>> {
        let entries = self.entries.read().await;
        let mut due: Vec<Host> = entries
            .iter()
            .filter(|(_, entry)| entry.is_due(now))
            .map(|(address, entry)| Host::new(address.as_str(), entry.cadence_seconds))
            .collect();
        due.sort();
        Ok(due)
    }

    async fn mark_polled(
        &self,
        address: &str,
        cadence_seconds: u64,
        at: SystemTime,
    ) -> anyhow::Result<()> {
        match self.entries.write().await.get_mut(address) {
            Some(entry) => {
                let next_due = at
                    .checked_add(Duration::from_secs(cadence_seconds))
                    .ok_or_else(|| anyhow!("cadence {cadence_seconds}s puts the next poll out of range"))?;
                entry.last_polled = Some(at);
                entry.next_due = Some(next_due);
            }
            // removed while its batch was in flight
            None => debug!(address, "Polled host no longer in store"),
        }
        Ok(())
    }
}

/// Releases a batch's hosts for later sweeps when dropped, even if the
/// completion task panics
struct InFlight {
    hosts: Arc<Mutex<HashSet<String>>>,
    addresses: Vec<String>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        for address in &self.addresses {
            hosts.remove(address);
        }
    }
}

/// A batch started by one sweep
pub struct Sweep {
    pub batch_id: BatchId,
    pub hosts: usize,
    /// Resolves once poll times are recorded
    pub done: JoinHandle<()>,
}

pub struct StoreSweeper {
    store: Arc<dyn RosterStore>,
    pool: Arc<ProbePool>,
    batch_ids: Arc<BatchIds>,
    interval: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl StoreSweeper {
    pub fn new(
        store: Arc<dyn RosterStore>,
        pool: Arc<ProbePool>,
        batch_ids: Arc<BatchIds>,
        interval: Duration,
    ) -> Self {
        Self { store, pool, batch_ids, interval, in_flight: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Run sweeps every `interval` until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_seconds = self.interval.as_secs(), "Store sweeper started");
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!("Sweep failed: {:#}", e);
                }
            }
        })
    }

    /// Submit every due host that is not already being probed as one batch
    pub async fn sweep(&self) -> anyhow::Result<Option<Sweep>> {
        let due = self.store.list_due_hosts(SystemTime::now()).await?;

        let hosts: BTreeMap<String, u64> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            due.into_iter()
                .filter(|host| in_flight.insert(host.address.clone()))
                .map(|host| (host.address, host.cadence_seconds))
                .collect()
        };
        if hosts.is_empty() {
            debug!("Nothing due");
            return Ok(None);
        }

        let batch = ProbeBatch::new(self.batch_ids.next(), hosts, BatchOrigin::Sweep);
        let batch_id = batch.id;
        let cadences = batch.hosts.clone();
        debug!(batch = %batch_id, hosts = cadences.len(), "Sweep batch");

        let report = self.pool.submit_with_report(batch);
        let store = self.store.clone();
        let in_flight = InFlight { hosts: self.in_flight.clone(), addresses: cadences.keys().cloned().collect() };
        let hosts = cadences.len();

        let done = tokio::spawn(async move {
            let _in_flight = in_flight;
            match report.await {
                Ok(report) => {
                    let now = SystemTime::now();
                    for (address, cadence_seconds) in &cadences {
                        let conclusive = report
                            .outcomes
                            .get(address)
                            .is_some_and(|outcome| outcome.cause.is_conclusive());
                        if !conclusive {
                            continue;
                        }
                        if let Err(e) = store.mark_polled(address, *cadence_seconds, now).await {
                            warn!(address = %address, "Failed to record poll: {:#}", e);
                        }
                    }
                }
                Err(_) => warn!(batch = %batch_id, "Batch report dropped"),
            }
        });

        Ok(Some(Sweep { batch_id, hosts, done }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    async fn due_addresses(store: &MemoryStore, now: SystemTime) -> Vec<String> {
        store.list_due_hosts(now).await.unwrap().into_iter().map(|h| h.address).collect()
    }

    #[tokio::test]
    async fn test_new_hosts_due_immediately() {
        let store = MemoryStore::new();
        store.upsert(Host::new("10.0.0.1", 30)).await;
        assert_eq!(due_addresses(&store, at(1000)).await, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_due_after_cadence_elapses() {
        let roster: Roster = [Host::new("10.0.0.1", 30), Host::new("10.0.0.2", 60)].into_iter().collect();
        let store = MemoryStore::from_roster(&roster);

        store.mark_polled("10.0.0.1", 30, at(1000)).await.unwrap();
        store.mark_polled("10.0.0.2", 60, at(1000)).await.unwrap();

        assert!(due_addresses(&store, at(1029)).await.is_empty());
        assert_eq!(due_addresses(&store, at(1030)).await, vec!["10.0.0.1"]);
        assert_eq!(due_addresses(&store, at(1060)).await, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_cadence_change_applies_from_next_poll() {
        let store = MemoryStore::new();
        store.upsert(Host::new("10.0.0.1", 30)).await;
        store.mark_polled("10.0.0.1", 30, at(1000)).await.unwrap();
        store.upsert(Host::new("10.0.0.1", 10)).await;

        assert_eq!(store.last_polled("10.0.0.1").await, Some(at(1000)));
        assert!(due_addresses(&store, at(1010)).await.is_empty());
        assert_eq!(due_addresses(&store, at(1030)).await, vec!["10.0.0.1"]);

        let due = store.list_due_hosts(at(1030)).await.unwrap();
        assert_eq!(due[0].cadence_seconds, 10);
    }

    #[tokio::test]
    async fn test_remove_and_mark_unknown() {
        let store = MemoryStore::new();
        store.upsert(Host::new("10.0.0.1", 30)).await;
        assert!(store.remove("10.0.0.1").await);
        assert!(!store.remove("10.0.0.1").await);
        assert!(store.mark_polled("10.0.0.1", 30, at(5)).await.is_ok());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_sync_with_reloaded_roster() {
        let store = MemoryStore::new();
        store.upsert(Host::new("10.0.0.1", 30)).await;
        store.upsert(Host::new("10.0.0.2", 30)).await;
        store.mark_polled("10.0.0.1", 30, at(1000)).await.unwrap();

        let roster: Roster = [Host::new("10.0.0.1", 60), Host::new("10.0.0.3", 5)].into_iter().collect();
        assert_eq!(store.sync(&roster).await, 1);

        assert_eq!(store.len().await, 2);
        assert_eq!(store.last_polled("10.0.0.1").await, Some(at(1000)));
        assert_eq!(due_addresses(&store, at(1010)).await, vec!["10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_out_of_range_cadence_is_an_error() {
        let store = MemoryStore::new();
        store.upsert(Host::new("10.0.0.1", u64::MAX)).await;

        assert!(store.mark_polled("10.0.0.1", u64::MAX, at(1000)).await.is_err());
        assert!(store.last_polled("10.0.0.1").await.is_none());
        assert_eq!(due_addresses(&store, at(1000)).await, vec!["10.0.0.1"]);
    }

    #[cfg(unix)]
    mod sweeping {
        use super::*;
        use crate::monitoring::bus::OutcomeBus;
        use crate::monitoring::testing::script_executor;

        const FIRST_ONLY: &str = r#"echo "$1 : xmt/rcv/%loss = 3/3/0%, min/avg/max = 1.0/2.0/3.0""#;
        const SLOW_FIRST_ONLY: &str = r#"sleep 0.5; echo "$1 : xmt/rcv/%loss = 3/3/0%, min/avg/max = 1.0/2.0/3.0""#;

        /// Store whose poll recording blows up
        struct PanickingStore;

        #[async_trait]
        impl RosterStore for PanickingStore {
            async fn list_due_hosts(&self, _now: SystemTime) -> anyhow::Result<Vec<Host>> {
                Ok(vec![Host::new("10.0.0.1", 60)])
            }

            async fn mark_polled(&self, _address: &str, _cadence: u64, _at: SystemTime) -> anyhow::Result<()> {
                panic!("store failure");
            }
        }

        fn sweeper(script: &'static str, store: Arc<dyn RosterStore>) -> StoreSweeper {
            let pool = Arc::new(ProbePool::start(1, 4, script_executor(script, 5000), OutcomeBus::new(64)));
            StoreSweeper::new(store, pool, Arc::new(BatchIds::new()), Duration::from_secs(5))
        }

        #[tokio::test]
        async fn test_only_conclusive_hosts_marked() {
            let store = Arc::new(MemoryStore::new());
            store.upsert(Host::new("10.0.0.1", 60)).await;
            store.upsert(Host::new("10.0.0.2", 60)).await;
            let sweeper = sweeper(FIRST_ONLY, store.clone());

            let sweep = sweeper.sweep().await.unwrap().unwrap();
            assert_eq!(sweep.hosts, 2);
            sweep.done.await.unwrap();

            assert!(store.last_polled("10.0.0.1").await.is_some());
            // missing from probe output, stays due
            assert!(store.last_polled("10.0.0.2").await.is_none());
            assert_eq!(due_addresses(&store, SystemTime::now()).await, vec!["10.0.0.2"]);
        }

        #[tokio::test]
        async fn test_in_flight_hosts_skipped() {
            let store = Arc::new(MemoryStore::new());
            store.upsert(Host::new("10.0.0.1", 60)).await;
            let sweeper = sweeper(SLOW_FIRST_ONLY, store.clone());

            let first = sweeper.sweep().await.unwrap().unwrap();
            assert!(sweeper.sweep().await.unwrap().is_none());

            first.done.await.unwrap();
            assert!(store.last_polled("10.0.0.1").await.is_some());

            // back in the pool once the batch finished
            store.upsert(Host::new("10.0.0.3", 60)).await;
            let second = sweeper.sweep().await.unwrap().unwrap();
            assert_eq!(second.hosts, 1);
            assert!(second.batch_id > first.batch_id);
            second.done.await.unwrap();
        }

        #[tokio::test]
        async fn test_nothing_due() {
            let store = Arc::new(MemoryStore::new());
            let sweeper = sweeper(FIRST_ONLY, store);
            assert!(sweeper.sweep().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_host_released_after_panicking_store() {
            let sweeper = sweeper(FIRST_ONLY, Arc::new(PanickingStore));

            let first = sweeper.sweep().await.unwrap().unwrap();
            assert!(first.done.await.is_err());

            let again = sweeper.sweep().await.unwrap().unwrap();
            assert_eq!(again.hosts, 1);
            assert!(again.done.await.is_err());
        }

        #[tokio::test]
        async fn test_unrecordable_cadence_stays_due() {
            let store = Arc::new(MemoryStore::new());
            store.upsert(Host::new("10.0.0.1", u64::MAX)).await;
            let sweeper = sweeper(FIRST_ONLY, store.clone());

            sweeper.sweep().await.unwrap().unwrap().done.await.unwrap();
            assert!(store.last_polled("10.0.0.1").await.is_none());
            assert_eq!(sweeper.sweep().await.unwrap().unwrap().hosts, 1);
        }
    }
}
