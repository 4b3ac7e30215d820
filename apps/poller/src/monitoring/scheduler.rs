//! Cadence scheduler - multiplexes per-host cadences onto few timers.
//!
//! Distinct cadences are processed in ascending order. A cadence divisible by
//! an existing base joins that base as multiplier group `cadence / base`;
//! otherwise it becomes a new base. When several bases divide a cadence the
//! smallest one is used. Each base owns one periodic timer, first firing after
//! half a period so bases do not all start together.
//!
//! On tick `n` of a base every group whose multiplier divides `n` is due. The
//! timers fire at a fixed cadence regardless of probe results; a failed host
//! is simply probed again on its next natural tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, trace, warn};

use super::pool::BatchSink;
use super::types::{BatchId, BatchIds, BatchOrigin, ProbeBatch};
use crate::roster::Roster;

/// Root of a cadence cluster, driving exactly one timer
#[derive(Debug)]
pub struct Base {
    base_seconds: u64,
    tick: AtomicU64,
    /// multiplier -> addresses; effective cadence is `base_seconds * multiplier`
    groups: BTreeMap<u64, BTreeSet<String>>,
}

impl Base {
    fn new(base_seconds: u64, groups: BTreeMap<u64, BTreeSet<String>>) -> Self {
        Self { base_seconds, tick: AtomicU64::new(0), groups }
    }

    pub fn base_seconds(&self) -> u64 {
        self.base_seconds
    }

    pub fn groups(&self) -> &BTreeMap<u64, BTreeSet<String>> {
        &self.groups
    }

    /// Ticks fired so far
    pub fn ticks(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Count one timer firing and return its tick number, starting at 1
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Hosts due on tick `tick` with their effective cadence
    pub fn due_hosts(&self, tick: u64) -> BTreeMap<String, u64> {
        self.groups
            .iter()
            .filter(|(multiplier, _)| tick % **multiplier == 0)
            .flat_map(|(multiplier, addresses)| {
                let cadence = self.base_seconds * multiplier;
                addresses.iter().map(move |address| (address.clone(), cadence))
            })
            .collect()
    }

    pub fn host_count(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }
}

/// Immutable cluster structure built from one roster snapshot
#[derive(Debug, Default)]
pub struct ClusterPlan {
    bases: Vec<Arc<Base>>,
}

impl ClusterPlan {
    /// Cluster the roster's cadences by divisibility
    pub fn build(roster: &Roster) -> Self {
        let mut by_cadence: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
        for (address, cadence) in roster.iter() {
            by_cadence.entry(cadence).or_default().insert(address.to_string());
        }

        // ascending by construction, so the first divisor found is the smallest
        let mut bases: Vec<(u64, BTreeMap<u64, BTreeSet<String>>)> = Vec::new();
        for (cadence, addresses) in by_cadence {
            match bases.iter_mut().find(|(base, _)| cadence % *base == 0) {
                Some((base, groups)) => {
                    groups.insert(cadence / *base, addresses);
                }
                None => {
                    bases.push((cadence, BTreeMap::from([(1, addresses)])));
                }
            }
        }

        Self {
            bases: bases
                .into_iter()
                .map(|(base_seconds, groups)| Arc::new(Base::new(base_seconds, groups)))
                .collect(),
        }
    }

    pub fn bases(&self) -> &[Arc<Base>] {
        &self.bases
    }

    pub fn base(&self, base_seconds: u64) -> Option<&Arc<Base>> {
        self.bases.iter().find(|base| base.base_seconds == base_seconds)
    }

    /// Number of timers this plan runs
    pub fn timer_count(&self) -> usize {
        self.bases.len()
    }

    pub fn host_count(&self) -> usize {
        self.bases.iter().map(|base| base.host_count()).sum()
    }
}

struct Generation {
    plan: Arc<ClusterPlan>,
    timers: Vec<JoinHandle<()>>,
}

/// Owns the cluster structure and its timers
pub struct CadenceScheduler {
    sink: Arc<dyn BatchSink>,
    batch_ids: Arc<BatchIds>,
    current: Mutex<Option<Generation>>,
}

impl CadenceScheduler {
    pub fn new(sink: Arc<dyn BatchSink>, batch_ids: Arc<BatchIds>) -> Self {
        Self { sink, batch_ids, current: Mutex::new(None) }
    }

    /// Rebuild the cluster structure from a roster and swap it in.
    ///
    /// Timers of the previous structure are stopped; tick counters start over.
    /// Must be called inside a tokio runtime.
    pub fn reload(&self, roster: &Roster) -> Arc<ClusterPlan> {
        let plan = Arc::new(ClusterPlan::build(roster));
        info!(
            hosts = plan.host_count(),
            cadences = roster.distinct_cadences().len(),
            timers = plan.timer_count(),
            "Cadence clusters built"
        );
        for base in plan.bases() {
            debug!(
                base_seconds = base.base_seconds(),
                multipliers = ?base.groups().keys().collect::<Vec<_>>(),
                hosts = base.host_count(),
                "Base timer"
            );
        }

        let timers = plan
            .bases()
            .iter()
            .map(|base| spawn_base_timer(base.clone(), self.sink.clone(), self.batch_ids.clone()))
            .collect();

        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Generation { plan: plan.clone(), timers });
        if let Some(previous) = previous {
            debug!(timers = previous.timers.len(), "Stopping previous base timers");
            previous.timers.iter().for_each(JoinHandle::abort);
        }

        plan
    }

    /// The cluster structure currently driving the timers
    pub fn plan(&self) -> Option<Arc<ClusterPlan>> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|generation| generation.plan.clone()))
    }

    /// Stop every timer
    pub fn stop(&self) {
        let previous = self.current.lock().ok().and_then(|mut current| current.take());
        if let Some(previous) = previous {
            previous.timers.iter().for_each(JoinHandle::abort);
            info!(timers = previous.timers.len(), "Cadence scheduler stopped");
        }
    }
}

impl Drop for CadenceScheduler {
    fn drop(&mut self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(generation) = current.take() {
                generation.timers.iter().for_each(JoinHandle::abort);
            }
        }
    }
}

fn spawn_base_timer(
    base: Arc<Base>,
    sink: Arc<dyn BatchSink>,
    batch_ids: Arc<BatchIds>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(base.base_seconds());
        let mut timer = interval_at(Instant::now() + period / 2, period);

        loop {
            timer.tick().await;
            fire(&base, sink.as_ref(), &batch_ids);
        }
    })
}

/// Handle one timer firing. Never waits on probing.
pub fn fire(base: &Base, sink: &dyn BatchSink, batch_ids: &BatchIds) -> Option<BatchId> {
    let tick = base.advance();
    let due = base.due_hosts(tick);
    if due.is_empty() {
        trace!(base_seconds = base.base_seconds(), tick, "Nothing due");
        return None;
    }

    let batch = ProbeBatch::new(
        batch_ids.next(),
        due,
        BatchOrigin::Cadence { base_seconds: base.base_seconds(), tick },
    );
    let batch_id = batch.id;
    debug!(batch = %batch_id, base_seconds = base.base_seconds(), tick, hosts = batch.len(), "Tick");

    // a rejected batch has already been answered with ERROR outcomes
    if let Err(e) = sink.submit(batch) {
        warn!(batch = %batch_id, "Tick batch not queued: {}", e);
    }
    Some(batch_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::testing::RecordingSink;
    use crate::monitoring::types::Host;
    use std::collections::HashMap;

    fn roster(entries: &[(&str, u64)]) -> Roster {
        entries.iter().map(|(address, cadence)| Host::new(*address, *cadence)).collect()
    }

    fn set(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_five_and_ten_share_a_base() {
        let plan = ClusterPlan::build(&roster(&[("10.0.0.1", 5), ("10.0.0.2", 10)]));

        assert_eq!(plan.timer_count(), 1);
        let base = plan.base(5).unwrap();
        assert_eq!(base.groups()[&1], set(&["10.0.0.1"]));
        assert_eq!(base.groups()[&2], set(&["10.0.0.2"]));

        let first = base.due_hosts(1);
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["10.0.0.1"]);
        let second = base.due_hosts(2);
        assert_eq!(second.len(), 2);
        assert_eq!(second["10.0.0.1"], 5);
        assert_eq!(second["10.0.0.2"], 10);
    }

    #[test]
    fn test_divisible_cadence_never_gets_own_timer() {
        let plan = ClusterPlan::build(&roster(&[("a", 10), ("b", 30), ("c", 60), ("d", 20)]));

        assert_eq!(plan.timer_count(), 1);
        let base = plan.base(10).unwrap();
        assert_eq!(base.groups().keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 6]);
    }

    #[test]
    fn test_coprime_cadences_get_independent_timers() {
        let plan = ClusterPlan::build(&roster(&[("a", 7), ("b", 11), ("c", 13)]));
        assert_eq!(plan.timer_count(), 3);
        assert!(plan.bases().iter().all(|base| base.groups().len() == 1));
    }

    #[test]
    fn test_smallest_divisor_base_wins() {
        // 6 is divisible by both 2 and 3
        let plan = ClusterPlan::build(&roster(&[("a", 2), ("b", 3), ("c", 6), ("d", 9)]));

        assert_eq!(plan.timer_count(), 2);
        assert_eq!(plan.base(2).unwrap().groups()[&3], set(&["c"]));
        assert_eq!(plan.base(3).unwrap().groups()[&3], set(&["d"]));
    }

    #[test]
    fn test_empty_roster() {
        let plan = ClusterPlan::build(&Roster::new());
        assert_eq!(plan.timer_count(), 0);
        assert_eq!(plan.host_count(), 0);
    }

    #[test]
    fn test_every_cadence_is_an_exact_multiple_of_its_base() {
        let entries: Vec<(String, u64)> =
            (1..=60).map(|cadence| (format!("h{cadence}"), cadence)).collect();
        let roster: Roster = entries.iter().map(|(a, c)| Host::new(a.as_str(), *c)).collect();
        let plan = ClusterPlan::build(&roster);

        assert_eq!(plan.host_count(), 60);
        for base in plan.bases() {
            for (multiplier, addresses) in base.groups() {
                for address in addresses {
                    assert_eq!(roster.cadence_of(address), Some(base.base_seconds() * multiplier));
                }
            }
        }
    }

    #[test]
    fn test_due_sets_are_drift_free() {
        let cadences = [1, 2, 3, 4, 5, 6, 7, 9, 10, 12, 15, 20, 30, 45, 60, 90];
        let roster: Roster =
            cadences.iter().map(|c| Host::new(format!("h{c}"), *c)).collect();
        let plan = ClusterPlan::build(&roster);
        let horizon_ms: u64 = 600_000;

        // time of tick n of a base: base/2 + (n-1) * base
        let mut appearances: HashMap<String, Vec<u64>> = HashMap::new();
        for base in plan.bases() {
            let period_ms = base.base_seconds() * 1000;
            let mut at = period_ms / 2;
            while at <= horizon_ms {
                let tick = base.advance();
                for address in base.due_hosts(tick).into_keys() {
                    appearances.entry(address).or_default().push(at);
                }
                at += period_ms;
            }
        }

        for cadence in cadences {
            let times = &appearances[&format!("h{cadence}")];
            assert!(times[0] <= cadence * 1000 + cadence * 500);
            for pair in times.windows(2) {
                assert_eq!(pair[1] - pair[0], cadence * 1000, "cadence {cadence}");
            }
        }
    }

    #[test]
    fn test_fire_counts_ticks_and_allocates_ids() {
        let plan = ClusterPlan::build(&roster(&[("10.0.0.1", 5), ("10.0.0.2", 10)]));
        let base = plan.base(5).unwrap();
        let sink = RecordingSink::default();
        let ids = BatchIds::new();

        let first = fire(base, &sink, &ids).unwrap();
        let second = fire(base, &sink, &ids).unwrap();
        assert!(second > first);
        assert_eq!(base.ticks(), 2);

        let batches = sink.take();
        assert_eq!(batches[0].origin, BatchOrigin::Cadence { base_seconds: 5, tick: 1 });
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_staggered() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = CadenceScheduler::new(sink.clone(), Arc::new(BatchIds::new()));
        scheduler.reload(&roster(&[("10.0.0.1", 5), ("10.0.0.2", 10)]));

        // first tick after half a period
        tokio::time::sleep(Duration::from_millis(2400)).await;
        assert!(sink.take().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batches = sink.take();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].hosts.keys().collect::<Vec<_>>(), vec!["10.0.0.1"]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let batches = sink.take();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].origin, BatchOrigin::Cadence { base_seconds: 5, tick: 2 });

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_swaps_structure() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = CadenceScheduler::new(sink.clone(), Arc::new(BatchIds::new()));

        scheduler.reload(&roster(&[("old", 5)]));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.take().len(), 1);

        let plan = scheduler.reload(&roster(&[("new", 7)]));
        assert_eq!(plan.base(7).unwrap().ticks(), 0);
        assert!(Arc::ptr_eq(&scheduler.plan().unwrap(), &plan));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let batches = sink.take();
        assert!(!batches.is_empty());
        assert!(batches.iter().all(|b| b.hosts.keys().all(|a| a == "new")));

        scheduler.stop();
        assert!(scheduler.plan().is_none());
    }
}
