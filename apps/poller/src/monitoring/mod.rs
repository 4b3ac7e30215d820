/// Batched reachability polling
///
/// This module is responsible for:
/// - Grouping host cadences onto shared timers
/// - Running one probe process per batch with a hard deadline
/// - Parsing probe summaries into per-host outcomes
/// - Publishing every outcome on the success or failure channel
pub mod bus;
pub mod executor;
pub mod parser;
pub mod pool;
pub mod probe;
pub mod scheduler;
pub mod sweeper;
pub mod types;

#[cfg(test)]
mod testing;

pub use bus::{Channel, OutcomeBus};
pub use executor::BatchProbeExecutor;
pub use pool::{BatchSink, ProbePool};
pub use probe::{Fping, ProbeTool};
pub use scheduler::{CadenceScheduler, ClusterPlan};
pub use sweeper::{MemoryStore, RosterStore, StoreSweeper};
pub use types::{BatchIds, OutcomeEvent, ProbeCause, ProbeOutcome};
