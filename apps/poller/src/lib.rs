//! Batched ICMP reachability polling.
//!
//! Hosts are probed in batches by one external `fping` process per batch.
//! Per-host cadences are clustered onto few timers, and every host of every
//! batch ends in exactly one published outcome.

pub mod config;
pub mod error;
pub mod monitoring;
pub mod orchestrator;
pub mod roster;
pub mod writer;
