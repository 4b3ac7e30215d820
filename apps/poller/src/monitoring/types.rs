use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::OutcomeError;

/// A host under management. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub cadence_seconds: u64,
}

impl Host {
    pub fn new(address: impl Into<String>, cadence_seconds: u64) -> Self {
        Self { address: address.into(), cadence_seconds }
    }
}

/// Terminal cause attached to every probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeCause {
    /// Parsed and reachable
    Ok,
    /// Parsed, every packet lost. A successful probe reporting unreachability.
    Down,
    /// Probe process killed at the batch deadline
    Timeout,
    /// Process failed to start, crashed, or produced no usable output
    Error,
    /// Output present but this host's line absent
    HostMissing,
}

impl ProbeCause {
    /// Whether the probe itself ran to completion for this host
    pub fn is_conclusive(self) -> bool {
        matches!(self, ProbeCause::Ok | ProbeCause::Down)
    }
}

impl fmt::Display for ProbeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeCause::Ok => write!(f, "OK"),
            ProbeCause::Down => write!(f, "DOWN"),
            ProbeCause::Timeout => write!(f, "TIMEOUT"),
            ProbeCause::Error => write!(f, "ERROR"),
            ProbeCause::HostMissing => write!(f, "HOST_MISSING"),
        }
    }
}

/// Round-trip statistics in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

/// Structured per-host result of a batch probe.
///
/// Build through the constructors; they enforce that RTT statistics exist
/// exactly when the host answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub address: String,
    pub cause: ProbeCause,
    pub packets_sent: u32,
    pub packets_received: u32,
    /// 0 to 100
    pub packet_loss_percent: u8,
    pub rtt: Option<RttStats>,
}

impl ProbeOutcome {
    /// Host answered at least one probe
    pub fn up(
        address: impl Into<String>,
        packets_sent: u32,
        packets_received: u32,
        packet_loss_percent: u8,
        rtt: RttStats,
    ) -> Result<Self, OutcomeError> {
        if packets_received == 0 {
            return Err(OutcomeError::NoReplies);
        }
        if packets_received > packets_sent {
            return Err(OutcomeError::MoreRepliesThanProbes {
                sent: packets_sent,
                received: packets_received,
            });
        }
        if packet_loss_percent > 100 {
            return Err(OutcomeError::LossOutOfRange(packet_loss_percent));
        }
        for value in [rtt.min_ms, rtt.avg_ms, rtt.max_ms] {
            if !value.is_finite() || value < 0.0 {
                return Err(OutcomeError::InvalidRtt(value));
            }
        }

        Ok(Self {
            address: address.into(),
            cause: ProbeCause::Ok,
            packets_sent,
            packets_received,
            packet_loss_percent,
            rtt: Some(rtt),
        })
    }

    /// Probe completed but no packet came back
    pub fn down(address: impl Into<String>, packets_sent: u32) -> Self {
        Self {
            address: address.into(),
            cause: ProbeCause::Down,
            packets_sent,
            packets_received: 0,
            packet_loss_percent: 100,
            rtt: None,
        }
    }

    /// Synthesized outcome for a host the probe could not conclude on
    pub fn failed(address: impl Into<String>, cause: ProbeCause) -> Self {
        debug_assert!(!cause.is_conclusive(), "failed() used with {cause}");
        Self {
            address: address.into(),
            cause,
            packets_sent: 0,
            packets_received: 0,
            packet_loss_percent: 100,
            rtt: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.cause == ProbeCause::Ok
    }
}

/// Monotonic batch identifier used to correlate outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for batch ids, shared by whatever creates batches
#[derive(Debug)]
pub struct BatchIds {
    next: AtomicU64,
}

impl BatchIds {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> BatchId {
        BatchId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BatchIds {
    fn default() -> Self {
        Self::new()
    }
}

/// What triggered a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BatchOrigin {
    /// A base timer fired
    Cadence { base_seconds: u64, tick: u64 },
    /// A store sweep found due hosts
    Sweep,
}

/// One external probe invocation worth of hosts. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeBatch {
    pub id: BatchId,
    /// address -> cadence in seconds
    pub hosts: BTreeMap<String, u64>,
    pub origin: BatchOrigin,
}

impl ProbeBatch {
    pub fn new(id: BatchId, hosts: BTreeMap<String, u64>, origin: BatchOrigin) -> Self {
        Self { id, hosts, origin }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Record published to outcome consumers for every host of every batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub address: String,
    pub reachable: bool,
    pub cause: ProbeCause,
    pub packet_loss_percent: u8,
    pub min_rtt_ms: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub max_rtt_ms: Option<f64>,
    pub batch_id: BatchId,
    pub cadence_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(outcome: &ProbeOutcome, batch_id: BatchId, cadence_seconds: u64) -> Self {
        Self {
            address: outcome.address.clone(),
            reachable: outcome.is_reachable(),
            cause: outcome.cause,
            packet_loss_percent: outcome.packet_loss_percent,
            min_rtt_ms: outcome.rtt.map(|rtt| rtt.min_ms),
            avg_rtt_ms: outcome.rtt.map(|rtt| rtt.avg_ms),
            max_rtt_ms: outcome.rtt.map(|rtt| rtt.max_ms),
            batch_id,
            cadence_seconds,
            timestamp: Utc::now(),
        }
    }

    /// Success channel carries reachable hosts only
    pub fn is_success(&self) -> bool {
        self.cause == ProbeCause::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtt(min_ms: f64, avg_ms: f64, max_ms: f64) -> RttStats {
        RttStats { min_ms, avg_ms, max_ms }
    }

    #[test]
    fn test_up_validates() {
        assert!(ProbeOutcome::up("a", 3, 3, 0, rtt(1.0, 2.0, 3.0)).is_ok());
        assert!(matches!(
            ProbeOutcome::up("a", 3, 0, 100, rtt(1.0, 2.0, 3.0)),
            Err(OutcomeError::NoReplies)
        ));
        assert!(matches!(
            ProbeOutcome::up("a", 3, 4, 0, rtt(1.0, 2.0, 3.0)),
            Err(OutcomeError::MoreRepliesThanProbes { .. })
        ));
        assert!(matches!(
            ProbeOutcome::up("a", 3, 1, 101, rtt(1.0, 2.0, 3.0)),
            Err(OutcomeError::LossOutOfRange(101))
        ));
        assert!(ProbeOutcome::up("a", 3, 3, 0, rtt(-1.0, 2.0, 3.0)).is_err());
        assert!(ProbeOutcome::up("a", 3, 3, 0, rtt(1.0, f64::NAN, 3.0)).is_err());
    }

    #[test]
    fn test_down_and_failed_shapes() {
        let down = ProbeOutcome::down("192.168.1.1", 3);
        assert_eq!(down.cause, ProbeCause::Down);
        assert_eq!(down.packet_loss_percent, 100);
        assert!(down.rtt.is_none());
        assert!(!down.is_reachable());

        let timeout = ProbeOutcome::failed("10.0.0.9", ProbeCause::Timeout);
        assert_eq!(timeout.cause, ProbeCause::Timeout);
        assert_eq!(timeout.packet_loss_percent, 100);
        assert!(timeout.rtt.is_none());
    }

    #[test]
    fn test_batch_ids_are_monotonic() {
        let ids = BatchIds::new();
        let first = ids.next();
        let second = ids.next();
        assert!(second > first);
        assert_eq!(first, BatchId(1));
    }

    #[test]
    fn test_event_routing_and_fields() {
        let outcome = ProbeOutcome::up("8.8.8.8", 3, 3, 0, rtt(10.1, 12.3, 15.0)).unwrap();
        let event = OutcomeEvent::new(&outcome, BatchId(7), 30);
        assert!(event.is_success());
        assert_eq!(event.min_rtt_ms, Some(10.1));
        assert_eq!(event.max_rtt_ms, Some(15.0));
        assert_eq!(event.cadence_seconds, 30);

        let missing = ProbeOutcome::failed("8.8.4.4", ProbeCause::HostMissing);
        let event = OutcomeEvent::new(&missing, BatchId(7), 30);
        assert!(!event.is_success());
        assert_eq!(event.avg_rtt_ms, None);
    }

    #[test]
    fn test_cause_serializes_screaming() {
        let json = serde_json::to_string(&ProbeCause::HostMissing).unwrap();
        assert_eq!(json, "\"HOST_MISSING\"");
        assert_eq!(ProbeCause::HostMissing.to_string(), "HOST_MISSING");
        assert!(ProbeCause::Down.is_conclusive());
        assert!(!ProbeCause::Timeout.is_conclusive());
    }
}
