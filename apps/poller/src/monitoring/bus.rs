use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::{BatchId, OutcomeEvent};

/// Which logical channel an event travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Success,
    Failure,
}

/// The events of one batch that travel on the same channel
pub type OutcomeBatch = Arc<[OutcomeEvent]>;

/// Publish/subscribe boundary between probing and outcome consumers.
///
/// Two broadcast channels: reachable hosts go to `success`, every other cause
/// to `failure`. A batch is published as at most one message per channel, so
/// channel capacity counts batches, not hosts. Consumers subscribe
/// independently; publishing never blocks and succeeds with no subscribers
/// attached.
#[derive(Debug, Clone)]
pub struct OutcomeBus {
    success: broadcast::Sender<OutcomeBatch>,
    failure: broadcast::Sender<OutcomeBatch>,
}

impl OutcomeBus {
    pub fn new(capacity: usize) -> Self {
        let (success, _) = broadcast::channel(capacity.max(1));
        let (failure, _) = broadcast::channel(capacity.max(1));
        Self { success, failure }
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<OutcomeBatch> {
        match channel {
            Channel::Success => self.success.subscribe(),
            Channel::Failure => self.failure.subscribe(),
        }
    }

    /// Split events by channel and send each non-empty side as one message.
    ///
    /// Returns how many events went to (success, failure).
    pub fn publish(&self, events: Vec<OutcomeEvent>) -> (usize, usize) {
        let (success, failure): (Vec<_>, Vec<_>) =
            events.into_iter().partition(OutcomeEvent::is_success);
        let counts = (success.len(), failure.len());

        send(&self.success, Channel::Success, success);
        send(&self.failure, Channel::Failure, failure);
        counts
    }
}

fn send(sender: &broadcast::Sender<OutcomeBatch>, channel: Channel, events: Vec<OutcomeEvent>) {
    let Some(first) = events.first() else { return };
    let batch: BatchId = first.batch_id;
    trace!(?channel, batch = %batch, events = events.len(), "Publishing outcomes");
    // Err only means nobody is listening
    let _ = sender.send(events.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{ProbeCause, ProbeOutcome, RttStats};

    fn event(outcome: ProbeOutcome) -> OutcomeEvent {
        OutcomeEvent::new(&outcome, BatchId(1), 10)
    }

    #[tokio::test]
    async fn test_routing_by_cause() {
        let bus = OutcomeBus::new(16);
        let mut success = bus.subscribe(Channel::Success);
        let mut failure = bus.subscribe(Channel::Failure);

        let up = ProbeOutcome::up("a", 3, 3, 0, RttStats { min_ms: 1.0, avg_ms: 1.0, max_ms: 1.0 })
            .unwrap();
        let counts = bus.publish(vec![
            event(up),
            event(ProbeOutcome::down("b", 3)),
            event(ProbeOutcome::failed("c", ProbeCause::Timeout)),
        ]);
        assert_eq!(counts, (1, 2));

        let reachable = success.recv().await.unwrap();
        assert_eq!(reachable.len(), 1);
        assert_eq!(reachable[0].address, "a");

        let unreachable = failure.recv().await.unwrap();
        assert_eq!(unreachable[0].address, "b");
        assert_eq!(unreachable[1].cause, ProbeCause::Timeout);
        assert!(success.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_message_per_channel() {
        let bus = OutcomeBus::new(1);
        let mut failure = bus.subscribe(Channel::Failure);

        let events = (0..500).map(|i| event(ProbeOutcome::down(format!("10.0.{}.{}", i / 256, i % 256), 3)));
        assert_eq!(bus.publish(events.collect()), (0, 500));

        assert_eq!(failure.recv().await.unwrap().len(), 500);
        assert!(failure.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = OutcomeBus::new(4);
        bus.publish(vec![event(ProbeOutcome::down("a", 1))]);
        bus.publish(Vec::new());
    }
}
