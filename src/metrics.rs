//! Named metric events emitted by the relay and its transports
//!
//! Consumption is the embedding process' concern; the relay only emits. The
//! events form a first-class observable contract intended for operator health
//! dashboards, they are not incidental logging.

use std::time::Duration;

/// Observable event emitted at well-defined points of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// A task envelope was handed to the outbound channel
    SendDispatched,
    /// A pending send elapsed its deadline without any response
    SendTimeout,
    /// A pending send resolved with a response (success or application error)
    SendCompleted,
    /// Elapsed time from dispatch to resolution of one send
    Duration(Duration),
    /// A channel subscription was (re-)established
    Subscribe,
    /// A message was published on a channel
    Publish,
    /// A message was delivered by a subscribed channel
    MessageReceived,
    /// The underlying store reported a connection-level error
    StoreError,
}

/// Collaborator receiving [`MetricEvent`]s
///
/// Implementations must be cheap and non-blocking; events are recorded from
/// latency-sensitive paths.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a single event
    fn record(&self, event: MetricEvent);
}

/// Default sink discarding every event
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn record(&self, _event: MetricEvent) {}
}


#[cfg(test)]
mod does {
    use super::testing::CountingSink;
    use super::*;

    #[test]
    fn discard_silently() {
        NoopMetricSink.record(MetricEvent::SendDispatched);
        NoopMetricSink.record(MetricEvent::Duration(Duration::from_millis(42)));
    }

    #[test]
    fn count_recorded_events() {
        let sink = CountingSink::default();
        sink.record(MetricEvent::Publish);
        sink.record(MetricEvent::Publish);
        sink.record(MetricEvent::Subscribe);

        assert_eq!(sink.count(MetricEvent::Publish), 2);
        assert_eq!(sink.count(MetricEvent::Subscribe), 1);
        assert_eq!(sink.count(MetricEvent::StoreError), 0);
    }
}
