//! Prometheus metrics for the relay pipeline.
//!
//! Each [`RelayMetrics`] owns its own registry so several controllers (or
//! tests) can live in one process without name collisions.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Pipeline counters and gauges.
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Events that created a new queue entry; coalesced adds are not counted
    pub events_enqueued: IntCounter,
    /// Events processed successfully
    pub events_processed: IntCounter,
    /// Processing attempts that failed
    pub event_failures: IntCounter,
    /// Events re-queued with backoff
    pub event_retries: IntCounter,
    /// Events given up on after the configured retry cap
    pub events_dropped: IntCounter,
    /// Records accepted by subscriber channels
    pub records_broadcast: IntCounter,
    /// Records evicted from full channels under drop-oldest
    pub records_dropped: IntCounter,
    /// Keys currently pending in the queue
    pub queue_depth: IntGauge,
    /// Registered subscriber channels
    pub subscribers: IntGauge,
}

impl RelayMetrics {
    /// Creates the metrics and registers them in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("podrelay".to_string()), None)?;

        let events_enqueued = IntCounter::new("events_enqueued_total", "Events that created a new work queue entry")?;
        let events_processed = IntCounter::new("events_processed_total", "Events processed successfully")?;
        let event_failures = IntCounter::new("event_failures_total", "Event processing attempts that failed")?;
        let event_retries = IntCounter::new("event_retries_total", "Events re-queued with backoff")?;
        let events_dropped = IntCounter::new("events_dropped_total", "Events given up on after the configured retry cap")?;
        let records_broadcast =
            IntCounter::new("records_broadcast_total", "Status records accepted by subscriber channels")?;
        let records_dropped =
            IntCounter::new("records_dropped_total", "Status records evicted from full subscriber channels")?;
        let queue_depth = IntGauge::new("queue_depth", "Keys pending in the work queue")?;
        let subscribers = IntGauge::new("subscribers", "Registered subscriber channels")?;

        registry.register(Box::new(events_enqueued.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(event_failures.clone()))?;
        registry.register(Box::new(event_retries.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(records_broadcast.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            registry,
            events_enqueued,
            events_processed,
            event_failures,
            event_retries,
            events_dropped,
            records_broadcast,
            records_dropped,
            queue_depth,
            subscribers,
        })
    }

    /// Registry holding every relay metric.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_prefixed_names() {
        let metrics = RelayMetrics::new().expect("metrics");
        metrics.events_enqueued.inc();
        metrics.subscribers.set(2);

        let text = metrics.render().expect("render");
        assert!(text.contains("podrelay_events_enqueued_total 1"), "got: {text}");
        assert!(text.contains("podrelay_subscribers 2"), "got: {text}");
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let a = RelayMetrics::new().expect("metrics");
        let b = RelayMetrics::new().expect("metrics");
        a.events_processed.inc();

        assert_eq!(a.events_processed.get(), 1);
        assert_eq!(b.events_processed.get(), 0);
    }
}
