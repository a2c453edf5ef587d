use anyhow::{Context, Result};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramOpts, HistogramVec, IntCounterVec,
    Opts,
};

/// A group of collectors for the event pipeline. One collector is owned by
/// each transport manager; counters are labeled by transport name so a
/// single manager with many transports needs only one registration.
#[derive(Clone, Debug)]
pub struct PipelineMetricsCollector {
    /// Events submitted to the manager, labeled by logger label.
    pub events_submitted: IntCounterVec,
    /// Events dropped by a filter.
    pub events_filtered: IntCounterVec,
    /// Events delivered to a transport's `record`, labeled by transport.
    pub events_recorded: IntCounterVec,
    /// `record` calls that reported failure, labeled by transport.
    pub transport_failures: IntCounterVec,
}

impl PipelineMetricsCollector {
    pub fn new() -> Result<PipelineMetricsCollector> {
        Self::new_with_metric_name("lantern")
    }

    /// Creates a collector whose metric names are prefixed with `name`.
    /// Tests use distinct names so collectors do not collide in the
    /// process-global registry.
    pub fn new_with_metric_name(name: &str) -> Result<PipelineMetricsCollector> {
        let events_submitted = register_int_counter_vec!(
            format!("{}_events_submitted", name),
            "Number of events submitted to the transport manager",
            &["label"]
        )
        .context("failed to register metrics counter for submitted events")?;

        let events_filtered = register_int_counter_vec!(
            format!("{}_events_filtered", name),
            "Number of events rejected by a filter",
            &["label"]
        )
        .context("failed to register metrics counter for filtered events")?;

        let events_recorded = register_int_counter_vec!(
            format!("{}_events_recorded", name),
            "Number of events delivered to a transport",
            &["transport"]
        )
        .context("failed to register metrics counter for recorded events")?;

        let transport_failures = register_int_counter_vec!(
            format!("{}_transport_failures", name),
            "Number of failed transport record calls",
            &["transport"]
        )
        .context("failed to register metrics counter for transport failures")?;

        Ok(PipelineMetricsCollector {
            events_submitted,
            events_filtered,
            events_recorded,
            transport_failures,
        })
    }

    /// A collector that is not registered anywhere. Used when the default
    /// registration fails because another manager in the same process
    /// already owns the metric names.
    pub fn detached() -> PipelineMetricsCollector {
        let counter = |suffix: &str| {
            IntCounterVec::new(
                Opts::new(format!("lantern_detached_{}", suffix), "detached"),
                &["label"],
            )
            .unwrap()
        };
        PipelineMetricsCollector {
            events_submitted: counter("events_submitted"),
            events_filtered: counter("events_filtered"),
            events_recorded: counter("events_recorded"),
            transport_failures: counter("transport_failures"),
        }
    }

    /// The default collector: registered if possible, detached otherwise.
    pub fn default_collector() -> PipelineMetricsCollector {
        PipelineMetricsCollector::new().unwrap_or_else(|_| PipelineMetricsCollector::detached())
    }
}

/// Collector for the bulk HTTP uploader, recording per-request latency.
#[derive(Clone, Debug)]
pub struct UploadMetricsCollector {
    pub latency: HistogramVec,
}

impl UploadMetricsCollector {
    pub fn new() -> Result<UploadMetricsCollector> {
        Self::new_with_metric_name("lantern_upload")
    }

    pub fn new_with_metric_name(name: &str) -> Result<UploadMetricsCollector> {
        let latency = register_histogram_vec!(
            format!("{}_request_latency_ms", name),
            "Latency of bulk upload requests in milliseconds",
            &["endpoint", "http_status"]
        )
        .context("failed to register upload latency histogram")?;

        Ok(UploadMetricsCollector { latency })
    }

    pub fn detached() -> UploadMetricsCollector {
        UploadMetricsCollector {
            latency: HistogramVec::new(
                HistogramOpts::new("lantern_detached_request_latency_ms", "detached"),
                &["endpoint", "http_status"],
            )
            .unwrap(),
        }
    }

    pub fn default_collector() -> UploadMetricsCollector {
        UploadMetricsCollector::new().unwrap_or_else(|_| UploadMetricsCollector::detached())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_counts_by_label() {
        let collector =
            PipelineMetricsCollector::new_with_metric_name("collector_counts_by_label").unwrap();
        collector
            .events_submitted
            .with_label_values(&["app:net"])
            .inc();
        collector
            .events_submitted
            .with_label_values(&["app:net"])
            .inc();
        assert_eq!(
            collector
                .events_submitted
                .with_label_values(&["app:net"])
                .get(),
            2
        );
    }

    #[test]
    fn detached_collector_still_counts() {
        let collector = PipelineMetricsCollector::detached();
        collector.events_filtered.with_label_values(&["x"]).inc();
        assert_eq!(collector.events_filtered.with_label_values(&["x"]).get(), 1);
    }
}
