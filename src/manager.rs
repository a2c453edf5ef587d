use crate::{
    event::Event,
    filter::Filter,
    metrics::PipelineMetricsCollector,
    queue::WorkQueue,
    serialize::SerializationStrategy,
    transport::{transport_accepts, Transport},
};
use slog::{warn, Logger};
use std::sync::Arc;

/// Fan-out dispatcher owned by a logger. Events pass through the ordered
/// filter chain on the manager's serial accept queue, then each transport
/// receives the event on its own queue. The accept queue gives the filter
/// chain a total order; per-transport ordering is the transport queue's
/// business, and ordering across transports is not guaranteed.
#[derive(Clone)]
pub struct TransportManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    filters: Vec<Box<dyn Filter>>,
    transports: Vec<Arc<dyn Transport>>,
    accept_queue: WorkQueue,
    synchronous: bool,
    strategy: SerializationStrategy,
    metrics: PipelineMetricsCollector,
    logger: Logger,
}

pub struct TransportManagerBuilder {
    filters: Vec<Box<dyn Filter>>,
    transports: Vec<Arc<dyn Transport>>,
    synchronous: bool,
    strategy: SerializationStrategy,
    metrics: Option<PipelineMetricsCollector>,
    logger: Option<Logger>,
}

impl TransportManagerBuilder {
    pub fn new() -> TransportManagerBuilder {
        TransportManagerBuilder {
            filters: Vec::new(),
            transports: Vec::new(),
            synchronous: false,
            strategy: SerializationStrategy::default(),
            metrics: None,
            logger: None,
        }
    }

    pub fn filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// In synchronous mode, a write runs filters and every transport's
    /// `record` to completion before returning to the producer.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn serialization_strategy(mut self, strategy: SerializationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn metrics(mut self, metrics: PipelineMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> TransportManager {
        TransportManager {
            shared: Arc::new(ManagerShared {
                filters: self.filters,
                transports: self.transports,
                accept_queue: WorkQueue::serial("accept"),
                synchronous: self.synchronous,
                strategy: self.strategy,
                metrics: self
                    .metrics
                    .unwrap_or_else(PipelineMetricsCollector::default_collector),
                logger: self
                    .logger
                    .unwrap_or_else(crate::diagnostics::discard_diagnostics),
            }),
        }
    }
}

impl Default for TransportManagerBuilder {
    fn default() -> Self {
        TransportManagerBuilder::new()
    }
}

impl TransportManager {
    pub fn builder() -> TransportManagerBuilder {
        TransportManagerBuilder::new()
    }

    pub fn is_synchronous(&self) -> bool {
        self.shared.synchronous
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.shared.transports
    }

    /// Accepts an event from a channel. Serializes the attached object if
    /// one is present, then runs the filter chain and fans out. Never fails
    /// observably; serialization and transport errors are reported through
    /// the diagnostic logger and metrics.
    pub fn write(&self, mut event: Event) {
        if let Err(error) = event.ensure_serialized(self.shared.strategy) {
            warn!(
                self.shared.logger, "failed to serialize attached object";
                "event_id" => event.id.to_string(),
                "error" => format!("{:?}", error),
            );
        }
        self.shared
            .metrics
            .events_submitted
            .with_label_values(&[&event.label])
            .inc();

        let event = Arc::new(event);
        if self.shared.synchronous {
            Self::dispatch(&self.shared, &event);
        } else {
            let shared = Arc::clone(&self.shared);
            let event = Arc::clone(&event);
            self.shared
                .accept_queue
                .execute(move || Self::dispatch(&shared, &event));
        }
    }

    fn dispatch(shared: &Arc<ManagerShared>, event: &Arc<Event>) {
        for filter in &shared.filters {
            if !filter.should_accept(event) {
                shared
                    .metrics
                    .events_filtered
                    .with_label_values(&[&event.label])
                    .inc();
                return;
            }
        }

        for transport in &shared.transports {
            let transport_job = Arc::clone(transport);
            let event_job = Arc::clone(event);
            let metrics = shared.metrics.clone();
            let job = move || {
                if !transport_accepts(transport_job.as_ref(), &event_job) {
                    return;
                }
                metrics
                    .events_recorded
                    .with_label_values(&[transport_job.name()])
                    .inc();
                if !transport_job.record(&event_job) {
                    metrics
                        .transport_failures
                        .with_label_values(&[transport_job.name()])
                        .inc();
                }
            };
            if shared.synchronous {
                transport.queue().execute_sync(job);
            } else {
                transport.queue().execute(job);
            }
        }
    }

    /// Drains the accept queue and every transport queue, then asks each
    /// transport to flush buffered state.
    pub fn flush(&self) {
        self.shared.accept_queue.barrier();
        for transport in &self.shared.transports {
            transport.queue().barrier();
            transport.flush();
        }
    }

    /// Flushes, then shuts every transport down.
    pub fn shutdown(&self) {
        self.flush();
        for transport in &self.shared.transports {
            transport.shutdown();
        }
    }

}
