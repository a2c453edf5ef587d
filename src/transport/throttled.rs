use crate::{
    diagnostics::keys,
    event::Event,
    format::Formatter,
    level::Level,
    queue::{QueueKind, WorkQueue},
    serialize::SerializableData,
    transport::Transport,
};
use slog::{debug, error, Logger};
use std::{
    fmt::{self, Display, Formatter as FmtFormatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

/// Why a batch left the throttled buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    /// The buffer reached its configured size.
    Size,
    /// The flush interval elapsed with a non-empty buffer.
    Interval,
    /// An explicit `flush()` call.
    Manual,
    /// The transport is shutting down.
    Shutdown,
}

impl Display for FlushReason {
    fn fmt(&self, f: &mut FmtFormatter<'_>) -> fmt::Result {
        let s = match self {
            FlushReason::Size => "size",
            FlushReason::Interval => "interval",
            FlushReason::Manual => "manual",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An event paired with its formatted message, produced once at accept
/// time so downstream storage never re-formats.
#[derive(Clone, Debug)]
pub struct ThrottledItem {
    pub event: Arc<Event>,
    pub message: Option<SerializableData>,
}

/// Receives batches released by a [`ThrottledTransport`]. Returning an
/// error is the delegate's failure signal; the batch is not redelivered by
/// this layer.
pub trait ThrottledDelegate: Send + Sync {
    fn record_batch(&self, batch: Vec<ThrottledItem>, reason: FlushReason) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ThrottledConfig {
    /// Batch size that triggers an immediate flush.
    pub flush_size: usize,
    /// Longest time a non-empty buffer may sit before being flushed.
    #[serde(with = "crate::config::duration_secs")]
    pub flush_interval: Duration,
    pub min_level: Option<Level>,
}

impl Default for ThrottledConfig {
    fn default() -> Self {
        ThrottledConfig {
            flush_size: 500,
            flush_interval: Duration::from_secs(60),
            min_level: None,
        }
    }
}

/// Accepts events, formats them once, and stores `(event, message)` pairs
/// until a size, interval, manual or shutdown trigger releases them as one
/// batch to the delegate. Accepts run on the transport queue; delegate
/// hand-offs run on a separate flush queue so slow storage does not back
/// up producers. The interval timer is single-shot: armed when the first
/// item lands in an empty buffer, cancelled by any flush, re-armed by the
/// next item.
pub struct ThrottledTransport {
    queue: WorkQueue,
    enabled: AtomicBool,
    config: ThrottledConfig,
    formatters: Vec<Box<dyn Formatter>>,
    inner: Arc<ThrottledInner>,
}

struct ThrottledInner {
    name: String,
    buffer: Mutex<Vec<ThrottledItem>>,
    flush_queue: WorkQueue,
    delegate: Arc<dyn ThrottledDelegate>,
    timer: Mutex<timer::Timer>,
    timer_guard: Mutex<Option<timer::Guard>>,
    flush_interval: chrono::Duration,
    logger: Logger,
}

impl ThrottledTransport {
    pub fn new(
        name: &str,
        config: ThrottledConfig,
        formatters: Vec<Box<dyn Formatter>>,
        delegate: Arc<dyn ThrottledDelegate>,
        logger: &Logger,
    ) -> Arc<ThrottledTransport> {
        let flush_interval = chrono::Duration::from_std(config.flush_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Arc::new(ThrottledTransport {
            queue: WorkQueue::new(QueueKind::Serial, name),
            enabled: AtomicBool::new(true),
            config,
            formatters,
            inner: Arc::new(ThrottledInner {
                name: name.to_owned(),
                buffer: Mutex::new(Vec::new()),
                flush_queue: WorkQueue::serial(&format!("{}-flush", name)),
                delegate,
                timer: Mutex::new(timer::Timer::new()),
                timer_guard: Mutex::new(None),
                flush_interval,
                logger: logger.new(slog::o!(keys::TRANSPORT => name.to_owned())),
            }),
        })
    }

    /// Number of items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().unwrap().len()
    }

    fn format_once(&self, event: &Arc<Event>) -> Option<SerializableData> {
        self.formatters
            .iter()
            .find_map(|formatter| formatter.format(event))
    }
}

impl ThrottledInner {
    /// Drains the buffer and hands the batch to the delegate on the flush
    /// queue. `wait` makes the call block until the delegate returns,
    /// which manual and shutdown flushes rely on.
    fn release(self: &Arc<Self>, reason: FlushReason, wait: bool) {
        self.cancel_timer();
        let batch: Vec<ThrottledItem> = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.drain(..).collect()
        };
        self.deliver(batch, reason, wait);
    }

    fn deliver(self: &Arc<Self>, batch: Vec<ThrottledItem>, reason: FlushReason, wait: bool) {
        if batch.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        let job = move || {
            debug!(
                inner.logger, "releasing batch";
                keys::FLUSH_REASON => reason.to_string(),
                keys::BATCH_SIZE => batch.len(),
            );
            if let Err(err) = inner.delegate.record_batch(batch, reason) {
                error!(
                    inner.logger, "delegate failed to store batch";
                    keys::FLUSH_REASON => reason.to_string(),
                    "error" => format!("{:?}", err),
                );
            }
        };
        if wait {
            self.flush_queue.execute_sync(job);
        } else {
            self.flush_queue.execute(job);
        }
    }

    fn arm_timer(self: &Arc<Self>) {
        let mut guard = self.timer_guard.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let weak: Weak<ThrottledInner> = Arc::downgrade(self);
        let timer = self.timer.lock().unwrap();
        *guard = Some(timer.schedule_with_delay(self.flush_interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.timer_guard.lock().unwrap().take();
                inner.release(FlushReason::Interval, false);
            }
        }));
    }

    fn cancel_timer(&self) {
        self.timer_guard.lock().unwrap().take();
    }
}

impl Transport for ThrottledTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn min_level(&self) -> Option<Level> {
        self.config.min_level
    }

    fn record(&self, event: &Arc<Event>) -> bool {
        let message = self.format_once(event);
        let batch = {
            let mut buffer = self.inner.buffer.lock().unwrap();
            buffer.push(ThrottledItem {
                event: Arc::clone(event),
                message,
            });
            if buffer.len() >= self.config.flush_size {
                Some(buffer.drain(..).collect::<Vec<ThrottledItem>>())
            } else {
                None
            }
        };
        match batch {
            Some(batch) => {
                self.inner.cancel_timer();
                self.inner.deliver(batch, FlushReason::Size, false);
            }
            None => self.inner.arm_timer(),
        }
        true
    }

    fn flush(&self) {
        self.queue.barrier();
        self.inner.release(FlushReason::Manual, true);
    }

    fn shutdown(&self) {
        self.queue.barrier();
        self.inner.release(FlushReason::Shutdown, true);
        self.inner.flush_queue.barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::setup_test_logging;

    struct CollectingDelegate {
        batches: Mutex<Vec<(Vec<String>, FlushReason)>>,
        fail: AtomicBool,
    }

    impl CollectingDelegate {
        fn new() -> Arc<CollectingDelegate> {
            Arc::new(CollectingDelegate {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn batches(&self) -> Vec<(Vec<String>, FlushReason)> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl ThrottledDelegate for CollectingDelegate {
        fn record_batch(
            &self,
            batch: Vec<ThrottledItem>,
            reason: FlushReason,
        ) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("storage unavailable");
            }
            let messages = batch
                .iter()
                .map(|item| item.event.message.render().to_owned())
                .collect();
            self.batches.lock().unwrap().push((messages, reason));
            Ok(())
        }
    }

    fn transport_with(
        delegate: &Arc<CollectingDelegate>,
        flush_size: usize,
        flush_interval: Duration,
    ) -> Arc<ThrottledTransport> {
        let logger = setup_test_logging();
        ThrottledTransport::new(
            "throttled-test",
            ThrottledConfig {
                flush_size,
                flush_interval,
                min_level: None,
            },
            Vec::new(),
            Arc::clone(delegate) as Arc<dyn ThrottledDelegate>,
            &logger,
        )
    }

    fn submit(transport: &Arc<ThrottledTransport>, message: &str) {
        let event = Arc::new(Event::with_message(Level::Info, message));
        transport.record(&event);
    }

    #[test]
    fn size_trigger_releases_exactly_flush_size_items() {
        let delegate = CollectingDelegate::new();
        let transport = transport_with(&delegate, 3, Duration::from_secs(3600));

        for message in ["a", "b", "c", "d", "e"] {
            submit(&transport, message);
        }
        transport.inner.flush_queue.barrier();

        let batches = delegate.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, vec!["a", "b", "c"]);
        assert_eq!(batches[0].1, FlushReason::Size);
        assert_eq!(transport.pending(), 2);

        transport.flush();
        let batches = delegate.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].0, vec!["d", "e"]);
        assert_eq!(batches[1].1, FlushReason::Manual);
    }

    #[test]
    fn interval_trigger_flushes_a_waiting_buffer() {
        let delegate = CollectingDelegate::new();
        let transport = transport_with(&delegate, 100, Duration::from_millis(30));

        submit(&transport, "slow");
        std::thread::sleep(Duration::from_millis(200));
        transport.inner.flush_queue.barrier();

        let batches = delegate.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, vec!["slow"]);
        assert_eq!(batches[0].1, FlushReason::Interval);
    }

    #[test]
    fn manual_flush_on_empty_buffer_is_a_no_op() {
        let delegate = CollectingDelegate::new();
        let transport = transport_with(&delegate, 10, Duration::from_secs(3600));

        transport.flush();
        transport.flush();
        assert!(delegate.batches().is_empty());
    }

    #[test]
    fn shutdown_releases_the_remainder() {
        let delegate = CollectingDelegate::new();
        let transport = transport_with(&delegate, 10, Duration::from_secs(3600));

        submit(&transport, "tail");
        transport.shutdown();

        let batches = delegate.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, FlushReason::Shutdown);
    }

    #[test]
    fn delegate_failure_does_not_redeliver() {
        let delegate = CollectingDelegate::new();
        let transport = transport_with(&delegate, 2, Duration::from_secs(3600));

        delegate.fail.store(true, Ordering::SeqCst);
        submit(&transport, "x");
        submit(&transport, "y");
        transport.inner.flush_queue.barrier();

        delegate.fail.store(false, Ordering::SeqCst);
        transport.flush();
        // The failed batch is gone; nothing is retried by this layer.
        assert!(delegate.batches().is_empty());
        assert_eq!(transport.pending(), 0);
    }
}
