use crate::{
    event::Event,
    format::Formatter,
    level::Level,
    queue::{QueueKind, WorkQueue},
    serialize::SerializableData,
    transport::Transport,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

type Mapper<I> = dyn Fn(&Arc<Event>, Option<SerializableData>) -> I + Send + Sync;

/// An in-memory recorder holding the most recent events in a bounded ring.
/// Each recorded event is formatted (if a formatter is configured) and
/// converted to a caller-defined item. When the ring is full the oldest
/// item is dropped. There is no external delivery; this transport exists
/// for tests and one-pass aggregation.
pub struct BufferedTransport<I: Send + 'static> {
    queue: WorkQueue,
    enabled: AtomicBool,
    min_level: Option<Level>,
    limit: usize,
    formatter: Option<Box<dyn Formatter>>,
    mapper: Box<Mapper<I>>,
    buffer: Mutex<VecDeque<I>>,
}

impl<I: Send + 'static> BufferedTransport<I> {
    pub fn new<F>(limit: usize, formatter: Option<Box<dyn Formatter>>, mapper: F) -> Arc<Self>
    where
        F: Fn(&Arc<Event>, Option<SerializableData>) -> I + Send + Sync + 'static,
    {
        Arc::new(BufferedTransport {
            queue: WorkQueue::new(QueueKind::Serial, "buffered"),
            enabled: AtomicBool::new(true),
            min_level: None,
            limit: limit.max(1),
            formatter,
            mapper: Box::new(mapper),
            buffer: Mutex::new(VecDeque::new()),
        })
    }

    pub fn with_min_level(mut self: Arc<Self>, min_level: Level) -> Arc<Self> {
        // Only valid before the transport is shared with a manager.
        Arc::get_mut(&mut self)
            .expect("cannot set min level on a shared transport")
            .min_level = Some(min_level);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().unwrap().is_empty()
    }

    /// Removes and returns all buffered items, oldest first.
    pub fn take(&self) -> Vec<I> {
        self.buffer.lock().unwrap().drain(..).collect()
    }

    /// Empties the ring. The clear runs as one job on the transport queue,
    /// so it cannot interleave with an in-flight `record`.
    pub fn clear(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.queue.execute_sync(move || {
            this.buffer.lock().unwrap().clear();
        });
    }
}

impl<I: Clone + Send + 'static> BufferedTransport<I> {
    /// A copy of the buffered items, oldest first.
    pub fn items(&self) -> Vec<I> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }
}

impl<I: Send + 'static> Transport for BufferedTransport<I> {
    fn name(&self) -> &str {
        "buffered"
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
        self.min_level
    }

    fn record(&self, event: &Arc<Event>) -> bool {
        let formatted = self
            .formatter
            .as_ref()
            .and_then(|formatter| formatter.format(event));
        let item = (self.mapper)(event, formatted);
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() == self.limit {
            buffer.pop_front();
        }
        buffer.push_back(item);
        true
    }
}
