use crate::{
    event::{derive_label, Event, Value},
    level::{Level, ALL_LEVELS},
    manager::{TransportManager, TransportManagerBuilder},
    message::Message,
    scope::Scope,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, Weak},
};
use uuid::Uuid;

/// A producer-facing logger. A `Log` owns its identity, a severity gate,
/// one channel slot per severity, and the transport manager that fans
/// accepted events out to destinations.
///
/// The severity gate is realized as the channel array itself: severities
/// below the logger's level hold no channel, so a producer asking for a
/// gated channel gets `None` back before any message is interpolated or
/// any allocation happens.
#[derive(Clone)]
pub struct Log {
    shared: Arc<LogShared>,
}

pub(crate) struct LogShared {
    uuid: Uuid,
    subsystem: String,
    category: String,
    label: String,
    tags: BTreeMap<String, String>,
    extra: BTreeMap<String, Value>,
    manager: TransportManager,
    state: RwLock<LogState>,
    weak_self: Weak<LogShared>,
}

struct LogState {
    level: Level,
    enabled: bool,
    channels: [Option<Arc<Channel>>; 9],
}

/// The write surface for one severity of one logger. Channels are handed
/// out by [`Log::channel`] and stay valid across level changes; a channel
/// for a severity the logger no longer accepts silently discards writes.
pub struct Channel {
    level: Level,
    log: Weak<LogShared>,
}

const NO_CHANNEL: Option<Arc<Channel>> = None;

fn build_channels(weak: &Weak<LogShared>, level: Level, enabled: bool) -> [Option<Arc<Channel>>; 9] {
    let mut channels = [NO_CHANNEL; 9];
    if !enabled {
        return channels;
    }
    for severity in ALL_LEVELS {
        if level.admits(severity) {
            channels[severity.priority() as usize] = Some(Arc::new(Channel {
                level: severity,
                log: Weak::clone(weak),
            }));
        }
    }
    channels
}

pub struct LogBuilder {
    subsystem: String,
    category: String,
    level: Level,
    enabled: bool,
    tags: BTreeMap<String, String>,
    extra: BTreeMap<String, Value>,
    manager: TransportManagerBuilder,
}

impl LogBuilder {
    pub fn subsystem<S: Into<String>>(mut self, subsystem: S) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    pub fn category<S: Into<String>>(mut self, category: S) -> Self {
        self.category = category.into();
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// A tag merged into every event this logger emits. Event tags win on
    /// key conflict.
    pub fn tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// An extra value merged into every event this logger emits.
    pub fn extra<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Configure the transport manager: transports, filters, synchronous
    /// mode, serialization strategy, diagnostics.
    pub fn manager<F: FnOnce(TransportManagerBuilder) -> TransportManagerBuilder>(
        mut self,
        configure: F,
    ) -> Self {
        self.manager = configure(self.manager);
        self
    }

    pub fn build(self) -> Log {
        let manager = self.manager.build();
        let level = self.level;
        let enabled = self.enabled;
        let label = derive_label(&self.subsystem, &self.category);
        let shared = Arc::new_cyclic(|weak| LogShared {
            uuid: Uuid::new_v4(),
            subsystem: self.subsystem,
            category: self.category,
            label,
            tags: self.tags,
            extra: self.extra,
            manager,
            state: RwLock::new(LogState {
                level,
                enabled,
                channels: build_channels(weak, level, enabled),
            }),
            weak_self: Weak::clone(weak),
        });
        Log { shared }
    }
}

impl Log {
    pub fn builder() -> LogBuilder {
        LogBuilder {
            subsystem: String::new(),
            category: String::new(),
            level: Level::Info,
            enabled: true,
            tags: BTreeMap::new(),
            extra: BTreeMap::new(),
            manager: TransportManagerBuilder::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    pub fn subsystem(&self) -> &str {
        &self.shared.subsystem
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn level(&self) -> Level {
        self.shared.state.read().unwrap().level
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.read().unwrap().enabled
    }

    /// Changes the severity gate. The channel array is rebuilt and swapped
    /// under the logger's lock, so producers either see the old array or
    /// the new one, never a mix.
    pub fn set_level(&self, level: Level) {
        let mut state = self.shared.state.write().unwrap();
        state.level = level;
        state.channels = build_channels(&self.shared.weak_self, level, state.enabled);
    }

    /// Enables or disables the logger. A disabled logger has no channels.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.write().unwrap();
        state.enabled = enabled;
        state.channels = build_channels(&self.shared.weak_self, state.level, enabled);
    }

    /// The channel for a severity, or `None` when that severity is gated
    /// off. The lookup is a single read-locked slot load.
    pub fn channel(&self, level: Level) -> Option<Arc<Channel>> {
        self.shared.state.read().unwrap().channels[level.priority() as usize].clone()
    }

    pub fn trace(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Trace)
    }

    pub fn debug(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Debug)
    }

    pub fn info(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Info)
    }

    pub fn notice(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Notice)
    }

    pub fn warning(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Warning)
    }

    pub fn error(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Error)
    }

    pub fn critical(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Critical)
    }

    pub fn alert(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Alert)
    }

    pub fn emergency(&self) -> Option<Arc<Channel>> {
        self.channel(Level::Emergency)
    }

    pub fn manager(&self) -> &TransportManager {
        &self.shared.manager
    }

    /// Drains all queues and flushes every transport.
    pub fn flush(&self) {
        self.shared.manager.flush();
    }
}

impl Channel {
    pub fn level(&self) -> Level {
        self.level
    }

    /// Writes an event built by the closure. The closure receives a fresh
    /// event that already carries the severity, timestamp and the current
    /// scope snapshot; identity fields are stamped afterwards so they
    /// cannot be spoofed per-event.
    pub fn write_with<F: FnOnce(&mut Event)>(&self, build: F) {
        let shared = match self.log.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if !shared.state.read().unwrap().enabled {
            return;
        }
        let mut event = Event::new(self.level);
        event.scope = Scope::snapshot();
        build(&mut event);
        self.finalize(&shared, event);
    }

    /// Writes a pre-built event. The event's level is overridden by the
    /// channel's severity.
    pub fn write_event(&self, event: Event) {
        let shared = match self.log.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if !shared.state.read().unwrap().enabled {
            return;
        }
        let mut event = event;
        if event.scope == Scope::default() {
            event.scope = Scope::snapshot();
        }
        self.finalize(&shared, event);
    }

    /// Writes a message with no attached payload.
    pub fn write_message<M: Into<Message>>(&self, message: M) {
        self.write_with(|event| {
            event.message = message.into();
        });
    }

    fn finalize(&self, shared: &Arc<LogShared>, mut event: Event) {
        event.level = self.level;
        event.subsystem = shared.subsystem.clone();
        event.category = shared.category.clone();
        event.label = shared.label.clone();
        for (key, value) in &shared.tags {
            event.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in &shared.extra {
            event.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
        shared.manager.write(event);
    }
}

/// Submits a message to a logger at the given severity, capturing the call
/// site. Expands to a channel lookup followed by a write; for a gated
/// severity the format arguments are never evaluated.
#[macro_export]
macro_rules! write_log {
    ($log:expr, $level:expr, $($format:tt)*) => {
        if let Some(channel) = $log.channel($level) {
            channel.write_with(|event| {
                event.message = format!($($format)*).into();
                event.scope.function = Some(module_path!().to_owned());
                event.scope.file_name = Some(file!().to_owned());
                event.scope.file_line = Some(line!());
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::PipelineMetricsCollector,
        queue::{QueueKind, WorkQueue},
        transport::Transport,
    };
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    struct Probe {
        queue: WorkQueue,
        enabled: AtomicBool,
        seen: Mutex<Vec<(Level, String)>>,
        subsystems: Mutex<Vec<String>>,
        format_calls: AtomicUsize,
    }

    impl Probe {
        fn new() -> Arc<Probe> {
            Arc::new(Probe {
                queue: WorkQueue::new(QueueKind::Serial, "probe"),
                enabled: AtomicBool::new(true),
                seen: Mutex::new(Vec::new()),
                subsystems: Mutex::new(Vec::new()),
                format_calls: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for Probe {
        fn name(&self) -> &str {
            "probe"
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

        fn record(&self, event: &Arc<Event>) -> bool {
            self.format_calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((event.level, event.message.render().to_owned()));
            self.subsystems.lock().unwrap().push(event.subsystem.clone());
            true
        }
    }

    fn test_log(probe: &Arc<Probe>, level: Level) -> Log {
        Log::builder()
            .subsystem("app")
            .category("tests")
            .level(level)
            .manager(|manager| {
                manager
                    .transport(Arc::clone(probe) as Arc<dyn Transport>)
                    .synchronous(true)
                    .metrics(PipelineMetricsCollector::detached())
            })
            .build()
    }

    #[test]
    fn gated_severities_have_no_channel() {
        let probe = Probe::new();
        let log = test_log(&probe, Level::Warning);

        assert!(log.info().is_none());
        assert!(log.debug().is_none());
        assert!(log.warning().is_some());
        assert!(log.emergency().is_some());
    }

    #[test]
    fn gating_drops_below_level_and_formats_nothing() {
        let probe = Probe::new();
        let log = test_log(&probe, Level::Warning);

        write_log!(log, Level::Info, "x");
        write_log!(log, Level::Error, "y");

        let seen = probe.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(Level::Error, "y".to_owned())]);
        assert_eq!(probe.format_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_level_swaps_the_channel_array() {
        let probe = Probe::new();
        let log = test_log(&probe, Level::Warning);
        assert!(log.info().is_none());

        log.set_level(Level::Trace);
        assert!(log.info().is_some());
        assert!(log.trace().is_some());

        log.set_level(Level::Emergency);
        assert!(log.alert().is_none());
        assert!(log.emergency().is_some());
    }

    #[test]
    fn disabled_logger_writes_are_silent() {
        let probe = Probe::new();
        let log = test_log(&probe, Level::Trace);

        // A channel acquired while enabled keeps working after re-enable
        // and is inert while disabled.
        let channel = log.info().unwrap();
        log.set_enabled(false);
        assert!(log.info().is_none());
        channel.write_message("dropped");
        log.set_enabled(true);
        channel.write_message("delivered");

        let seen = probe.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(Level::Info, "delivered".to_owned())]);
    }

    #[test]
    fn channel_stamps_identity_over_builder_values() {
        let probe = Probe::new();
        let log = test_log(&probe, Level::Trace);

        // Whatever the builder closure claims, the logger's identity wins.
        log.info().unwrap().write_with(|event| {
            event.message = "m".into();
            event.subsystem = "spoofed".to_owned();
        });

        assert_eq!(*probe.subsystems.lock().unwrap(), vec!["app".to_owned()]);
    }

    #[test]
    fn label_strips_whitespace() {
        let probe = Probe::new();
        let log = Log::builder()
            .subsystem("com. example")
            .category("net work")
            .manager(|manager| {
                manager
                    .transport(Arc::clone(&probe) as Arc<dyn Transport>)
                    .metrics(PipelineMetricsCollector::detached())
            })
            .build();
        assert_eq!(log.label(), "com.example:network");
    }
}
