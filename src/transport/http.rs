use crate::{
    diagnostics::keys,
    event::Event,
    format::{Formatter, JsonFormatter},
    level::Level,
    metrics::UploadMetricsCollector,
    queue::{QueueKind, WorkQueue},
    retries::{with_retries, RetryPolicy},
    transport::Transport,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use slog::{debug, error, Logger};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};
use ureq::{Agent, AgentBuilder};
use url::Url;

/// What happens to a blob whose upload request failed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadPolicy {
    /// The failure is logged and the blob is gone.
    #[default]
    AtMostOnce,
    /// The request is retried with exponential backoff before the blob is
    /// given up on.
    AtLeastOnce,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(
        "maximum_total_log_storage_size {0} must be at least twice log_storage_size {1}"
    )]
    CapTooSmall(usize, usize),
    #[error("invalid upload endpoint {0}")]
    BadEndpoint(String),
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Soft cap for the active byte buffer. Rounded up to a power of two.
    pub log_storage_size: usize,
    /// Hard cap across the active buffer plus in-flight upload buffers.
    /// Rounded up to a power of two; must be at least twice
    /// `log_storage_size` after rounding.
    pub maximum_total_log_storage_size: usize,
    #[serde(with = "crate::config::duration_secs")]
    pub upload_interval: Duration,
    pub policy: UploadPolicy,
    pub min_level: Option<Level>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig {
            scheme: "http".to_owned(),
            host: "localhost".to_owned(),
            port: 9200,
            log_storage_size: 64 * 1024,
            maximum_total_log_storage_size: 256 * 1024,
            upload_interval: Duration::from_secs(5),
            policy: UploadPolicy::default(),
            min_level: None,
        }
    }
}

impl UploaderConfig {
    /// Derives scheme, host and port from a URL, keeping the remaining
    /// fields at their defaults.
    pub fn for_endpoint(url: &Url) -> Result<UploaderConfig, UploadError> {
        let host = url
            .host_str()
            .ok_or_else(|| UploadError::BadEndpoint(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| UploadError::BadEndpoint(url.to_string()))?;
        Ok(UploaderConfig {
            scheme: url.scheme().to_owned(),
            host: host.to_owned(),
            port,
            ..UploaderConfig::default()
        })
    }
}

/// Accepts events, appends each as one length-prefixed JSON blob to a
/// shared byte buffer, and uploads every buffered blob as an individual
/// `POST` when the upload interval elapses or the buffer reaches its soft
/// cap. A counting guard bounds the total memory held across the active
/// buffer and in-flight uploads; an acceptor that would push past the hard
/// cap waits until an upload returns capacity.
pub struct BulkHttpTransport {
    queue: WorkQueue,
    enabled: AtomicBool,
    min_level: Option<Level>,
    shared: Arc<UploaderShared>,
}

impl std::fmt::Debug for BulkHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHttpTransport").finish_non_exhaustive()
    }
}

struct UploaderShared {
    url: String,
    agent: Agent,
    keep_alive: String,
    policy: UploadPolicy,
    log_storage_size: usize,
    maximum_total_log_storage_size: usize,
    buffer: Mutex<BufferState>,
    // Manual counting semaphore: capacity remaining before the hard cap.
    // Negative means in-flight uploads currently exceed the cap and
    // acceptors must wait.
    available: Mutex<i64>,
    capacity_returned: Condvar,
    upload_queue: WorkQueue,
    upload_interval: chrono::Duration,
    timer: Mutex<timer::Timer>,
    timer_guard: Mutex<Option<timer::Guard>>,
    formatter: Box<dyn Formatter>,
    metrics: UploadMetricsCollector,
    logger: Logger,
}

struct BufferState {
    buf: BytesMut,
    full: bool,
}

impl BulkHttpTransport {
    pub fn new(
        config: UploaderConfig,
        metrics: UploadMetricsCollector,
        logger: &Logger,
    ) -> Result<Arc<BulkHttpTransport>, UploadError> {
        let log_storage_size = config.log_storage_size.next_power_of_two();
        let maximum_total = config
            .maximum_total_log_storage_size
            .next_power_of_two();
        if maximum_total < 2 * log_storage_size {
            return Err(UploadError::CapTooSmall(maximum_total, log_storage_size));
        }

        let url = format!("{}://{}:{}", config.scheme, config.host, config.port);
        let keep_alive = keep_alive_header(config.upload_interval);
        let upload_interval = chrono::Duration::from_std(config.upload_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let shared = Arc::new(UploaderShared {
            url: url.clone(),
            agent: AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            keep_alive,
            policy: config.policy,
            log_storage_size,
            maximum_total_log_storage_size: maximum_total,
            buffer: Mutex::new(BufferState {
                buf: BytesMut::with_capacity(log_storage_size),
                full: false,
            }),
            available: Mutex::new(maximum_total as i64),
            capacity_returned: Condvar::new(),
            upload_queue: WorkQueue::serial("bulk-upload"),
            upload_interval,
            timer: Mutex::new(timer::Timer::new()),
            timer_guard: Mutex::new(None),
            formatter: Box::new(JsonFormatter),
            metrics,
            logger: logger.new(slog::o!(
                keys::TRANSPORT => "bulk-http",
                "endpoint" => url,
            )),
        });
        shared.arm_timer();

        Ok(Arc::new(BulkHttpTransport {
            queue: WorkQueue::new(QueueKind::Serial, "bulk-http"),
            enabled: AtomicBool::new(true),
            min_level: config.min_level,
            shared,
        }))
    }

    /// The soft cap after power-of-two rounding.
    pub fn log_storage_size(&self) -> usize {
        self.shared.log_storage_size
    }
}

/// `Keep-Alive` value: short upload intervals ask the server to hold the
/// connection for three intervals; longer ones settle for 30 seconds.
fn keep_alive_header(upload_interval: Duration) -> String {
    if upload_interval <= Duration::from_secs(10) {
        let timeout = (3.0 * upload_interval.as_secs_f64()).ceil() as u64;
        format!("timeout={}, max=100", timeout)
    } else {
        "timeout=30, max=100".to_owned()
    }
}

impl UploaderShared {
    fn arm_timer(self: &Arc<Self>) {
        let weak: Weak<UploaderShared> = Arc::downgrade(self);
        let mut guard = self.timer_guard.lock().unwrap();
        let timer = self.timer.lock().unwrap();
        *guard = Some(timer.schedule_repeating(self.upload_interval, move || {
            if let Some(shared) = weak.upgrade() {
                let temp = shared.swap_buffer();
                shared.enqueue_upload(temp, false);
            }
        }));
    }

    fn cancel_timer(&self) {
        self.timer_guard.lock().unwrap().take();
    }

    /// Takes everything in the active buffer, reserving its size against
    /// the hard cap. Returns an empty buffer when there is nothing to send.
    fn swap_buffer(&self) -> BytesMut {
        let (temp, was_full) = {
            let mut state = self.buffer.lock().unwrap();
            let was_full = state.full;
            state.full = false;
            (state.buf.split(), was_full)
        };
        if !temp.is_empty() {
            *self.available.lock().unwrap() -= temp.len() as i64;
            debug!(
                self.logger, "swapped buffer for upload";
                "bytes" => temp.len(),
                "overflow" => was_full,
            );
        }
        temp
    }

    fn enqueue_upload(self: &Arc<Self>, temp: BytesMut, wait: bool) {
        if temp.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        let job = move || shared.upload_batch(temp);
        if wait {
            self.upload_queue.execute_sync(job);
        } else {
            self.upload_queue.execute(job);
        }
    }

    /// Sends each length-prefixed blob in `temp` as its own request, all
    /// concurrently, then returns the buffer's capacity to the guard.
    fn upload_batch(self: &Arc<Self>, mut temp: BytesMut) {
        let reserved = temp.len() as i64;
        let mut blobs: Vec<Bytes> = Vec::new();
        while temp.remaining() >= 8 {
            let len = temp.get_i64() as usize;
            if len > temp.remaining() {
                error!(self.logger, "truncated record in upload buffer");
                break;
            }
            blobs.push(temp.split_to(len).freeze());
        }

        debug!(self.logger, "uploading batch"; keys::BATCH_SIZE => blobs.len());
        let mut workers = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let shared = Arc::clone(self);
            workers.push(thread::spawn(move || shared.post_blob(&blob)));
        }
        for worker in workers {
            let _ = worker.join();
        }

        self.release_capacity(reserved);
    }

    fn post_blob(&self, blob: &Bytes) {
        let send = || -> Result<(), ureq::Error> {
            let before = Instant::now();
            let result = self
                .agent
                .post(&self.url)
                .set("Content-Type", "application/json")
                .set("Accept", "application/json")
                .set("Connection", "keep-alive")
                .set("Keep-Alive", &self.keep_alive)
                .send_bytes(blob);
            let latency = before.elapsed().as_millis();
            let status_label = match &result {
                Ok(response) => response.status().to_string(),
                Err(ureq::Error::Status(status, _)) => status.to_string(),
                Err(_) => "unknown".to_owned(),
            };
            self.metrics
                .latency
                .with_label_values(&["bulk", &status_label])
                .observe(latency as f64);
            result.map(|_| ())
        };

        let outcome = match self.policy {
            UploadPolicy::AtMostOnce => send(),
            UploadPolicy::AtLeastOnce => with_retries(
                &self.logger,
                RetryPolicy::default(),
                "bulk upload",
                send,
                |error| match error {
                    ureq::Error::Status(status, _) => *status >= 500,
                    ureq::Error::Transport(_) => true,
                },
            ),
        };
        if let Err(err) = outcome {
            error!(
                self.logger, "upload request failed";
                "error" => format!("{:?}", err),
            );
        }
    }

    fn release_capacity(&self, reserved: i64) {
        let mut available = self.available.lock().unwrap();
        let was_exhausted = *available < 0;
        *available += reserved;
        // Waiters exist only while the counter is negative; a signal when
        // it never went below zero would leak a permit.
        if was_exhausted {
            self.capacity_returned.notify_all();
        }
    }

    fn wait_for_capacity(&self) {
        let mut available = self.available.lock().unwrap();
        while *available < 0 {
            available = self.capacity_returned.wait(available).unwrap();
        }
    }
}

impl Transport for BulkHttpTransport {
    fn name(&self) -> &str {
        "bulk-http"
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
        let formatted = match self.shared.formatter.format(event) {
            Some(formatted) => formatted,
            None => return true,
        };
        let record_len = 8 + formatted.len();
        if record_len > self.shared.log_storage_size {
            error!(
                self.shared.logger, "record larger than the storage buffer was dropped";
                "record_bytes" => record_len,
                "log_storage_size" => self.shared.log_storage_size,
            );
            return false;
        }

        self.shared.wait_for_capacity();

        let overflow_batch = {
            let mut state = self.shared.buffer.lock().unwrap();
            if state.buf.len() + record_len > self.shared.log_storage_size {
                // The next record would exceed the soft cap: close out the
                // current buffer and upload it immediately.
                self.shared.cancel_timer();
                state.full = true;
                Some(state.buf.split())
            } else {
                state.buf.put_i64(formatted.len() as i64);
                state.buf.put_slice(formatted.as_bytes());
                None
            }
        };

        if let Some(temp) = overflow_batch {
            if !temp.is_empty() {
                *self.shared.available.lock().unwrap() -= temp.len() as i64;
            }
            self.shared.enqueue_upload(temp, false);
            self.shared.arm_timer();

            let mut state = self.shared.buffer.lock().unwrap();
            state.full = false;
            state.buf.put_i64(formatted.len() as i64);
            state.buf.put_slice(formatted.as_bytes());
        }
        true
    }

    fn flush(&self) {
        self.shared.cancel_timer();
        let temp = self.shared.swap_buffer();
        self.shared.enqueue_upload(temp, true);
        self.shared.arm_timer();
    }

    fn shutdown(&self) {
        self.shared.cancel_timer();
        let temp = self.shared.swap_buffer();
        self.shared.enqueue_upload(temp, true);
        self.shared.upload_queue.barrier();
    }
}
