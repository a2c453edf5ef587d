use anyhow::{anyhow, Result};
use atty::{self, Stream};
use slog::{o, Drain, FnValue, Level, LevelFilter, Logger, PushFnValue};
use slog_json::Json;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{
    io::{stderr, Stderr},
    str::FromStr,
    thread,
};

/// `keys` defines constants for structured diagnostic events emitted by the
/// pipeline itself (transport failures, rotations, purges, reconnects).
pub mod keys {
    /// A key that could be encountered in the fields of a structured
    /// diagnostic message.
    type DiagnosticKey = &'static str;

    /// The name of the transport something happened to
    pub const TRANSPORT: DiagnosticKey = "transport";
    /// A filesystem path involved in the operation
    pub(crate) const PATH: DiagnosticKey = "path";
    /// The peer a remote transport is talking to
    pub(crate) const PEER: DiagnosticKey = "peer";
    /// Number of rows removed by a storage purge
    pub(crate) const ROWS_PURGED: DiagnosticKey = "rows_purged";
    /// The archive file produced by a rotation
    pub(crate) const ARCHIVE: DiagnosticKey = "archive";
    /// Why a buffered transport flushed
    pub(crate) const FLUSH_REASON: DiagnosticKey = "flush_reason";
    /// Number of payloads in a flushed batch
    pub(crate) const BATCH_SIZE: DiagnosticKey = "batch_size";
    /// Number of events dropped by a bounded buffer
    pub(crate) const DROPPED: DiagnosticKey = "dropped";
}

/// Options for configuring the pipeline's internal diagnostic logging
pub struct DiagnosticsConfiguration<'a> {
    /// If true, output will be forced to JSON format using [slog-json][1].
    /// If false, the format is determined by detecting whether `stderr` is
    /// a `tty`: terminals get [slog-term][2] pretty output, everything else
    /// gets JSON.
    ///
    /// [1]: https://docs.rs/slog-json
    /// [2]: https://docs.rs/slog-term
    pub force_json_output: bool,
    /// Messages above this log level will be discarded
    pub log_level: &'a str,
}

/// IoErrorDrain is a supertrait that lets us work generically with
/// `slog::Drain`s.
trait IoErrorDrain: Drain<Ok = (), Err = std::io::Error> + Send {}

impl IoErrorDrain for Json<Stderr> {}
impl IoErrorDrain for FullFormat<TermDecorator> {}

/// Initialize diagnostic logging resources. On success, returns a root
/// [`slog::Logger`] from which pipeline components create child loggers to
/// add more key-value pairs to the conditions they report. Returns an error
/// if `DiagnosticsConfiguration` is invalid.
pub fn setup_diagnostics(config: &DiagnosticsConfiguration) -> Result<Logger> {
    let json_output = atty::isnt(Stream::Stderr) || config.force_json_output;

    // We have to box the Drain so that both branches return the same type
    let drain: Box<dyn IoErrorDrain> = if json_output {
        let json_drain = Json::new(stderr())
            .set_newlines(true)
            .add_key_value(o!(
                "time" => FnValue(|_| {
                    chrono::Utc::now().to_rfc3339()
                }),
                "severity" => FnValue(|record| {
                    record.level().as_str().to_uppercase()
                }),
                "message" => PushFnValue(|record, serializer| {
                    serializer.emit(record.msg())
                }),
            ))
            .build();
        Box::new(json_drain)
    } else {
        let decorator = TermDecorator::new().stderr().build();
        Box::new(FullFormat::new(decorator).build())
    };

    // Create a filter to discard messages above desired level
    let log_level = Level::from_str(config.log_level)
        .map_err(|_| anyhow!("{} is not a valid log level", config.log_level))?;
    let level_filter = LevelFilter::new(drain, log_level);

    // Use slog_async to make it safe to clone loggers across threads
    let drain = slog_async::Async::new(level_filter.fuse()).build().fuse();
    let root_logger = Logger::root(
        drain,
        o!(
            "version" => env!("CARGO_PKG_VERSION"),
            "module_path" => FnValue(|record| {
                record.module()
            }),
            "thread_id" => FnValue(|_| {
                format!("{:?}", thread::current().id())
            })
        ),
    );

    Ok(root_logger)
}

/// A diagnostic logger that discards everything, for hosts that opt out.
pub fn discard_diagnostics() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Initialize logging for unit or integration tests. Must be public for
/// visibility in integration tests.
pub fn setup_test_logging() -> Logger {
    let decorator = PlainSyncDecorator::new(TestStdoutWriter);
    let drain = FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
