use crate::{
    diagnostics::keys,
    event::{Event, Value},
    format::Formatter,
    level::Level,
    queue::WorkQueue,
    serialize::METADATA_KEY_CODABLE,
    transport::{
        throttled::{FlushReason, ThrottledConfig, ThrottledDelegate, ThrottledItem},
        ThrottledTransport, Transport,
    },
};
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use slog::{info, warn, Logger};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Errors surfaced by the SQLite storage layer.
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("opening database {1}, {0}")]
    Open(rusqlite::Error, String),
    #[error("preparing schema, {0}")]
    Schema(rusqlite::Error),
    #[error("migration from version {1} to {2} failed, {0}")]
    Migration(anyhow::Error, u32, u32),
}

/// Observes storage-side happenings of a [`SqliteTransport`]. The
/// `migrate` hook runs inside the open sequence when the stored
/// `user_version` is behind `database_version`; returning an error leaves
/// the stored version untouched.
pub trait SqliteDelegate: Send + Sync {
    fn migrate(&self, _conn: &Connection, _from: u32, _to: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_migration(&self, _from: u32, _to: u32) {}

    /// Called after a purge pass with the number of rows removed.
    fn on_purge(&self, _rows_removed: usize) {}

    /// Called when a batch insert failed and was rolled back.
    fn on_batch_error(&self, _error: &anyhow::Error) {}
}

struct NoopDelegate;

impl SqliteDelegate for NoopDelegate {}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Batch size handed to the throttling layer.
    pub flush_size: usize,
    /// Flush interval handed to the throttling layer.
    #[serde(with = "crate::config::duration_secs")]
    pub flush_interval: Duration,
    /// Rows older than this are eligible for purging. `None` keeps
    /// everything forever.
    #[serde(with = "crate::config::opt_duration_secs")]
    pub lifetime: Option<Duration>,
    /// Shortest time between two purge passes.
    #[serde(with = "crate::config::duration_secs")]
    pub purge_min_interval: Duration,
    /// Run VACUUM after a purge that removed rows.
    pub vacuum_on_purge: bool,
    /// The schema version this build expects; compared against the stored
    /// `user_version` at open.
    pub database_version: u32,
    pub min_level: Option<Level>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            path: PathBuf::from("events.sqlite"),
            flush_size: 100,
            flush_interval: Duration::from_secs(30),
            lifetime: None,
            purge_min_interval: Duration::from_secs(60),
            vacuum_on_purge: false,
            database_version: 1,
            min_level: None,
        }
    }
}

/// Durable storage for events in a local SQLite database, fed in batches
/// by a composed [`ThrottledTransport`]. Each batch is inserted inside one
/// transaction with prepared statements for the `log`, `tags` and `extra`
/// tables. After a successful batch, rows older than the configured
/// lifetime are purged, at most once per `purge_min_interval`.
pub struct SqliteTransport {
    throttled: Arc<ThrottledTransport>,
    writer: Arc<SqliteWriter>,
}

pub(crate) struct SqliteWriter {
    conn: Mutex<Connection>,
    lifetime: Option<ChronoDuration>,
    purge_min_interval: ChronoDuration,
    vacuum_on_purge: bool,
    last_purge: Mutex<Option<DateTime<Utc>>>,
    delegate: Arc<dyn SqliteDelegate>,
    logger: Logger,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS log (
    eventId TEXT PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL,
    level INTEGER NOT NULL,
    category TEXT,
    subsystem TEXT,
    message TEXT,
    functionName TEXT,
    file TEXT,
    fileLine INTEGER,
    objectJSON TEXT,
    objectData BLOB,
    objectMetadata TEXT
);
CREATE TABLE IF NOT EXISTS tags (
    eventId TEXT NOT NULL REFERENCES log(eventId) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS extra (
    eventId TEXT NOT NULL REFERENCES log(eventId) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value BLOB
);
CREATE INDEX IF NOT EXISTS log_timestamp ON log(timestamp);
";

impl SqliteTransport {
    pub fn new(
        config: SqliteConfig,
        formatters: Vec<Box<dyn Formatter>>,
        delegate: Option<Arc<dyn SqliteDelegate>>,
        logger: &Logger,
    ) -> Result<Arc<SqliteTransport>, SqliteError> {
        let logger = logger.new(slog::o!(
            keys::TRANSPORT => "sqlite",
            keys::PATH => config.path.display().to_string(),
        ));
        let delegate = delegate.unwrap_or_else(|| Arc::new(NoopDelegate));
        let conn = Connection::open(&config.path)
            .map_err(|e| SqliteError::Open(e, config.path.display().to_string()))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(SqliteError::Schema)?;
        conn.execute_batch(SCHEMA).map_err(SqliteError::Schema)?;
        run_migration_if_needed(&conn, config.database_version, delegate.as_ref(), &logger)?;

        let writer = Arc::new(SqliteWriter {
            conn: Mutex::new(conn),
            lifetime: config
                .lifetime
                .and_then(|lifetime| ChronoDuration::from_std(lifetime).ok()),
            purge_min_interval: ChronoDuration::from_std(config.purge_min_interval)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            vacuum_on_purge: config.vacuum_on_purge,
            last_purge: Mutex::new(None),
            delegate,
            logger: logger.clone(),
        });

        let throttled = ThrottledTransport::new(
            "sqlite",
            ThrottledConfig {
                flush_size: config.flush_size,
                flush_interval: config.flush_interval,
                min_level: config.min_level,
            },
            formatters,
            Arc::clone(&writer) as Arc<dyn ThrottledDelegate>,
            &logger,
        );

        Ok(Arc::new(SqliteTransport { throttled, writer }))
    }

    /// An in-memory database, for tests and ephemeral aggregation.
    pub fn in_memory(
        config: SqliteConfig,
        formatters: Vec<Box<dyn Formatter>>,
        delegate: Option<Arc<dyn SqliteDelegate>>,
        logger: &Logger,
    ) -> Result<Arc<SqliteTransport>, SqliteError> {
        let config = SqliteConfig {
            path: PathBuf::from(":memory:"),
            ..config
        };
        SqliteTransport::new(config, formatters, delegate, logger)
    }

    /// Number of rows in the `log` table. Flush first to observe pending
    /// events.
    pub fn stored_count(&self) -> anyhow::Result<i64> {
        let conn = self.writer.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM log", [], |row| row.get(0))?)
    }

    #[cfg(test)]
    pub(crate) fn writer(&self) -> &Arc<SqliteWriter> {
        &self.writer
    }
}

fn run_migration_if_needed(
    conn: &Connection,
    database_version: u32,
    delegate: &dyn SqliteDelegate,
    logger: &Logger,
) -> Result<(), SqliteError> {
    let stored: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(SqliteError::Schema)?;
    let stored = stored.max(0) as u32;

    if stored == database_version {
        return Ok(());
    }
    if stored > database_version {
        warn!(
            logger, "database is newer than this build";
            "stored_version" => stored,
            "expected_version" => database_version,
        );
        return Ok(());
    }

    delegate
        .migrate(conn, stored, database_version)
        .map_err(|e| SqliteError::Migration(e, stored, database_version))?;
    conn.pragma_update(None, "user_version", database_version as i64)
        .map_err(SqliteError::Schema)?;
    delegate.on_migration(stored, database_version);
    info!(
        logger, "migrated database";
        "from_version" => stored,
        "to_version" => database_version,
    );
    Ok(())
}

impl SqliteWriter {
    fn insert_batch(&self, batch: &[ThrottledItem]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("failed to begin transaction")?;
        {
            let mut log_stmt = tx
                .prepare_cached(
                    "INSERT INTO log (eventId, timestamp, level, category, subsystem, message, \
                     functionName, file, fileLine, objectJSON, objectData, objectMetadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )
                .context("failed to prepare log insert")?;
            let mut tags_stmt = tx
                .prepare_cached("INSERT INTO tags (eventId, key, value) VALUES (?1, ?2, ?3)")
                .context("failed to prepare tags insert")?;
            let mut extra_stmt = tx
                .prepare_cached("INSERT INTO extra (eventId, key, value) VALUES (?1, ?2, ?3)")
                .context("failed to prepare extra insert")?;

            for item in batch {
                let event = &item.event;
                let event_id = event.id.to_string();
                let message = match &item.message {
                    Some(formatted) => formatted
                        .as_string()
                        .map(str::to_owned)
                        .unwrap_or_else(|| event.message.render().to_owned()),
                    // Formatter produced nothing; persist the original text.
                    None => event.message.render().to_owned(),
                };

                let codable = event
                    .serialized_object_metadata
                    .as_ref()
                    .and_then(|metadata| metadata.get(METADATA_KEY_CODABLE))
                    == Some(&Value::Bool(true));
                let (object_json, object_data) = match &event.serialized_object_data {
                    Some(data) if codable => match std::str::from_utf8(data) {
                        Ok(text) => (Some(text.to_owned()), None),
                        Err(_) => (None, Some(data.clone())),
                    },
                    Some(data) => (None, Some(data.clone())),
                    None => (None, None),
                };
                let object_metadata = event
                    .serialized_object_metadata
                    .as_ref()
                    .and_then(|metadata| serde_json::to_string(metadata).ok());

                log_stmt
                    .execute(params![
                        event_id,
                        event.timestamp.timestamp_millis(),
                        event.level.priority(),
                        event.category,
                        event.subsystem,
                        message,
                        event.scope.function,
                        event.scope.file_name,
                        event.scope.file_line,
                        object_json,
                        object_data,
                        object_metadata,
                    ])
                    .context("failed to insert log row")?;

                for (key, value) in event.all_tags() {
                    tags_stmt
                        .execute(params![event_id, key, value])
                        .context("failed to insert tag row")?;
                }
                for (key, value) in event.all_extra() {
                    let blob = serde_json::to_vec(&value).context("failed to encode extra")?;
                    extra_stmt
                        .execute(params![event_id, key, blob])
                        .context("failed to insert extra row")?;
                }
            }
        }
        tx.commit().context("failed to commit batch")?;
        Ok(())
    }

    /// Removes rows older than the lifetime, if one is configured and the
    /// minimum interval since the previous purge has elapsed. Takes `now`
    /// as a parameter so tests can steer the clock.
    pub(crate) fn maybe_purge(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let lifetime = match self.lifetime {
            Some(lifetime) => lifetime,
            None => return Ok(0),
        };
        {
            let last_purge = self.last_purge.lock().unwrap();
            if let Some(last) = *last_purge {
                if now - last < self.purge_min_interval {
                    return Ok(0);
                }
            }
        }

        let cutoff = (now - lifetime).timestamp_millis();
        let removed = {
            let conn = self.conn.lock().unwrap();
            let removed = conn
                .execute("DELETE FROM log WHERE timestamp < ?1", params![cutoff])
                .context("failed to purge expired rows")?;
            if removed > 0 && self.vacuum_on_purge {
                conn.execute_batch("VACUUM").context("failed to vacuum")?;
            }
            removed
        };

        *self.last_purge.lock().unwrap() = Some(now);
        if removed > 0 {
            info!(self.logger, "purged expired rows"; keys::ROWS_PURGED => removed);
        }
        self.delegate.on_purge(removed);
        Ok(removed)
    }
}

impl ThrottledDelegate for SqliteWriter {
    fn record_batch(&self, batch: Vec<ThrottledItem>, _reason: FlushReason) -> anyhow::Result<()> {
        if let Err(error) = self.insert_batch(&batch) {
            self.delegate.on_batch_error(&error);
            return Err(error);
        }
        if let Err(error) = self.maybe_purge(Utc::now()) {
            warn!(self.logger, "purge failed"; "error" => format!("{:?}", error));
        }
        Ok(())
    }
}

impl Transport for SqliteTransport {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn queue(&self) -> &WorkQueue {
        self.throttled.queue()
    }

    fn is_enabled(&self) -> bool {
        self.throttled.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.throttled.set_enabled(enabled);
    }

    fn min_level(&self) -> Option<Level> {
        self.throttled.min_level()
    }

    fn record(&self, event: &Arc<Event>) -> bool {
        self.throttled.record(event)
    }

    fn flush(&self) {
        self.throttled.flush();
    }

    fn shutdown(&self) {
        self.throttled.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::setup_test_logging,
        serialize::{JsonObject, SerializationStrategy},
    };
    use serde::Serialize;

    fn test_config() -> SqliteConfig {
        SqliteConfig {
            path: PathBuf::from(":memory:"),
            flush_size: 100,
            flush_interval: Duration::from_secs(3600),
            ..SqliteConfig::default()
        }
    }

    fn transport(config: SqliteConfig) -> Arc<SqliteTransport> {
        let logger = setup_test_logging();
        SqliteTransport::new(config, Vec::new(), None, &logger).unwrap()
    }

    fn event(message: &str) -> Arc<Event> {
        Arc::new(Event::with_message(Level::Info, message))
    }

    #[test]
    fn creates_schema_on_first_open() {
        let transport = transport(test_config());
        let conn = transport.writer.conn.lock().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('log', 'tags', 'extra')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
        let foreign_keys: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn batch_insert_stores_rows_tags_and_extra() {
        let transport = transport(test_config());

        let mut raw = Event::with_message(Level::Warning, "cache miss");
        raw.subsystem = "app".to_owned();
        raw.category = "cache".to_owned();
        raw.tags.insert("shard".to_owned(), "7".to_owned());
        raw.extra.insert("misses".to_owned(), Value::Int(3));
        let event = Arc::new(raw);

        transport.record(&event);
        transport.flush();

        assert_eq!(transport.stored_count().unwrap(), 1);
        let conn = transport.writer.conn.lock().unwrap();
        let (level, message): (i64, String) = conn
            .query_row("SELECT level, message FROM log", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(level, Level::Warning.priority() as i64);
        assert_eq!(message, "cache miss");

        let tag_value: String = conn
            .query_row("SELECT value FROM tags WHERE key = 'shard'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(tag_value, "7");

        let extra_blob: Vec<u8> = conn
            .query_row("SELECT value FROM extra WHERE key = 'misses'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(extra_blob, b"3");
    }

    #[test]
    fn codable_objects_land_in_the_json_column() {
        #[derive(Serialize)]
        struct Payload {
            ok: bool,
        }

        let transport = transport(test_config());
        let mut raw = Event::with_message(Level::Info, "with object");
        raw.set_object(Arc::new(JsonObject(Payload { ok: true })));
        raw.ensure_serialized(SerializationStrategy::Json).unwrap();
        let event = Arc::new(raw);

        transport.record(&event);
        transport.flush();

        let conn = transport.writer.conn.lock().unwrap();
        let (json, data, metadata): (Option<String>, Option<Vec<u8>>, Option<String>) = conn
            .query_row(
                "SELECT objectJSON, objectData, objectMetadata FROM log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(json.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(data, None);
        assert!(metadata.unwrap().contains("codable"));
    }

    #[test]
    fn purge_respects_lifetime_and_min_interval() {
        struct PurgeRecorder(Mutex<Vec<usize>>);
        impl SqliteDelegate for PurgeRecorder {
            fn on_purge(&self, rows_removed: usize) {
                self.0.lock().unwrap().push(rows_removed);
            }
        }

        let delegate = Arc::new(PurgeRecorder(Mutex::new(Vec::new())));
        let logger = setup_test_logging();
        let config = SqliteConfig {
            path: PathBuf::from(":memory:"),
            flush_size: 100,
            flush_interval: Duration::from_secs(3600),
            lifetime: Some(Duration::from_secs(60)),
            purge_min_interval: Duration::from_secs(10),
            ..SqliteConfig::default()
        };
        let transport = SqliteTransport::new(
            config,
            Vec::new(),
            Some(Arc::clone(&delegate) as Arc<dyn SqliteDelegate>),
            &logger,
        )
        .unwrap();

        let now = Utc::now();
        for i in 0..10 {
            let mut raw = Event::with_message(Level::Info, format!("fresh {}", i));
            raw.timestamp = now;
            transport.record(&Arc::new(raw));
        }
        for i in 0..10 {
            let mut raw = Event::with_message(Level::Info, format!("stale {}", i));
            raw.timestamp = now - ChronoDuration::seconds(120);
            transport.record(&Arc::new(raw));
        }
        // Flush inserts the batch; insert-path purging already ran once, so
        // exercise the clock gate directly.
        transport.flush();

        let removed = transport.writer().maybe_purge(now).unwrap();
        // The flush-time purge got there first; either way the stale rows
        // are gone and the recent ones survive.
        assert_eq!(transport.stored_count().unwrap(), 10);

        // A purge within the minimum interval is skipped.
        let removed_again = transport.writer().maybe_purge(now + ChronoDuration::seconds(5));
        assert_eq!(removed_again.unwrap(), 0);

        // After the interval it runs again (and removes nothing new).
        let removed_later = transport
            .writer()
            .maybe_purge(now + ChronoDuration::seconds(15))
            .unwrap();
        assert_eq!(removed_later, 0);

        let reported = delegate.0.lock().unwrap().clone();
        assert!(reported.iter().sum::<usize>() == 10 || removed == 10);
    }

    #[test]
    fn migration_hook_runs_and_updates_user_version() {
        struct Migrator(Mutex<Vec<(u32, u32)>>);
        impl SqliteDelegate for Migrator {
            fn migrate(&self, conn: &Connection, _from: u32, _to: u32) -> anyhow::Result<()> {
                conn.execute_batch("ALTER TABLE log ADD COLUMN annotations TEXT")?;
                Ok(())
            }

            fn on_migration(&self, from: u32, to: u32) {
                self.0.lock().unwrap().push((from, to));
            }
        }

        let tempdir = tempfile::TempDir::new().unwrap();
        let path = tempdir.path().join("events.sqlite");
        let logger = setup_test_logging();

        // First open establishes version 1.
        {
            let config = SqliteConfig {
                path: path.clone(),
                database_version: 1,
                ..test_config()
            };
            SqliteTransport::new(config, Vec::new(), None, &logger).unwrap();
        }

        // Second open at version 2 must run the migration hook.
        let delegate = Arc::new(Migrator(Mutex::new(Vec::new())));
        let config = SqliteConfig {
            path,
            database_version: 2,
            ..test_config()
        };
        let transport = SqliteTransport::new(
            config,
            Vec::new(),
            Some(Arc::clone(&delegate) as Arc<dyn SqliteDelegate>),
            &logger,
        )
        .unwrap();

        assert_eq!(delegate.0.lock().unwrap().clone(), vec![(1, 2)]);
        let conn = transport.writer.conn.lock().unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
