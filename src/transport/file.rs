use crate::{
    diagnostics::keys,
    event::Event,
    format::Formatter,
    level::Level,
    queue::{QueueKind, WorkQueue},
    transport::Transport,
};
use chrono::Utc;
use slog::{error, info, Logger};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::SystemTime,
};
use uuid::Uuid;

/// Errors that can arise when writing events to the local filesystem.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("opening {1}, {0}")]
    Open(std::io::Error, String),
    #[error("writing {1}, {0}")]
    Write(std::io::Error, String),
    #[error("archiving to {1}, {0}")]
    Archive(std::io::Error, String),
    #[error("listing archives in {1}, {0}")]
    ListArchives(std::io::Error, String),
}

/// Appends one formatted line per event to a single file. The handle stays
/// open for the transport's lifetime; writes happen in submission order on
/// the transport queue. Events the formatter declines to format are
/// skipped.
pub struct FileTransport {
    queue: WorkQueue,
    enabled: AtomicBool,
    min_level: Option<Level>,
    formatter: Box<dyn Formatter>,
    path: PathBuf,
    file: Mutex<File>,
    logger: Logger,
}

impl FileTransport {
    pub fn new(
        path: &Path,
        formatter: Box<dyn Formatter>,
        min_level: Option<Level>,
        logger: &Logger,
    ) -> Result<Arc<FileTransport>, FileError> {
        let file = open_append(path)?;
        Ok(Arc::new(FileTransport {
            queue: WorkQueue::new(QueueKind::Serial, "file"),
            enabled: AtomicBool::new(true),
            min_level,
            formatter,
            path: path.to_owned(),
            file: Mutex::new(file),
            logger: logger.new(slog::o!(
                keys::TRANSPORT => "file",
                keys::PATH => path.display().to_string(),
            )),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> Result<File, FileError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FileError::Open(e, path.display().to_string()))
}

impl Transport for FileTransport {
    fn name(&self) -> &str {
        "file"
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
        let formatted = match self.formatter.format(event) {
            Some(formatted) => formatted,
            None => return true,
        };
        let mut file = self.file.lock().unwrap();
        let result = file
            .write_all(formatted.as_bytes())
            .and_then(|_| file.write_all(b"\n"));
        if let Err(err) = result {
            error!(
                self.logger, "failed to append event";
                "error" => format!("{:?}", FileError::Write(err, self.path.display().to_string())),
            );
            return false;
        }
        true
    }

    fn flush(&self) {
        let mut file = self.file.lock().unwrap();
        if let Err(err) = file.flush() {
            error!(self.logger, "failed to flush file"; "error" => format!("{:?}", err));
        }
    }
}

/// Notification that a rotation or prune took place.
#[derive(Clone, Debug)]
pub enum RotationEvent {
    /// The current file reached its size cap and was moved to an archive.
    Rotated { archive: PathBuf },
    /// Old archives were removed to respect the archive count cap.
    Pruned { removed: Vec<PathBuf> },
}

/// Observes rotations and prunes of a [`SizeRotationFileTransport`].
pub trait RotationDelegate: Send + Sync {
    fn on_rotation(&self, event: &RotationEvent);
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RotationConfig {
    pub directory: PathBuf,
    /// Filename prefix shared by the current file and all archives.
    pub prefix: String,
    /// Filename extension, without the leading dot.
    pub extension: String,
    /// Size at which the current file is archived, in bytes.
    pub max_file_size: u64,
    /// Largest number of archives kept on disk.
    pub max_files_count: usize,
    pub min_level: Option<Level>,
}

/// A file transport whose target directory holds one current file plus a
/// bounded set of timestamped archives. Before each write, a current file
/// at or over `max_file_size` is closed, renamed to
/// `<prefix><yyyyMMddTHHmmssSSS>-<uuid12>.<ext>` (GMT), and replaced by a
/// fresh file; the archive set is then pruned oldest-first down to
/// `max_files_count`.
pub struct SizeRotationFileTransport {
    queue: WorkQueue,
    enabled: AtomicBool,
    config: RotationConfig,
    formatter: Box<dyn Formatter>,
    current: Mutex<CurrentFile>,
    delegate: Option<Arc<dyn RotationDelegate>>,
    logger: Logger,
}

struct CurrentFile {
    file: File,
    written: u64,
}

impl SizeRotationFileTransport {
    pub fn new(
        config: RotationConfig,
        formatter: Box<dyn Formatter>,
        delegate: Option<Arc<dyn RotationDelegate>>,
        logger: &Logger,
    ) -> Result<Arc<SizeRotationFileTransport>, FileError> {
        fs::create_dir_all(&config.directory)
            .map_err(|e| FileError::Open(e, config.directory.display().to_string()))?;
        let current_path = current_path(&config);
        let file = open_append(&current_path)?;
        let written = file
            .metadata()
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        Ok(Arc::new(SizeRotationFileTransport {
            queue: WorkQueue::new(QueueKind::Serial, "rotating-file"),
            enabled: AtomicBool::new(true),
            formatter,
            current: Mutex::new(CurrentFile { file, written }),
            delegate,
            logger: logger.new(slog::o!(
                keys::TRANSPORT => "rotating-file",
                keys::PATH => config.directory.display().to_string(),
            )),
            config,
        }))
    }

    pub fn current_path(&self) -> PathBuf {
        current_path(&self.config)
    }

    /// The archive files currently on disk, sorted by name (which sorts by
    /// embedded timestamp).
    pub fn archives(&self) -> Result<Vec<PathBuf>, FileError> {
        let mut archives = list_archives(&self.config)?;
        archives.sort();
        Ok(archives.into_iter().map(|(path, _)| path).collect())
    }

    fn rotate(&self, current: &mut CurrentFile) -> Result<(), FileError> {
        let archive = archive_path(&self.config);
        let current_path = current_path(&self.config);

        // Close the handle before the rename so the archive is complete.
        current.file.flush().ok();
        fs::rename(&current_path, &archive)
            .map_err(|e| FileError::Archive(e, archive.display().to_string()))?;
        current.file = open_append(&current_path)?;
        current.written = 0;

        info!(self.logger, "rotated current file"; keys::ARCHIVE => archive.display().to_string());
        if let Some(delegate) = &self.delegate {
            delegate.on_rotation(&RotationEvent::Rotated {
                archive: archive.clone(),
            });
        }

        self.prune()
    }

    fn prune(&self) -> Result<(), FileError> {
        let mut archives = list_archives(&self.config)?;
        if archives.len() <= self.config.max_files_count {
            return Ok(());
        }
        // Oldest first, by modification time.
        archives.sort_by_key(|(_, modified)| *modified);
        let excess = archives.len() - self.config.max_files_count;
        let mut removed = Vec::new();
        for (path, _) in archives.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(err) => {
                    error!(
                        self.logger, "failed to remove archive";
                        keys::ARCHIVE => path.display().to_string(),
                        "error" => format!("{:?}", err),
                    );
                }
            }
        }
        if !removed.is_empty() {
            info!(self.logger, "pruned archives"; keys::DROPPED => removed.len());
            if let Some(delegate) = &self.delegate {
                delegate.on_rotation(&RotationEvent::Pruned { removed });
            }
        }
        Ok(())
    }
}

fn current_path(config: &RotationConfig) -> PathBuf {
    config
        .directory
        .join(format!("{}.{}", config.prefix, config.extension))
}

fn archive_path(config: &RotationConfig) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let suffix = Uuid::new_v4().to_simple().to_string();
    config.directory.join(format!(
        "{}{}-{}.{}",
        config.prefix,
        stamp,
        &suffix[..12],
        config.extension
    ))
}

/// Archive files in the rotation directory with their modification times.
/// The current file is not an archive.
fn list_archives(config: &RotationConfig) -> Result<Vec<(PathBuf, SystemTime)>, FileError> {
    let current = current_path(config);
    let suffix = format!(".{}", config.extension);
    let mut archives = Vec::new();
    let entries = fs::read_dir(&config.directory)
        .map_err(|e| FileError::ListArchives(e, config.directory.display().to_string()))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| FileError::ListArchives(e, config.directory.display().to_string()))?;
        let path = entry.path();
        if path == current {
            continue;
        }
        let name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with(&config.prefix) || !name.ends_with(&suffix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        archives.push((path, modified));
    }
    Ok(archives)
}

impl Transport for SizeRotationFileTransport {
    fn name(&self) -> &str {
        "rotating-file"
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
        let formatted = match self.formatter.format(event) {
            Some(formatted) => formatted,
            None => return true,
        };
        let mut current = self.current.lock().unwrap();

        if current.written >= self.config.max_file_size {
            if let Err(err) = self.rotate(&mut current) {
                error!(self.logger, "rotation failed"; "error" => format!("{:?}", err));
                return false;
            }
        }

        let result = current
            .file
            .write_all(formatted.as_bytes())
            .and_then(|_| current.file.write_all(b"\n"));
        match result {
            Ok(()) => {
                current.written += formatted.as_bytes().len() as u64 + 1;
                true
            }
            Err(err) => {
                error!(self.logger, "failed to append event"; "error" => format!("{:?}", err));
                false
            }
        }
    }

    fn flush(&self) {
        let mut current = self.current.lock().unwrap();
        if let Err(err) = current.file.flush() {
            error!(self.logger, "failed to flush current file"; "error" => format!("{:?}", err));
        }
    }
}
