//! Structured, multi-transport event logging pipeline: producers write
//! events through per-severity channels; a transport manager runs filters
//! and fans accepted events out to file, SQLite, remote and HTTP
//! destinations, each on its own work queue.

use transport::{FileError, FrameError, SqliteError, UploadError};

pub mod config;
pub mod diagnostics;
pub mod event;
pub mod filter;
pub mod format;
pub mod level;
pub mod log;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod queue;
mod retries;
pub mod scope;
pub mod serialize;
pub mod transport;

pub use event::{Event, Value};
pub use filter::Filter;
pub use format::Formatter;
pub use level::Level;
pub use log::{Channel, Log, LogBuilder};
pub use manager::TransportManager;
pub use message::Message;
pub use scope::Scope;
pub use serialize::{SerializableData, SerializableObject, SerializationStrategy};
pub use transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Sqlite(#[from] SqliteError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
