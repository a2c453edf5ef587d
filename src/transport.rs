mod buffered;
mod file;
mod http;
mod remote;
mod sqlite;
mod throttled;

use crate::{event::Event, level::Level, queue::WorkQueue};
use std::sync::Arc;

pub use buffered::BufferedTransport;
pub use file::{
    FileError, FileTransport, RotationConfig, RotationDelegate, RotationEvent,
    SizeRotationFileTransport,
};
pub use http::{BulkHttpTransport, UploadError, UploadPolicy, UploaderConfig};
pub use remote::{
    AppInfo, BrowseEvent, Browser, BrowserHandle, ClientHello, DeviceInfo, FrameError,
    MdnsBrowser, Packet, PacketCode, Peer, RemoteConfig, RemoteState, RemoteTransport,
    StaticBrowser, FRAME_HEADER_LEN,
};
pub use sqlite::{SqliteConfig, SqliteDelegate, SqliteError, SqliteTransport};
pub use throttled::{
    FlushReason, ThrottledConfig, ThrottledDelegate, ThrottledItem, ThrottledTransport,
};

/// A transport moves events out of the pipeline and into some destination,
/// such as a file, a local database, or a remote collector. Each transport
/// owns a scheduling queue; the manager runs `record` on that queue, so a
/// serial queue gives the transport events in submission order. Errors
/// inside `record` never propagate to producers; they are reported through
/// the transport's own delegate or diagnostic logger and `record` returns
/// `false`.
pub trait Transport: Send + Sync {
    /// A short name identifying this transport in diagnostics and metrics.
    fn name(&self) -> &str;

    /// The queue this transport's deliveries are scheduled on.
    fn queue(&self) -> &WorkQueue;

    /// Whether the transport currently accepts events.
    fn is_enabled(&self) -> bool;

    /// Enables or disables the transport at runtime.
    fn set_enabled(&self, enabled: bool);

    /// If set, events below this severity are not delivered to this
    /// transport even when the owning logger accepts them.
    fn min_level(&self) -> Option<Level> {
        None
    }

    /// Delivers one event. Returns false if the transport failed to handle
    /// it; the failure has already been reported out-of-band.
    fn record(&self, event: &Arc<Event>) -> bool;

    /// Forces any buffered state out to the destination.
    fn flush(&self) {}

    /// Releases resources ahead of drop. Buffered transports deliver a
    /// final batch here.
    fn shutdown(&self) {}
}

/// Whether `transport` should observe `event`, per its enable flag and
/// minimum accepted level.
pub(crate) fn transport_accepts(transport: &dyn Transport, event: &Event) -> bool {
    if !transport.is_enabled() {
        return false;
    }
    match transport.min_level() {
        Some(min) => min.admits(event.level),
        None => true,
    }
}
