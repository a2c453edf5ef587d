mod browser;
mod connection;
mod packet;

pub use browser::{BrowseEvent, Browser, BrowserHandle, MdnsBrowser, Peer, StaticBrowser};
pub use packet::{
    AppInfo, ClientHello, DeviceInfo, FrameError, Packet, PacketCode, FRAME_HEADER_LEN,
};

use crate::{
    diagnostics::keys,
    event::Event,
    level::Level,
    queue::{QueueKind, WorkQueue},
    transport::Transport,
};
use bytes::Bytes;
use connection::{connect_in_background, ConnEmitter, ConnEvent, Connection};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use slog::{debug, error, info, warn, Logger};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// DNS-SD service type to browse for.
    pub service_type: String,
    /// Connect to the peer advertising exactly this name.
    pub auto_connect_name: Option<String>,
    /// Connect to the first peer that shows up.
    pub auto_connect_any: bool,
    /// Optional stable device identifier for the hello document.
    pub device_id: Option<String>,
    /// Bound on the pending buffer (pre-connect window and paused state).
    pub pending_capacity: usize,
    /// How long after construction events are buffered while no
    /// connection exists. Afterwards they are dropped silently.
    #[serde(with = "crate::config::duration_secs")]
    pub buffer_window: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub ping_interval: Duration,
    /// Going this long without a peer ping while connected forces a
    /// reconnect.
    #[serde(with = "crate::config::duration_secs")]
    pub ping_watchdog: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub connect_timeout: Duration,
    pub min_level: Option<Level>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            service_type: "_lantern._tcp.local.".to_owned(),
            auto_connect_name: None,
            auto_connect_any: true,
            device_id: None,
            pending_capacity: 500,
            buffer_window: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(2),
            ping_watchdog: Duration::from_secs(4),
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            min_level: None,
        }
    }
}

/// Externally observable connection state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteState {
    Idle,
    Connecting,
    Connected,
}

struct Observed {
    state: AtomicU8,
    paused: AtomicBool,
    dropped: AtomicU64,
}

impl Observed {
    fn publish(&self, state: RemoteState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn read(&self) -> RemoteState {
        match self.state.load(Ordering::SeqCst) {
            0 => RemoteState::Idle,
            1 => RemoteState::Connecting,
            _ => RemoteState::Connected,
        }
    }
}

enum Command {
    Record(Arc<Event>),
    Start,
    Stop,
    Browse(BrowseEvent),
    Conn(ConnEvent),
    Shutdown,
}

/// Streams events to a server discovered on the local network, over a
/// framed binary protocol with handshake, keep-alive pings and a
/// pause/resume contract. The transport owns at most one connection at a
/// time; a single actor thread runs the whole state machine, consuming
/// typed commands from producers, the browser and the connection's reader.
/// Network trouble never reaches producers; it is logged and drives the
/// retry loop.
pub struct RemoteTransport {
    queue: WorkQueue,
    enabled: AtomicBool,
    min_level: Option<Level>,
    tx: Sender<Command>,
    actor: Mutex<Option<JoinHandle<()>>>,
    observed: Arc<Observed>,
}

impl RemoteTransport {
    /// Creates the transport and starts browsing immediately.
    pub fn new(
        config: RemoteConfig,
        browser: Arc<dyn Browser>,
        logger: &Logger,
    ) -> Arc<RemoteTransport> {
        let (tx, rx) = unbounded();
        let observed = Arc::new(Observed {
            state: AtomicU8::new(RemoteState::Idle as u8),
            paused: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let min_level = config.min_level;
        let logger = logger.new(slog::o!(keys::TRANSPORT => "remote"));

        let actor_tx = tx.clone();
        let actor_observed = Arc::clone(&observed);
        let actor = thread::Builder::new()
            .name("lantern-remote".to_owned())
            .spawn(move || {
                Actor::new(config, browser, actor_tx, rx, actor_observed, logger).run();
            })
            .expect("failed to spawn remote transport actor");

        let _ = tx.send(Command::Start);
        Arc::new(RemoteTransport {
            queue: WorkQueue::new(QueueKind::Serial, "remote"),
            enabled: AtomicBool::new(true),
            min_level,
            tx,
            actor: Mutex::new(Some(actor)),
            observed,
        })
    }

    pub fn state(&self) -> RemoteState {
        self.observed.read()
    }

    pub fn is_paused(&self) -> bool {
        self.observed.paused.load(Ordering::SeqCst)
    }

    /// Events dropped because the pre-connect window had closed with no
    /// connection available.
    pub fn dropped_count(&self) -> u64 {
        self.observed.dropped.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        let _ = self.tx.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

impl Transport for RemoteTransport {
    fn name(&self) -> &str {
        "remote"
    }

    fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.start();
        } else {
            self.stop();
        }
    }

    fn min_level(&self) -> Option<Level> {
        self.min_level
    }

    fn record(&self, event: &Arc<Event>) -> bool {
        self.tx.send(Command::Record(Arc::clone(event))).is_ok()
    }

    fn shutdown(&self) {
        self.stop();
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(actor) = self.actor.lock().unwrap().take() {
            let _ = actor.join();
        }
    }
}

enum State {
    Idle,
    Connecting {
        peer: Option<Peer>,
        conn: Option<Connection>,
        hello_deadline: Option<Instant>,
        retry_at: Option<Instant>,
    },
    Connected {
        peer: Peer,
        conn: Connection,
        paused: bool,
        last_peer_ping: Instant,
        next_ping: Instant,
    },
}

struct Actor {
    config: RemoteConfig,
    browser: Arc<dyn Browser>,
    browser_handle: Option<BrowserHandle>,
    tx: Sender<Command>,
    rx: Receiver<Command>,
    state: State,
    generation: u64,
    pending: VecDeque<Arc<Event>>,
    window_deadline: Instant,
    observed: Arc<Observed>,
    logger: Logger,
}

impl Actor {
    fn new(
        config: RemoteConfig,
        browser: Arc<dyn Browser>,
        tx: Sender<Command>,
        rx: Receiver<Command>,
        observed: Arc<Observed>,
        logger: Logger,
    ) -> Actor {
        let window_deadline = Instant::now() + config.buffer_window;
        Actor {
            config,
            browser,
            browser_handle: None,
            tx,
            rx,
            state: State::Idle,
            generation: 0,
            pending: VecDeque::new(),
            window_deadline,
            observed,
            logger,
        }
    }

    fn run(mut self) {
        loop {
            self.publish();
            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            match self.rx.recv_timeout(timeout) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.teardown();
                    return;
                }
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => self.handle_deadlines(),
            }
        }
    }

    fn publish(&self) {
        let (state, paused) = match &self.state {
            State::Idle => (RemoteState::Idle, false),
            State::Connecting { .. } => (RemoteState::Connecting, false),
            State::Connected { paused, .. } => (RemoteState::Connected, *paused),
        };
        self.observed.publish(state);
        self.observed.paused.store(paused, Ordering::SeqCst);
    }

    fn emitter(&self) -> ConnEmitter {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(Command::Conn(event));
        })
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Record(event) => self.handle_record(event),
            Command::Start => self.handle_start(),
            Command::Stop => self.teardown(),
            Command::Browse(event) => self.handle_browse(event),
            Command::Conn(event) => self.handle_conn(event),
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_start(&mut self) {
        if !matches!(self.state, State::Idle) {
            return;
        }
        let tx = self.tx.clone();
        let on_event = Box::new(move |event: BrowseEvent| {
            let _ = tx.send(Command::Browse(event));
        });
        match self.browser.browse(&self.config.service_type, on_event) {
            Ok(handle) => {
                info!(self.logger, "browsing for peers"; "service_type" => self.config.service_type.clone());
                self.browser_handle = Some(handle);
                self.state = State::Connecting {
                    peer: None,
                    conn: None,
                    hello_deadline: None,
                    retry_at: None,
                };
            }
            Err(err) => {
                error!(self.logger, "failed to start browsing"; "error" => format!("{:?}", err));
            }
        }
    }

    fn handle_browse(&mut self, event: BrowseEvent) {
        match event {
            BrowseEvent::Found(found) => {
                let wanted = match &self.config.auto_connect_name {
                    Some(name) => found.name == *name || found.name.starts_with(name),
                    None => self.config.auto_connect_any,
                };
                let waiting_for_peer = matches!(
                    self.state,
                    State::Connecting { peer: None, .. }
                );
                if !wanted || !waiting_for_peer {
                    return;
                }
                info!(
                    self.logger, "connecting to peer";
                    keys::PEER => found.name.clone(),
                    "addr" => found.addr.to_string(),
                );
                let addr = found.addr;
                if let State::Connecting { peer, .. } = &mut self.state {
                    *peer = Some(found);
                }
                self.generation += 1;
                connect_in_background(
                    self.generation,
                    addr,
                    self.config.connect_timeout,
                    self.emitter(),
                );
            }
            BrowseEvent::Lost(name) => {
                debug!(self.logger, "peer disappeared"; keys::PEER => name);
            }
        }
    }

    fn handle_conn(&mut self, event: ConnEvent) {
        let generation = match &event {
            ConnEvent::Ready { generation, .. }
            | ConnEvent::Failed { generation, .. }
            | ConnEvent::Packet { generation, .. }
            | ConnEvent::Closed { generation, .. } => *generation,
        };
        if generation != self.generation {
            // A straggler from a connection we already abandoned.
            return;
        }

        match event {
            ConnEvent::Ready { stream, .. } => self.handle_ready(stream),
            ConnEvent::Failed { reason, .. } => {
                warn!(self.logger, "connection attempt failed"; "reason" => reason);
                self.schedule_retry();
            }
            ConnEvent::Packet { packet, .. } => self.handle_packet(packet),
            ConnEvent::Closed { reason, .. } => {
                error!(self.logger, "connection lost"; "reason" => reason);
                self.schedule_retry();
            }
        }
    }

    fn handle_ready(&mut self, stream: std::net::TcpStream) {
        if !matches!(self.state, State::Connecting { .. }) {
            return;
        }
        let mut connection = match Connection::start(self.generation, stream, self.emitter()) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(self.logger, "failed to adopt socket"; "error" => format!("{:?}", err));
                self.schedule_retry();
                return;
            }
        };
        let hello = Packet::ClientHello(ClientHello::for_this_process(
            self.config.device_id.clone(),
        ));
        if let Err(err) = connection.send(&hello) {
            warn!(self.logger, "failed to send hello"; "error" => format!("{:?}", err));
            connection.close();
            self.schedule_retry();
            return;
        }
        if let State::Connecting {
            conn,
            hello_deadline,
            ..
        } = &mut self.state
        {
            *conn = Some(connection);
            *hello_deadline = Some(Instant::now() + self.config.handshake_timeout);
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        if matches!(self.state, State::Connecting { .. }) {
            if matches!(packet, Packet::ServerHello) {
                self.enter_connected();
            } else {
                debug!(self.logger, "ignoring packet before handshake");
            }
            return;
        }

        let mut drain = false;
        if let State::Connected {
            paused,
            last_peer_ping,
            ..
        } = &mut self.state
        {
            match packet {
                Packet::Ping => *last_peer_ping = Instant::now(),
                Packet::Pause => {
                    info!(self.logger, "server paused logging");
                    *paused = true;
                }
                Packet::Resume => {
                    info!(self.logger, "server resumed logging");
                    *paused = false;
                    drain = true;
                }
                other => {
                    debug!(self.logger, "ignoring unexpected packet"; "code" => other.code() as u8);
                }
            }
        }
        if drain {
            self.drain_pending();
        }
    }

    fn enter_connected(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Connecting {
                peer: Some(peer),
                conn: Some(conn),
                ..
            } => {
                info!(self.logger, "connected"; keys::PEER => peer.name.clone());
                let now = Instant::now();
                self.state = State::Connected {
                    peer,
                    conn,
                    paused: false,
                    last_peer_ping: now,
                    // First keep-alive goes out right away.
                    next_ping: now,
                };
                self.drain_pending();
            }
            // A serverHello with no chosen peer or socket; recover with a
            // clean retry.
            other => {
                self.state = other;
                self.schedule_retry();
            }
        }
    }

    fn handle_record(&mut self, event: Arc<Event>) {
        let live = matches!(self.state, State::Connected { paused: false, .. });
        if live {
            let body = match serde_json::to_vec(event.as_ref()) {
                Ok(body) => body,
                Err(err) => {
                    warn!(self.logger, "failed to encode event"; "error" => format!("{:?}", err));
                    return;
                }
            };
            let send_failed = match &mut self.state {
                State::Connected { conn, .. } => {
                    conn.send(&Packet::Message(Bytes::from(body))).is_err()
                }
                _ => false,
            };
            if send_failed {
                error!(self.logger, "failed to send event");
                self.schedule_retry();
            }
            return;
        }

        if matches!(self.state, State::Connected { paused: true, .. }) {
            self.buffer_pending(event);
        } else if Instant::now() < self.window_deadline {
            self.buffer_pending(event);
        } else {
            let dropped = self.observed.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(self.logger, "dropped event outside buffer window"; keys::DROPPED => dropped);
        }
    }

    fn buffer_pending(&mut self, event: Arc<Event>) {
        if self.pending.len() == self.config.pending_capacity {
            self.pending.pop_front();
            self.observed.dropped.fetch_add(1, Ordering::SeqCst);
        }
        self.pending.push_back(event);
    }

    fn drain_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            let body = match serde_json::to_vec(event.as_ref()) {
                Ok(body) => body,
                Err(_) => continue,
            };
            let send_failed = match &mut self.state {
                State::Connected { conn, .. } => {
                    conn.send(&Packet::Message(Bytes::from(body))).is_err()
                }
                _ => return,
            };
            if send_failed {
                self.pending.push_front(event);
                self.schedule_retry();
                return;
            }
        }
    }

    /// Drops the active connection (if any) and arms the retry timer,
    /// keeping the chosen peer so the retry reopens to the same server.
    fn schedule_retry(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        let peer = match state {
            State::Connecting { peer, conn, .. } => {
                if let Some(conn) = conn {
                    conn.close();
                }
                peer
            }
            State::Connected { peer, conn, .. } => {
                conn.close();
                Some(peer)
            }
            State::Idle => None,
        };
        self.generation += 1;
        self.state = State::Connecting {
            peer,
            conn: None,
            hello_deadline: None,
            retry_at: Some(Instant::now() + self.config.retry_delay),
        };
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        enum Due {
            HandshakeTimeout,
            Retry(Option<std::net::SocketAddr>),
            Watchdog,
            Ping,
            Nothing,
        }

        let due = match &self.state {
            State::Connecting {
                peer,
                conn,
                hello_deadline,
                retry_at,
            } => {
                if conn.is_some() && hello_deadline.map_or(false, |deadline| now >= deadline) {
                    Due::HandshakeTimeout
                } else if retry_at.map_or(false, |at| now >= at) {
                    Due::Retry(peer.as_ref().map(|peer| peer.addr))
                } else {
                    Due::Nothing
                }
            }
            State::Connected {
                last_peer_ping,
                next_ping,
                ..
            } => {
                if now.duration_since(*last_peer_ping) >= self.config.ping_watchdog {
                    Due::Watchdog
                } else if now >= *next_ping {
                    Due::Ping
                } else {
                    Due::Nothing
                }
            }
            State::Idle => Due::Nothing,
        };

        match due {
            Due::HandshakeTimeout => {
                error!(self.logger, "handshake timed out");
                self.schedule_retry();
            }
            Due::Retry(addr) => {
                if let State::Connecting { retry_at, .. } = &mut self.state {
                    *retry_at = None;
                }
                // With no chosen peer there is nothing to redial; browsing
                // continues.
                if let Some(addr) = addr {
                    self.generation += 1;
                    connect_in_background(
                        self.generation,
                        addr,
                        self.config.connect_timeout,
                        self.emitter(),
                    );
                }
            }
            Due::Watchdog => {
                error!(self.logger, "no ping from peer; reconnecting");
                self.schedule_retry();
            }
            Due::Ping => {
                let send_failed = match &mut self.state {
                    State::Connected {
                        conn, next_ping, ..
                    } => {
                        *next_ping = now + self.config.ping_interval;
                        conn.send(&Packet::Ping).is_err()
                    }
                    _ => false,
                };
                if send_failed {
                    error!(self.logger, "failed to send ping");
                    self.schedule_retry();
                }
            }
            Due::Nothing => {}
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Idle => None,
            State::Connecting {
                hello_deadline,
                retry_at,
                ..
            } => match (*hello_deadline, *retry_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            },
            State::Connected {
                last_peer_ping,
                next_ping,
                ..
            } => {
                let watchdog = *last_peer_ping + self.config.ping_watchdog;
                Some((*next_ping).min(watchdog))
            }
        }
    }

    fn teardown(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Connecting {
                conn: Some(conn), ..
            } => conn.close(),
            State::Connected { conn, .. } => conn.close(),
            _ => {}
        }
        if let Some(handle) = self.browser_handle.take() {
            handle.stop();
        }
        self.generation += 1;
        self.publish();
    }
}
