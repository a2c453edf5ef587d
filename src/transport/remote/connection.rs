use super::packet::Packet;
use bytes::BytesMut;
use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Lifecycle and traffic notifications from a connection. Every event
/// carries the generation of the connection attempt that produced it, so
/// the transport can discard stragglers from a connection it has already
/// abandoned.
pub(crate) enum ConnEvent {
    Ready {
        generation: u64,
        stream: TcpStream,
    },
    Failed {
        generation: u64,
        reason: String,
    },
    Packet {
        generation: u64,
        packet: Packet,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

pub(crate) type ConnEmitter = Arc<dyn Fn(ConnEvent) + Send + Sync>;

/// Opens a TCP connection off the transport's thread. The outcome arrives
/// as a `Ready` or `Failed` event.
pub(crate) fn connect_in_background(
    generation: u64,
    addr: SocketAddr,
    timeout: Duration,
    emit: ConnEmitter,
) {
    let spawn_emit = emit.clone();
    let spawned = thread::Builder::new()
        .name("lantern-remote-connect".to_owned())
        .spawn(move || match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                spawn_emit(ConnEvent::Ready { generation, stream });
            }
            Err(err) => spawn_emit(ConnEvent::Failed {
                generation,
                reason: err.to_string(),
            }),
        });
    if let Err(err) = spawned {
        emit(ConnEvent::Failed {
            generation,
            reason: format!("failed to spawn connect thread: {}", err),
        });
    }
}

/// An established connection: the socket, its receive buffer, and the
/// reader thread that turns incoming bytes into packet events. Sending
/// happens from the transport's thread; receiving and decoding happen on
/// the reader thread, which tags everything with the connection's
/// generation.
pub(crate) struct Connection {
    generation: u64,
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn start(
        generation: u64,
        stream: TcpStream,
        emit: ConnEmitter,
    ) -> std::io::Result<Connection> {
        let read_half = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name("lantern-remote-read".to_owned())
            .spawn(move || read_loop(generation, read_half, emit))?;
        Ok(Connection {
            generation,
            stream,
            reader: Some(reader),
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Writes one framed packet. The write is complete when this returns;
    /// failures mean the connection is unusable.
    pub(crate) fn send(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let mut frame = BytesMut::new();
        packet.encode(&mut frame)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Shuts the socket down and waits for the reader thread to finish.
    pub(crate) fn close(mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn read_loop(generation: u64, mut stream: TcpStream, emit: ConnEmitter) {
    let mut receive = BytesMut::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                emit(ConnEvent::Closed {
                    generation,
                    reason: "peer closed the connection".to_owned(),
                });
                return;
            }
            Ok(n) => {
                receive.extend_from_slice(&chunk[..n]);
                loop {
                    match Packet::decode(&mut receive) {
                        Ok(Some(packet)) => emit(ConnEvent::Packet { generation, packet }),
                        // Not enough data is the normal resting state.
                        Ok(None) => break,
                        Err(err) => {
                            emit(ConnEvent::Closed {
                                generation,
                                reason: format!("protocol error: {}", err),
                            });
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                emit(ConnEvent::Closed {
                    generation,
                    reason: err.to_string(),
                });
                return;
            }
        }
    }
}
