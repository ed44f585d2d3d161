//! Live sessions, claimed names, and everything that happens to them.
//!
//! The registry is owned by the server's event loop and mutated only there.
//! I/O tasks and timers talk to it through [`ServerEvent`]s.

use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::UnboundedSender,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    message::{self, DisconnectReason, MessageBuffer},
    session::{ConnId, FrameOutcome, NameSet, Session},
    transport::{Link, TransportEvent},
    write_queue::{WriteHandle, WriteQueue},
};

/// Completion delivered to the server's event loop.
#[derive(Debug)]
pub enum ServerEvent {
    Transport { conn: ConnId, event: TransportEvent },
    IdleTimeout { conn: ConnId, generation: u64 },
}

struct Connection {
    session: Session,
    queue: WriteQueue,
    link: Link,
}

pub struct Registry {
    idle_timeout: Duration,
    events: UnboundedSender<ServerEvent>,
    connections: BTreeMap<ConnId, Connection>,
    names: NameSet,
    next_id: ConnId,
}

impl Registry {
    pub fn new(config: &ServerConfig, events: UnboundedSender<ServerEvent>) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            events,
            connections: BTreeMap::new(),
            names: NameSet::new(),
            next_id: 1,
        }
    }

    /// Number of sessions, including ones whose transport is still closing.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_name_claimed(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn session(&self, conn: ConnId) -> Option<&Session> {
        self.connections.get(&conn).map(|connection| &connection.session)
    }

    /// Takes ownership of a freshly accepted stream and starts serving it.
    pub fn accept<S>(&mut self, stream: S, peer: Option<SocketAddr>) -> ConnId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.next_id;
        self.next_id += 1;

        let link = Link::spawn(stream, self.events.clone(), move |event| {
            ServerEvent::Transport { conn, event }
        });
        let mut session = Session::new(conn, peer);
        session
            .idle
            .arm(self.idle_timeout, &self.events, |generation| {
                ServerEvent::IdleTimeout { conn, generation }
            });

        self.connections.insert(
            conn,
            Connection {
                session,
                queue: WriteQueue::new(),
                link,
            },
        );
        info!(conn, ?peer, "connection accepted");
        conn
    }

    pub fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Transport { conn, event } => match event {
                TransportEvent::Read(chunk) => self.on_read(conn, &chunk),
                TransportEvent::Eof => {
                    debug!(conn, "peer closed the connection");
                    self.disconnect(conn, DisconnectReason::ConnectionClosed);
                }
                TransportEvent::ReadFailed(error) => {
                    warn!(conn, ?error, "read failed");
                    self.disconnect(conn, DisconnectReason::Error);
                }
                TransportEvent::WriteDone { handle, result } => {
                    self.on_write_done(conn, handle, result)
                }
                TransportEvent::Closed => self.on_closed(conn),
            },
            ServerEvent::IdleTimeout { conn, generation } => self.on_idle_timeout(conn, generation),
        }
    }

    /// Sends `text` to every active session.
    pub fn broadcast(&mut self, text: &str) {
        self.fan_out(text.as_bytes(), None);
    }

    /// Sends `text` to one session whether or not it has registered.
    pub fn send_single(&mut self, conn: ConnId, text: &str) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        debug!(conn, text, "sending directed message");
        enqueue(conn, connection, MessageBuffer::new(text));
        true
    }

    /// Tears a session down. The session leaves the registry once its
    /// transport reports the close.
    pub fn disconnect(&mut self, conn: ConnId, reason: DisconnectReason) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.session.is_closing() {
            return;
        }

        connection.session.idle.stop();
        connection.link.stop_reading();

        if matches!(reason, DisconnectReason::Timeout | DisconnectReason::Error) {
            enqueue(
                conn,
                connection,
                MessageBuffer::new(&message::disconnected(reason)),
            );
        }

        let name = connection.session.name().map(str::to_owned);
        if let Some(name) = &name {
            self.names.release(name);
        }
        connection.session.begin_close();
        let peer = connection.session.peer();
        info!(conn, ?peer, name = name.as_deref(), %reason, "session torn down");

        if let Some(name) = name {
            if reason != DisconnectReason::ConnectionClosed {
                self.broadcast(&message::left(&name, reason));
            }
        }

        // Queued writes get a bounded chance to flush; see `Link::close`.

        if let Some(connection) = self.connections.get(&conn) {
            connection.link.close();
        }
    }

    /// Announces the shutdown and tears every session down.
    pub fn shutdown(&mut self) {
        info!(sessions = self.connections.len(), "closing all sessions");
        self.broadcast(message::SERVER_TERMINATING);

        let conns: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in conns {
            self.disconnect(conn, DisconnectReason::ConnectionClosed);
        }
    }

    fn fan_out(&mut self, payload: &[u8], except: Option<ConnId>) {
        let mut message: Option<MessageBuffer> = None;
        let mut recipients = 0usize;

        for (&conn, connection) in self.connections.iter_mut() {
            if !connection.session.is_active() || except == Some(conn) {
                continue;
            }
            let message = message.get_or_insert_with(|| MessageBuffer::from_payload(payload));
            enqueue(conn, connection, message.clone());
            recipients += 1;
        }

        debug!(
            recipients,
            text = %String::from_utf8_lossy(payload),
            "broadcast"
        );
    }

    fn on_read(&mut self, conn: ConnId, chunk: &[u8]) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.session.is_closing() {
            return;
        }

        let frames = connection.session.split_frames(chunk);
        for frame in frames {
            if !self.on_frame(conn, &frame) {
                break;
            }
        }
    }

    /// Returns `false` once the session stops accepting frames.
    fn on_frame(&mut self, conn: ConnId, frame: &[u8]) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        let session = &mut connection.session;
        if session.is_closing() {
            return false;
        }

        session.idle.arm(self.idle_timeout, &self.events, |generation| {
            ServerEvent::IdleTimeout { conn, generation }
        });

        match session.on_frame(frame, &mut self.names) {
            FrameOutcome::Joined(name) => {
                info!(conn, name, "client registered");
                self.fan_out(message::joined(&name).as_bytes(), Some(conn));
                true
            }
            FrameOutcome::Rejected(name) => {
                warn!(conn, name, "name already taken");
                self.send_single(conn, message::NAME_TAKEN);
                self.disconnect(conn, DisconnectReason::DuplicateName);
                false
            }
            FrameOutcome::Message(payload) => {
                self.fan_out(&payload, None);
                true
            }
        }
    }

    fn on_write_done(&mut self, conn: ConnId, handle: WriteHandle, result: io::Result<()>) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let completed = connection.queue.complete(handle);

        match (result, completed) {
            (Ok(()), Some(done)) => trace!(conn, elapsed = ?done.elapsed, "write completed"),
            (Ok(()), None) => debug!(conn, ?handle, "completion for an unknown write"),
            (Err(error), _) => warn!(conn, ?error, "write failed, message dropped"),
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            debug!(
                conn,
                unsent = connection.queue.len(),
                "transport closed, session removed"
            );
        }
    }

    fn on_idle_timeout(&mut self, conn: ConnId, generation: u64) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if !connection.session.idle.fire(generation) {
            trace!(conn, generation, "stale idle timer");
            return;
        }

        info!(conn, "client idle for too long");
        self.disconnect(conn, DisconnectReason::Timeout);
    }
}

fn enqueue(conn: ConnId, connection: &mut Connection, message: MessageBuffer) {
    let handle = connection.queue.push(message.clone());
    if !connection.link.write(handle, message) {
        debug!(conn, "writer gone, dropping message");
        connection.queue.complete(handle);
    }
}
