//! Session data model (`SessionID`, `ProtocolMode`, `Direction`, `ClientSession`) and the session
//! table that indexes them.
//!
//! A [`ClientSession`] is a handle to one accepted/emulated socket: the actual read/write halves
//! live on a per-connection task, and `ClientSession` holds only what the rest of the link needs
//! to address and describe that socket (its outbound sender, its protocol mode, its arrival
//! queue) -- a channel-actor shape for per-connection state (a `Tx` handle plus metadata kept in
//! a shared map, not a direct reference to the socket).

use crate::module::ModulePipeline;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A 128-bit identifier stable for the lifetime of one external-side TCP connection.
/// Transmitted on the wire as 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Allocates a fresh, random session id. Called by the external proxy at accept time.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reads a session id from its 16-raw-byte wire form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16-raw-byte wire form of this session id.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Minecraft protocol mode. Starts at `Init`; transitions on handshake (to `Status`
/// or `Login`) and on login-success (to `Play`). Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolMode {
    /// Before the handshake packet has been seen.
    Init,
    /// Status-phase ping/pong exchange.
    Status,
    /// Login-phase exchange, up to and including `login_success`.
    Login,
    /// Normal gameplay.
    Play,
}

impl ProtocolMode {
    /// Advances to `mode`, ignoring the request if it would decrease the mode.
    pub fn advance_to(&mut self, mode: ProtocolMode) {
        if mode > *self {
            *self = mode;
        }
    }
}

/// Which side of the Minecraft packet table a connection endpoint should use to decode data it
/// receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Clientbound-facing (the external proxy's client-facing socket, or the internal proxy's
    /// decode direction for data arriving from the real server).
    Upstream,
    /// Serverbound-facing.
    Downstream,
}

impl Direction {
    /// The direction packets flow when *sent* from an endpoint with this handle direction: the
    /// opposite of the handle direction.
    #[must_use]
    pub fn send_direction(self) -> Direction {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }
}

/// A single decoded packet held in a session's arrival queue before the peer releases it.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// The packet's name, as resolved by the packet-name table.
    pub name: &'static str,
    /// The raw packet payload (post packet-id, pre re-encode).
    pub payload: Bytes,
}

/// Owned by whichever side accepted/originated the socket. The socket's read/write
/// halves live on a separate per-connection task; `outbound` is this session's handle to that
/// task's write half.
pub struct ClientSession {
    /// Stable session identifier.
    pub id: SessionId,
    /// Current Minecraft protocol mode.
    pub mode: ProtocolMode,
    /// Non-null only between accept and the peer's `release_queue`.
    /// `None` once the arrival queue has been drained -- it never becomes `Some` again.
    pub arrival_queue: Option<Vec<QueuedPacket>>,
    /// Ordered chain of optional per-connection handlers.
    pub modules: ModulePipeline,
    /// Sender half of this session's socket write task. `None` for the internal side's reserved
    /// sentinel entry before the emulated client's
    /// socket has been established.
    pub outbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Abort handle for the per-connection task reading this session's locally-owned socket.
    /// Aborted whenever the session is removed, so a peer-initiated `delete_conn` actually tears
    /// down the local socket rather than leaving its reader task running against a cleared entry.
    pub reader_task: Option<tokio::task::AbortHandle>,
}

impl ClientSession {
    /// Creates a new session in `Init` mode with an active arrival queue, for the external side
    /// at accept time.
    #[must_use]
    pub fn new_queued(id: SessionId, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            mode: ProtocolMode::Init,
            arrival_queue: Some(Vec::new()),
            modules: ModulePipeline::new(),
            outbound: Some(outbound),
            reader_task: None,
        }
    }

    /// Creates the internal side's reserved sentinel entry for a session id that has been
    /// `add_conn`'d but whose emulated client socket is not yet open.
    #[must_use]
    pub fn new_sentinel(id: SessionId) -> Self {
        Self {
            id,
            mode: ProtocolMode::Init,
            arrival_queue: None,
            modules: ModulePipeline::new(),
            outbound: None,
            reader_task: None,
        }
    }

    /// Whether this session is still a sentinel awaiting its emulated client connection.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.outbound.is_none()
    }

    /// Pushes a decoded packet into the arrival queue, if one is still active. Returns `false` if
    /// the queue has already been released (the caller should then forward the packet directly).
    pub fn enqueue(&mut self, packet: QueuedPacket) -> bool {
        match &mut self.arrival_queue {
            Some(queue) => {
                queue.push(packet);
                true
            }
            None => false,
        }
    }

    /// Drains and returns the arrival queue, nulling it forever.
    pub fn release_queue(&mut self) -> Vec<QueuedPacket> {
        self.arrival_queue.take().unwrap_or_default()
    }
}

/// `sessions: map SessionID -> ClientSession`, owned by a single side's IO task.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, ClientSession>,
}

impl SessionTable {
    /// Creates an empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session, replacing any previous entry with the same id.
    pub fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.id, session);
    }

    /// Looks up a session by id.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Looks up a session mutably by id.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    /// Removes and returns a session by id (used on `delete_conn` and on socket close).
    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    /// Removes a session by id and aborts its reader task, if any. Used whenever a session's
    /// teardown isn't also tearing down the local socket some other way (the common case for
    /// both a peer-initiated `delete_conn` and a locally-observed socket close).
    pub fn remove_and_abort(&mut self, id: SessionId) -> Option<ClientSession> {
        let session = self.sessions.remove(&id)?;
        if let Some(handle) = &session.reader_task {
            handle.abort();
        }
        Some(session)
    }

    /// Whether a session with this id is present.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of sessions currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Finds the first sentinel entry still awaiting its emulated client.
    #[must_use]
    pub fn first_sentinel(&self) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.is_sentinel())
            .map(|session| session.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_mode_never_decreases() {
        let mut mode = ProtocolMode::Play;
        mode.advance_to(ProtocolMode::Login);
        assert_eq!(mode, ProtocolMode::Play);
        mode.advance_to(ProtocolMode::Play);
        assert_eq!(mode, ProtocolMode::Play);
    }

    #[test]
    fn protocol_mode_advances_forward() {
        let mut mode = ProtocolMode::Init;
        mode.advance_to(ProtocolMode::Login);
        assert_eq!(mode, ProtocolMode::Login);
    }

    #[test]
    fn direction_send_direction_is_opposite() {
        assert_eq!(Direction::Upstream.send_direction(), Direction::Downstream);
        assert_eq!(Direction::Downstream.send_direction(), Direction::Upstream);
    }

    #[test]
    fn session_id_roundtrips_through_wire_bytes() {
        let id = SessionId::new();
        let bytes = id.to_bytes();
        assert_eq!(SessionId::from_bytes(bytes), id);
    }

    #[test]
    fn arrival_queue_releases_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = ClientSession::new_queued(SessionId::new(), tx);
        assert!(session.enqueue(QueuedPacket {
            name: "handshake",
            payload: Bytes::new(),
        }));
        let released = session.release_queue();
        assert_eq!(released.len(), 1);
        assert!(session.arrival_queue.is_none());
        // a further enqueue is now rejected, not silently re-opened.
        assert!(!session.enqueue(QueuedPacket {
            name: "handshake",
            payload: Bytes::new(),
        }));
    }

    #[test]
    fn session_table_finds_first_sentinel() {
        let mut table = SessionTable::new();
        let id = SessionId::new();
        table.insert(ClientSession::new_sentinel(id));
        assert_eq!(table.first_sentinel(), Some(id));
        table.get_mut(id).unwrap().outbound = {
            let (tx, _rx) = mpsc::unbounded_channel();
            Some(tx)
        };
        assert_eq!(table.first_sentinel(), None);
    }
}
