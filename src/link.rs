//! Inter-proxy link protocol: the single multiplexed, framed, compressed, optionally
//! encrypted TCP connection joining the external and internal proxies.
//!
//! A [`LinkConnection`] owns one such socket end-to-end: the framed transport, the ordered
//! outbound pipeline (poem encode -> compress -> encrypt -> write, via the compressor and cipher
//! worker pools and their reassemblers), the inbound pipeline (read -> decrypt -> decompress -> poem decode ->
//! dispatch), and the session table the poem's items address into. Control packets
//! (`add_conn`, `delete_conn`, `release_queue`, `auth`, `toggle_chunk`) bypass the poem batching
//! entirely -- they're small and rare enough that there's nothing to gain from parking them behind
//! the compressor.
//!
//! Follows the same per-connection actor shape used for a single Minecraft client connection (one
//! task owns one socket, `tokio::select!` over the events that can move that socket's state
//! forward), generalized here to own the inter-proxy link instead.

use crate::auth;
use crate::chunk_cache::ChunkKey;
use crate::chunk_cache_module::ChunkCacheRelay;
use crate::cipher::LinkKey;
use crate::codec::{ByteReader, ByteWriter, LengthPrefixedCodec};
use crate::compression;
use crate::error::{CodecError, LinkError};
use crate::mc_adapter;
use crate::module::HandlerDirection;
use crate::reassembler::Reassembler;
use crate::session::{ClientSession, Direction, ProtocolMode, QueuedPacket, SessionId, SessionTable};
use crate::workpool::{self, spawn_pool, WorkerPool};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval};
use tokio_util::codec::{Framed, FramedRead};
use tracing::{debug, warn};

/// Largest single locally-framed Minecraft packet this core accepts off a client or emulated
/// client socket, before it's decoded and folded into a poem item.
const MAX_CLIENT_FRAME: usize = 2 * 1024 * 1024;

const LINK_POEM: i32 = 0;
const LINK_DELETE_CONN: i32 = 1;
const LINK_ADD_CONN: i32 = 2;
const LINK_RELEASE_QUEUE: i32 = 3;
const LINK_AUTH: i32 = 4;
const LINK_TOGGLE_CHUNK: i32 = 5;

/// Maximum size of one framed link message. The poem container can legitimately grow large
/// (many sessions' backlog batched into one flush), so this is generous next to a single
/// Minecraft packet's cap.
const MAX_LINK_FRAME: usize = 16 * 1024 * 1024;

/// Which end of the link this connection instance represents. Determines which packet table a
/// forwarded packet is encoded under, and who initiates authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// The client-facing proxy. Dials the internal proxy and reconnects with backoff on failure.
    External,
    /// The server-facing proxy. Listens for the external proxy's link connection.
    Internal,
}

impl LinkRole {
    /// Direction a packet is encoded under when forwarded from the link to this endpoint's local
    /// socket (the client socket on the external side, the emulated-client socket on the internal
    /// side).
    #[must_use]
    fn forward_direction(self) -> Direction {
        match self {
            LinkRole::External => Direction::Upstream,
            LinkRole::Internal => Direction::Downstream,
        }
    }

    /// Direction a packet arriving on this endpoint's local socket should be decoded under, before
    /// it's queued onto the link.
    #[must_use]
    fn decode_direction(self) -> Direction {
        self.forward_direction().send_direction()
    }
}

/// An event originating on this side's own locally-owned sockets, fed into the link's select
/// loop so that the session table stays owned by the single task running
/// [`LinkConnection::run`]. The external side's accept loop and the internal side's
/// emulated-client connector both produce these rather than touching the session table directly.
pub enum LocalEvent {
    /// The external side accepted a new client TCP connection. `read_half` is handed to a reader
    /// task spawned once `id` is registered, so its frames are already tagged correctly; `modules`
    /// are mounted onto the new session before `on_connect` fires.
    ExternalAccepted {
        id: SessionId,
        outbound: mpsc::UnboundedSender<Bytes>,
        modules: Vec<Box<dyn crate::module::Module>>,
        read_half: OwnedReadHalf,
    },
    /// The internal side's emulated client socket to the real server is up. Fills the oldest
    /// still-sentinel session entry, not a specific id -- the connector doesn't know in advance
    /// which session it was opened for, so its reader task is spawned here once that id is known.
    EmulatedConnected {
        outbound: mpsc::UnboundedSender<Bytes>,
        read_half: OwnedReadHalf,
    },
    /// A raw length-prefixed frame read off a locally-owned socket, not yet decoded.
    Frame { id: SessionId, frame: Bytes },
    /// A locally-owned socket closed (EOF or error).
    Closed { id: SessionId },
}

/// Reads length-prefixed frames off a locally-owned socket's read half and forwards each as a
/// [`LocalEvent::Frame`] tagged with `id`, then reports the close. Shared by the external side's
/// client-socket readers and the internal side's emulated-client-socket reader, since both sides
/// read raw framed Minecraft packets off a plain `OwnedReadHalf` the same way.
pub(crate) async fn read_socket_loop(id: SessionId, read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<LocalEvent>) {
    let mut framed = FramedRead::new(read_half, LengthPrefixedCodec::new(MAX_CLIENT_FRAME));
    while let Some(frame) = framed.next().await {
        match frame {
            Ok(bytes) => {
                if tx.send(LocalEvent::Frame { id, frame: bytes.freeze() }).is_err() {
                    return;
                }
            }
            Err(_) => break,
        }
    }
    let _ = tx.send(LocalEvent::Closed { id });
}

/// One item inside a `poem` container: a session-addressed, already-decoded packet.
#[derive(Debug, Clone)]
pub struct PoemItem {
    pub session: SessionId,
    pub name: &'static str,
    pub payload: Bytes,
}

impl PoemItem {
    fn encode(&self) -> Vec<u8> {
        let mut inner = ByteWriter::new();
        inner.write_string(self.name);
        inner.write_raw(&self.payload);

        let mut outer = ByteWriter::new();
        outer.write_uuid(&self.session.0);
        outer.write_byte_array(&inner.into_inner());
        outer.into_inner()
    }
}

/// Concatenates a batch of poem items into one body, in order.
fn encode_poem_body(items: &[PoemItem]) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        body.extend(item.encode());
    }
    body
}

/// Parses as many whole items as `data` holds; a trailing partial item (which should never happen
/// once a poem body has round-tripped through the reassemblers intact, but could follow a worker
/// failure that dropped bytes) is silently discarded rather than treated as fatal.
fn parse_poem_items(data: &[u8]) -> Vec<PoemItem> {
    let mut reader = ByteReader::new(data);
    let mut items = Vec::new();

    while reader.remaining() > 0 {
        let checkpoint = reader.save();
        let parsed: Result<PoemItem, CodecError> = (|| {
            let session = reader.read_uuid()?;
            let inner = reader.read_byte_array()?;
            let mut inner_reader = ByteReader::new(&inner);
            let name = inner_reader.read_string()?;
            let payload = inner_reader.read_remaining();
            Ok(PoemItem {
                session: SessionId(session),
                name: mc_adapter::intern(&name),
                payload: Bytes::from(payload),
            })
        })();

        match parsed {
            Ok(item) => items.push(item),
            Err(_) => {
                reader.restore(checkpoint);
                break;
            }
        }
    }
    items
}

/// A link-level control message, decoded from everything but the `poem` packet (which is handled
/// specially since its body goes through the compress/cipher pipeline).
#[derive(Debug, Clone)]
pub enum ControlPacket {
    DeleteConn(SessionId),
    AddConn(SessionId),
    ReleaseQueue(SessionId),
    Auth { salt: Vec<u8>, hash: Vec<u8> },
    ToggleChunk { dimension: i32, key: ChunkKey },
}

impl ControlPacket {
    fn id(&self) -> i32 {
        match self {
            ControlPacket::DeleteConn(_) => LINK_DELETE_CONN,
            ControlPacket::AddConn(_) => LINK_ADD_CONN,
            ControlPacket::ReleaseQueue(_) => LINK_RELEASE_QUEUE,
            ControlPacket::Auth { .. } => LINK_AUTH,
            ControlPacket::ToggleChunk { .. } => LINK_TOGGLE_CHUNK,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_varint(self.id());
        match self {
            ControlPacket::DeleteConn(id) | ControlPacket::AddConn(id) | ControlPacket::ReleaseQueue(id) => {
                writer.write_uuid(&id.0);
            }
            ControlPacket::Auth { salt, hash } => {
                writer.write_byte_array(salt);
                writer.write_byte_array(hash);
            }
            ControlPacket::ToggleChunk { dimension, key } => {
                writer.write_varint(*dimension);
                writer.write_raw(&key.0);
            }
        }
        writer.into_inner()
    }

    fn decode(id: i32, body: &[u8]) -> Result<Self, LinkError> {
        let mut reader = ByteReader::new(body);
        let packet = match id {
            LINK_DELETE_CONN => ControlPacket::DeleteConn(SessionId(reader.read_uuid()?)),
            LINK_ADD_CONN => ControlPacket::AddConn(SessionId(reader.read_uuid()?)),
            LINK_RELEASE_QUEUE => ControlPacket::ReleaseQueue(SessionId(reader.read_uuid()?)),
            LINK_AUTH => {
                let salt = reader.read_byte_array()?;
                let hash = reader.read_byte_array()?;
                ControlPacket::Auth { salt, hash }
            }
            LINK_TOGGLE_CHUNK => {
                let dimension = reader.read_varint()?;
                let mut key = [0u8; 8];
                for b in &mut key {
                    *b = reader.read_u8()?;
                }
                ControlPacket::ToggleChunk {
                    dimension,
                    key: ChunkKey(key),
                }
            }
            other => return Err(LinkError::UnknownPacketId(other as u64)),
        };
        Ok(packet)
    }
}

type ByteTransform = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Encodes `(name, payload)` under `(mode, direction)` and hands it to the session's socket
/// writer task, dropping it silently if the name isn't resolvable.
fn deliver(mode: crate::session::ProtocolMode, direction: Direction, outbound: &mpsc::UnboundedSender<Bytes>, name: &str, payload: &[u8]) {
    if let Some(encoded) = mc_adapter::encode_packet(mode, direction, name, payload) {
        let mut framed = ByteWriter::new();
        framed.write_varint(encoded.len() as i32);
        framed.write_raw(&encoded);
        let _ = outbound.send(Bytes::from(framed.into_inner()));
    }
}

/// Owns one end of the inter-proxy link: the framed socket, the session table it multiplexes onto
/// and the ordered compress/cipher pipelines for the poem channel.
pub struct LinkConnection {
    framed: Framed<TcpStream, LengthPrefixedCodec>,
    role: LinkRole,
    cipher: Option<LinkKey>,
    authenticated: bool,
    password: String,

    sessions: SessionTable,
    chunk_relay: Option<Arc<Mutex<ChunkCacheRelay>>>,
    toggle_rx: Option<mpsc::UnboundedReceiver<(i32, ChunkKey)>>,
    local_tx: Option<mpsc::UnboundedSender<LocalEvent>>,
    local_rx: Option<mpsc::UnboundedReceiver<LocalEvent>>,
    /// Internal-side-only: notified once per newly registered sentinel session, so the bootstrap
    /// layer knows to dial the real server again.
    add_conn_tx: Option<mpsc::UnboundedSender<()>>,

    /// Internal-side-only: the real Minecraft server's address, and whether to preserve the
    /// client's original handshake host/port rather than rewrite it. `None` on the external
    /// side, which never rewrites a handshake.
    real_addr: Option<(String, u16)>,
    ip_forwarding: bool,

    outbound_buffer: Vec<PoemItem>,
    flush_interval: Interval,

    compress_pool: Arc<WorkerPool<ByteTransform>>,
    compress_rx: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    compress_reassembler: Reassembler,

    cipher_pool: Arc<WorkerPool<ByteTransform>>,
    cipher_rx: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    cipher_reassembler: Reassembler,
}

impl LinkConnection {
    /// Wraps an established TCP socket as a link connection. `password` gates authentication
    /// (empty disables it); `cipher` is `None` when no shared secret is configured.
    #[must_use]
    pub fn new(socket: TcpStream, role: LinkRole, password: String, cipher: Option<LinkKey>, buffer_ms: u64) -> Self {
        let compress_transform: ByteTransform = Box::new(|bytes: &[u8]| Some(compression::compress(bytes)));
        let (compress_pool, compress_rx) = spawn_pool(compress_transform);

        let cipher_for_pool = cipher.clone();
        let cipher_transform: ByteTransform = Box::new(move |bytes: &[u8]| match &cipher_for_pool {
            Some(key) => Some(key.encrypt(bytes)),
            None => Some(bytes.to_vec()),
        });
        let (cipher_pool, cipher_rx) = spawn_pool(cipher_transform);

        let mut flush_interval = interval(Duration::from_millis(buffer_ms.max(1)));
        flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Self {
            framed: Framed::new(socket, LengthPrefixedCodec::new(MAX_LINK_FRAME)),
            role,
            cipher,
            authenticated: password.is_empty(),
            password,
            sessions: SessionTable::new(),
            chunk_relay: None,
            toggle_rx: None,
            local_tx: None,
            local_rx: None,
            add_conn_tx: None,
            real_addr: None,
            ip_forwarding: false,
            outbound_buffer: Vec::new(),
            flush_interval,
            compress_pool,
            compress_rx,
            compress_reassembler: Reassembler::new(),
            cipher_pool,
            cipher_rx,
            cipher_reassembler: Reassembler::new(),
        }
    }

    /// Mounts the internal side's chunk-cache relay, so inbound `toggle_chunk` notifications flip
    /// the right shared state.
    pub fn with_chunk_relay(mut self, relay: Arc<Mutex<ChunkCacheRelay>>) -> Self {
        self.chunk_relay = Some(relay);
        self
    }

    /// Mounts a channel the external-side chunk-cache modules use to request outbound
    /// `toggle_chunk` notifications.
    pub fn with_toggle_source(mut self, rx: mpsc::UnboundedReceiver<(i32, ChunkKey)>) -> Self {
        self.toggle_rx = Some(rx);
        self
    }

    /// Mounts the channel the side's bootstrap code uses to feed locally-originated socket events
    /// ([`LocalEvent`]) into this link's event loop. `tx` is the sending half of the same
    /// channel -- kept so this connection can hand out further clones to reader tasks it spawns
    /// itself (e.g. once an `EmulatedConnected` socket's session id is resolved).
    pub fn with_local_events(mut self, tx: mpsc::UnboundedSender<LocalEvent>, rx: mpsc::UnboundedReceiver<LocalEvent>) -> Self {
        self.local_tx = Some(tx);
        self.local_rx = Some(rx);
        self
    }

    /// Mounts the channel the internal side's bootstrap listens on to learn when to dial the real
    /// server for a newly registered session.
    pub fn with_add_conn_notifications(mut self, tx: mpsc::UnboundedSender<()>) -> Self {
        self.add_conn_tx = Some(tx);
        self
    }

    /// Mounts the internal side's real-server address and `ip_forwarding` setting, used to
    /// rewrite serverbound `handshake` packets before they're delivered to the emulated client.
    pub fn with_server_rewrite(mut self, real_host: String, real_port: u16, ip_forwarding: bool) -> Self {
        self.real_addr = Some((real_host, real_port));
        self.ip_forwarding = ip_forwarding;
        self
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    /// Queues a decoded packet for this session to be folded into the next flush's poem. Called
    /// whenever a locally-accepted packet is ready to cross the link.
    pub fn enqueue(&mut self, session: SessionId, name: &'static str, payload: Bytes) {
        self.outbound_buffer.push(PoemItem { session, name, payload });
    }

    /// Sends `add_conn`/`delete_conn`/`release_queue` immediately, bypassing the poem batch.
    pub async fn send_control(&mut self, packet: ControlPacket) -> Result<(), LinkError> {
        self.framed.send(packet.encode()).await?;
        Ok(())
    }

    /// External-side entry point: presents the configured password as the link's first message,
    /// if one is configured.
    pub async fn authenticate_outbound(&mut self) -> Result<(), LinkError> {
        if self.password.is_empty() {
            return Ok(());
        }
        let (hash, salt) = auth::hash_with_fresh_salt(self.password.as_bytes());
        self.send_control(ControlPacket::Auth { salt, hash }).await
    }

    /// Drains the session's arrival queue (the external side's, per session.rs's invariant) and
    /// enqueues each held packet for the next flush, then marks the session's queue released.
    fn release_local_queue(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            let queued: Vec<QueuedPacket> = session.release_queue();
            for packet in queued {
                self.outbound_buffer.push(PoemItem {
                    session: id,
                    name: packet.name,
                    payload: packet.payload,
                });
            }
        }
    }

    /// Runs the link's event loop until the transport fails or is closed. Never returns `Ok` --
    /// the caller (external side: reconnect-with-backoff; internal side: wait for the next
    /// accepted connection) decides what happens after a link ends.
    pub async fn run(mut self) -> LinkError {
        loop {
            tokio::select! {
                biased;

                _ = self.flush_interval.tick() => {
                    if let Err(e) = self.on_flush_tick().await {
                        return e;
                    }
                }

                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => {
                            if let Err(e) = self.handle_inbound_frame(bytes).await {
                                if !matches!(e, LinkError::UnknownSession(_)) {
                                    return e;
                                }
                                warn!(error = %e, "dropping undeliverable link item");
                            }
                        }
                        Some(Err(e)) => return LinkError::Framing(e),
                        None => return LinkError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "link closed")),
                    }
                }

                Some((dimension, key)) = Self::recv_toggle(&mut self.toggle_rx) => {
                    if let Err(e) = self.send_control(ControlPacket::ToggleChunk { dimension, key }).await {
                        return e;
                    }
                }

                Some(event) = Self::recv_local(&mut self.local_rx) => {
                    if let Err(e) = self.handle_local_event(event).await {
                        return e;
                    }
                }
            }
        }
    }

    async fn recv_toggle(rx: &mut Option<mpsc::UnboundedReceiver<(i32, ChunkKey)>>) -> Option<(i32, ChunkKey)> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn recv_local(rx: &mut Option<mpsc::UnboundedReceiver<LocalEvent>>) -> Option<LocalEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handles one locally-originated socket event.
    async fn handle_local_event(&mut self, event: LocalEvent) -> Result<(), LinkError> {
        match event {
            LocalEvent::ExternalAccepted { id, outbound, modules, read_half } => {
                let mut session = ClientSession::new_queued(id, outbound);
                if let Some(local_tx) = self.local_tx.clone() {
                    session.reader_task = Some(tokio::spawn(read_socket_loop(id, read_half, local_tx)).abort_handle());
                }
                for module in modules {
                    session.modules.push(module);
                }
                session.modules.connect();
                self.sessions.insert(session);
                self.send_control(ControlPacket::AddConn(id)).await?;
            }

            LocalEvent::EmulatedConnected { outbound, read_half } => {
                // `read_half` is simply dropped (closing the socket) if there's no sentinel slot
                // waiting -- the bootstrap raced a session that was torn down in the meantime.
                let Some(id) = self.sessions.first_sentinel() else {
                    return Ok(());
                };
                if let Some(local_tx) = self.local_tx.clone() {
                    let reader_task = tokio::spawn(read_socket_loop(id, read_half, local_tx)).abort_handle();
                    if let Some(session) = self.sessions.get_mut(id) {
                        session.outbound = Some(outbound);
                        session.reader_task = Some(reader_task);
                        if let Some(relay) = &self.chunk_relay {
                            session.modules.push(Box::new(crate::chunk_cache_module::ChunkCacheRelayModule::new(relay.clone())));
                        }
                        session.modules.connect();
                    }
                }
                self.send_control(ControlPacket::ReleaseQueue(id)).await?;
            }

            LocalEvent::Frame { id, frame } => {
                self.handle_local_frame(id, frame);
            }

            LocalEvent::Closed { id } => {
                if let Some(mut session) = self.sessions.remove_and_abort(id) {
                    session.modules.disconnect();
                    self.send_control(ControlPacket::DeleteConn(id)).await?;
                }
            }
        }
        Ok(())
    }

    /// Decodes a frame read off a locally-owned socket, tracks its mode-transition effects,
    /// and either folds it into the session's arrival queue (external side, pre-release) or
    /// pushes it directly into the next poem (internal side, and the external side post-release).
    fn handle_local_frame(&mut self, id: SessionId, frame: Bytes) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let mode = session.mode;
        let direction = self.role.decode_direction();
        let Ok((name, payload)) = mc_adapter::decode_packet(mode, direction, &frame) else {
            return;
        };

        let (action, extra) = session.modules.dispatch(HandlerDirection::Send, name, &payload);
        let (name, payload) = match action {
            crate::module::PacketAction::Drop => return,
            crate::module::PacketAction::Replace(name, payload) => (name, payload),
            crate::module::PacketAction::Pass => (name, payload),
        };

        let mut next_mode = None;
        if name == "handshake" {
            if let Ok((_, parsed_mode)) = mc_adapter::rewrite_handshake(&payload, "", 0, true) {
                next_mode = Some(parsed_mode);
            }
        }

        let queued = session.enqueue(QueuedPacket { name, payload: payload.clone() });
        if let Some(parsed_mode) = next_mode {
            session.mode.advance_to(parsed_mode);
        }
        if name == "login_success" {
            session.mode.advance_to(ProtocolMode::Play);
        }

        if !queued {
            self.outbound_buffer.push(PoemItem { session: id, name, payload });
        }
        for (extra_name, extra_payload) in extra {
            self.outbound_buffer.push(PoemItem { session: id, name: extra_name, payload: extra_payload });
        }
    }

    async fn on_flush_tick(&mut self) -> Result<(), LinkError> {
        if !self.outbound_buffer.is_empty() {
            let items = std::mem::take(&mut self.outbound_buffer);
            let body = encode_poem_body(&items);
            self.compress_pool.submit(body);
        }

        for compressed in workpool::drain_ready(&mut self.compress_reassembler, &mut self.compress_rx) {
            self.cipher_pool.submit(compressed);
        }

        for sealed in workpool::drain_ready(&mut self.cipher_reassembler, &mut self.cipher_rx) {
            let mut frame = ByteWriter::new();
            frame.write_varint(LINK_POEM);
            frame.write_raw(&sealed);
            self.framed.send(frame.into_inner()).await?;
        }

        Ok(())
    }

    async fn handle_inbound_frame(&mut self, frame: BytesMut) -> Result<(), LinkError> {
        let mut reader = ByteReader::new(&frame[..]);
        let id: i32 = reader.read_varint().map_err(LinkError::from)?;
        let body = reader.read_remaining();

        if !self.authenticated {
            if id != LINK_AUTH {
                return Err(LinkError::Unauthenticated);
            }
            let ControlPacket::Auth { salt, hash } = ControlPacket::decode(id, &body)? else {
                unreachable!("LINK_AUTH always decodes to ControlPacket::Auth")
            };
            if !auth::verify(self.password.as_bytes(), &salt, &hash) {
                return Err(LinkError::AuthenticationFailed);
            }
            self.authenticated = true;
            debug!("link peer authenticated");
            return Ok(());
        }

        if id == LINK_POEM {
            return self.handle_inbound_poem(body).await;
        }

        match ControlPacket::decode(id, &body)? {
            ControlPacket::AddConn(session_id) => {
                if !self.sessions.contains(session_id) {
                    self.sessions.insert(crate::session::ClientSession::new_sentinel(session_id));
                    if let Some(tx) = &self.add_conn_tx {
                        let _ = tx.send(());
                    }
                }
            }
            ControlPacket::DeleteConn(session_id) => {
                if let Some(mut session) = self.sessions.remove_and_abort(session_id) {
                    session.modules.disconnect();
                }
            }
            ControlPacket::ReleaseQueue(session_id) => {
                self.release_local_queue(session_id);
            }
            ControlPacket::Auth { .. } => {
                // re-auth mid-session isn't meaningful; ignore rather than tear down the link.
            }
            ControlPacket::ToggleChunk { dimension, key } => {
                if let Some(relay) = &self.chunk_relay {
                    relay.lock().unwrap().on_toggle_chunk(dimension, key);
                }
            }
        }
        Ok(())
    }

    async fn handle_inbound_poem(&mut self, body: Vec<u8>) -> Result<(), LinkError> {
        let decrypted = match &self.cipher {
            Some(key) => {
                let key = key.clone();
                tokio::task::spawn_blocking(move || key.decrypt(&body))
                    .await
                    .map_err(|e| LinkError::Transport(io::Error::other(e)))?
                    .ok_or(LinkError::Decrypt)?
            }
            None => body,
        };

        let decompressed = tokio::task::spawn_blocking(move || compression::decompress(&decrypted))
            .await
            .map_err(|e| LinkError::Transport(io::Error::other(e)))?
            .ok_or(LinkError::Compress { index: 0 })?;

        for item in parse_poem_items(&decompressed) {
            self.dispatch_poem_item(item)?;
        }
        Ok(())
    }

    /// Delivers one poem item to its session. A session that the peer still has queued work
    /// for but that has already been torn down locally (a normal race with `DeleteConn`) is
    /// reported as [`LinkError::UnknownSession`] rather than silently dropped, so the caller
    /// can log it without tearing down the whole link.
    fn dispatch_poem_item(&mut self, item: PoemItem) -> Result<(), LinkError> {
        let Some(session) = self.sessions.get_mut(item.session) else {
            return Err(LinkError::UnknownSession(item.session));
        };

        let (action, extra) = session
            .modules
            .dispatch(HandlerDirection::Send, item.name, &item.payload);

        let mode = session.mode;
        let direction = self.role.forward_direction();
        let outbound = session.outbound.clone();

        let Some(outbound) = outbound else {
            return Ok(());
        };

        let (name, payload) = match action {
            crate::module::PacketAction::Pass => (item.name, item.payload.clone()),
            crate::module::PacketAction::Replace(name, payload) => (name, payload),
            crate::module::PacketAction::Drop => {
                for (extra_name, extra_payload) in extra {
                    deliver(mode, direction, &outbound, extra_name, &extra_payload);
                }
                return Ok(());
            }
        };

        // Serverbound handshake is rewritten to the real server's address right before delivery
        // to the internal side's emulated client; the external side never rewrites.
        let (name, payload, next_mode) = if name == "handshake" {
            match &self.real_addr {
                Some((real_host, real_port)) => match mc_adapter::rewrite_handshake(&payload, real_host, *real_port, self.ip_forwarding) {
                    Ok((rewritten, next_mode)) => ("handshake", Bytes::from(rewritten), Some(next_mode)),
                    Err(_) => (name, payload, None),
                },
                None => (name, payload, None),
            }
        } else {
            (name, payload, None)
        };

        deliver(mode, direction, &outbound, name, &payload);
        for (extra_name, extra_payload) in extra {
            deliver(mode, direction, &outbound, extra_name, &extra_payload);
        }

        if let Some(session) = self.sessions.get_mut(item.session) {
            if let Some(next_mode) = next_mode {
                session.mode.advance_to(next_mode);
            }
            if name == "login_success" {
                session.mode.advance_to(ProtocolMode::Play);
            }
        }

        Ok(())
    }
}

/// Opens the external-side link connection, with exponential backoff between attempts. The
/// external proxy is always the connector and reconnects with backoff on any failure; the
/// internal proxy only ever listens. Returns once a socket is established and authenticated; the
/// caller owns the resulting [`LinkConnection`]'s lifetime from there.
pub async fn connect_with_backoff(addr: &str, role: LinkRole, password: String, cipher: Option<LinkKey>, buffer_ms: u64) -> LinkConnection {
    let mut backoff = Duration::from_millis(200);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        match TcpStream::connect(addr).await {
            Ok(socket) => {
                let mut link = LinkConnection::new(socket, role, password.clone(), cipher.clone(), buffer_ms);
                if link.authenticate_outbound().await.is_ok() {
                    return link;
                }
                warn!(addr, "link authentication failed, retrying");
            }
            Err(e) => {
                warn!(addr, error = %e, backoff_ms = backoff.as_millis(), "link connect failed, backing off");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Resolves the decode direction for packets arriving on a locally-owned socket
/// before they're queued onto the link.
#[must_use]
pub fn local_decode_direction(role: LinkRole) -> Direction {
    role.decode_direction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[test]
    fn poem_item_roundtrips_through_encode_parse() {
        let item = PoemItem {
            session: SessionId::new(),
            name: "chunk_data",
            payload: Bytes::from_static(b"abc123"),
        };
        let body = encode_poem_body(&[item.clone()]);
        let parsed = parse_poem_items(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].session, item.session);
        assert_eq!(parsed[0].name, "chunk_data");
        assert_eq!(parsed[0].payload, item.payload);
    }

    #[test]
    fn multiple_poem_items_preserve_order() {
        let items: Vec<PoemItem> = (0..5)
            .map(|i| PoemItem {
                session: SessionId::new(),
                name: "ping",
                payload: Bytes::from(vec![i as u8]),
            })
            .collect();
        let body = encode_poem_body(&items);
        let parsed = parse_poem_items(&body);
        assert_eq!(parsed.len(), 5);
        for (original, got) in items.iter().zip(parsed.iter()) {
            assert_eq!(original.session, got.session);
            assert_eq!(original.payload, got.payload);
        }
    }

    #[test]
    fn truncated_trailing_item_is_discarded_not_fatal() {
        let item = PoemItem {
            session: SessionId::new(),
            name: "ping",
            payload: Bytes::from_static(b"x"),
        };
        let mut body = encode_poem_body(&[item]);
        body.truncate(body.len() - 2);
        let parsed = parse_poem_items(&body);
        assert!(parsed.is_empty());
    }

    #[test]
    fn control_packet_roundtrips() {
        let id = SessionId::new();
        let packet = ControlPacket::AddConn(id);
        let encoded = packet.encode();
        let mut reader = ByteReader::new(&encoded);
        let read_id = reader.read_varint().unwrap();
        let body = reader.read_remaining();
        let decoded = ControlPacket::decode(read_id, &body).unwrap();
        assert!(matches!(decoded, ControlPacket::AddConn(decoded_id) if decoded_id == id));
    }

    #[test]
    fn auth_control_packet_roundtrips() {
        let (hash, salt) = auth::hash_with_fresh_salt(b"hunter2");
        let packet = ControlPacket::Auth {
            salt: salt.clone(),
            hash: hash.clone(),
        };
        let encoded = packet.encode();
        let mut reader = ByteReader::new(&encoded);
        let read_id = reader.read_varint().unwrap();
        let body = reader.read_remaining();
        match ControlPacket::decode(read_id, &body).unwrap() {
            ControlPacket::Auth { salt: s, hash: h } => {
                assert_eq!(s, salt);
                assert_eq!(h, hash);
                assert!(auth::verify(b"hunter2", &s, &h));
            }
            _ => panic!("expected Auth"),
        }
    }

    #[test]
    fn toggle_chunk_control_packet_roundtrips() {
        let key = ChunkKey::new(4, -9);
        let packet = ControlPacket::ToggleChunk { dimension: -1, key };
        let encoded = packet.encode();
        let mut reader = ByteReader::new(&encoded);
        let read_id = reader.read_varint().unwrap();
        let body = reader.read_remaining();
        match ControlPacket::decode(read_id, &body).unwrap() {
            ControlPacket::ToggleChunk { dimension, key: decoded_key } => {
                assert_eq!(dimension, -1);
                assert_eq!(decoded_key, key);
            }
            _ => panic!("expected ToggleChunk"),
        }
    }

    #[test]
    fn role_forward_and_decode_directions_are_consistent() {
        assert_eq!(LinkRole::External.forward_direction(), Direction::Upstream);
        assert_eq!(LinkRole::External.decode_direction(), Direction::Downstream);
        assert_eq!(LinkRole::Internal.forward_direction(), Direction::Downstream);
        assert_eq!(LinkRole::Internal.decode_direction(), Direction::Upstream);
    }
}
